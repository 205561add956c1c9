use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position and quality of a GPS solution as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GpsSnapshot {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude above mean sea level in millimetres
    pub altitude_mm: f64,
    /// Satellites used in the solution
    pub satellites: i32,
    /// Horizontal accuracy estimate in millimetres
    pub horizontal_accuracy_mm: u32,
}

/// Telemetry test packet exchanged between sender and receiver
#[derive(Debug, Clone, PartialEq)]
pub struct TestPacket {
    /// Strictly increasing per sender session
    pub sequence_number: u32,
    /// Sender wall clock at transmission, microseconds since the Unix epoch
    pub sender_timestamp_us: i64,
    /// Sender position at transmission
    pub sender_gps: GpsSnapshot,
    /// Filler simulating a telemetry message body
    pub payload: Bytes,
}

impl TestPacket {
    /// Builds a packet with the deterministic payload for `sequence_number`
    pub fn new(
        sequence_number: u32,
        sender_timestamp_us: i64,
        sender_gps: GpsSnapshot,
        payload_len: usize,
    ) -> Self {
        TestPacket {
            sequence_number,
            sender_timestamp_us,
            sender_gps,
            payload: payload_pattern(sequence_number, payload_len),
        }
    }

    /// Whether the payload carries the pattern derived from the sequence number
    pub fn has_expected_payload(&self) -> bool {
        self.payload
            .iter()
            .enumerate()
            .all(|(i, b)| *b == pattern_byte(self.sequence_number, i))
    }
}

/// Non-repeating payload: byte `i` is `(i + sequence) mod 256`
pub fn payload_pattern(sequence_number: u32, len: usize) -> Bytes {
    (0..len).map(|i| pattern_byte(sequence_number, i)).collect::<Vec<u8>>().into()
}

fn pattern_byte(sequence_number: u32, index: usize) -> u8 {
    ((index as u64 + u64::from(sequence_number)) % 256) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_pattern() {
        let payload = payload_pattern(3, 300);
        assert_eq!(payload.len(), 300);
        assert_eq!(payload[0], 3);
        assert_eq!(payload[252], 255);
        assert_eq!(payload[253], 0);

        let wrapped = payload_pattern(u32::MAX, 2);
        assert_eq!(&wrapped[..], &[255, 0]);
    }

    #[test]
    fn test_packet_creation() {
        let gps = GpsSnapshot {
            latitude: -33.86,
            longitude: 151.21,
            altitude_mm: 58_000.0,
            satellites: 12,
            horizontal_accuracy_mm: 1400,
        };
        let packet = TestPacket::new(42, 1_700_000_000_000_000, gps, 75);

        assert_eq!(packet.sequence_number, 42);
        assert_eq!(packet.payload.len(), 75);
        assert_eq!(packet.payload[0], 42);
        assert!(packet.has_expected_payload());

        let mut tampered = packet.clone();
        tampered.payload = Bytes::from_static(&[0, 0, 0]);
        assert!(!tampered.has_expected_payload());
    }
}

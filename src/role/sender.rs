use std::time::Duration;

use tracing::{debug, warn};

use crate::network::Transport;
use crate::protocol::{GpsSnapshot, PacketCodec, TestPacket};
use crate::time::WallClock;

/// Counters of a sender session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Frames the radio accepted
    pub sent: u64,
    /// Frames the radio refused at submission
    pub failed: u64,
}

/// One paced transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAttempt {
    pub sequence_number: u32,
    pub accepted: bool,
}

/// Generates test packets at a fixed rate
///
/// Every attempt consumes a sequence number whether or not the radio took
/// the frame, so the receiver counts refused frames as lost. Nothing is
/// retried.
pub struct Sender {
    codec: PacketCodec,
    period: Duration,
    next_sequence: u32,
    last_send: Option<Duration>,
    stats: SenderStats,
}

impl Sender {
    pub fn new(codec: PacketCodec, period: Duration) -> Self {
        Sender {
            codec,
            period,
            next_sequence: 0,
            last_send: None,
            stats: SenderStats::default(),
        }
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    fn is_due(&self, now: Duration) -> bool {
        match self.last_send {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.period,
        }
    }

    /// Sends the next packet when a period has passed since the last one
    ///
    /// `now` is monotonic time since the control loop started. The first
    /// call always sends.
    pub fn tick(
        &mut self,
        now: Duration,
        transport: &mut dyn Transport,
        clock: &dyn WallClock,
        position: GpsSnapshot,
    ) -> Option<SendAttempt> {
        if !self.is_due(now) {
            return None;
        }

        let timestamp_us = match clock.now_us() {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Cannot timestamp packet {}: {}", self.next_sequence, e);
                return None;
            }
        };
        self.last_send = Some(now);

        let sequence_number = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let packet = TestPacket::new(sequence_number, timestamp_us, position, self.codec.payload_len());
        let accepted = match self.codec.encode_packet(&packet) {
            Ok(frame) => transport.send(&frame),
            Err(e) => {
                warn!("Failed to encode packet {}: {}", sequence_number, e);
                false
            }
        };

        if accepted {
            self.stats.sent += 1;
            debug!("Sent packet {} at {} us", sequence_number, timestamp_us);
        } else {
            self.stats.failed += 1;
            warn!("Send failed for packet {}", sequence_number);
        }

        Some(SendAttempt {
            sequence_number,
            accepted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceRole, Result, TransportKind};
    use crate::network::{FrameHandler, RadioSettings};
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Records submitted frames and refuses the listed sequence numbers
    #[derive(Default)]
    struct RecordingTransport {
        frames: Vec<TestPacket>,
        refuse: HashSet<u32>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn initialize(&mut self, _: u8, _: i8, _: DeviceRole) -> Result<RadioSettings> {
            unreachable!("not used by the sender")
        }

        fn send(&mut self, frame: &[u8]) -> bool {
            let packet = PacketCodec::new(75).decode_frame(frame).unwrap();
            let accepted = !self.refuse.contains(&packet.sequence_number);
            self.frames.push(packet);
            accepted
        }

        fn on_receive(&mut self, _handler: Box<dyn FrameHandler>) {}

        fn dispatch_pending(&mut self) -> usize {
            0
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Wifi4
        }

        fn settings(&self) -> Option<&RadioSettings> {
            None
        }
    }

    fn sender_10hz() -> Sender {
        Sender::new(PacketCodec::new(75), Duration::from_millis(100))
    }

    #[test]
    fn test_pacing_over_one_second() {
        let mut sender = sender_10hz();
        let mut transport = RecordingTransport::default();
        let clock = ManualClock::new(1_700_000_000_000_000);

        let mut sent_at = Vec::new();
        for ms in 0..1_000u64 {
            let now = Duration::from_millis(ms);
            if sender.tick(now, &mut transport, &clock, GpsSnapshot::default()).is_some() {
                sent_at.push(now);
            }
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(transport.frames.len(), 10);
        let seqs: Vec<u32> = transport.frames.iter().map(|p| p.sequence_number).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u32>>());
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        for pair in transport.frames.windows(2) {
            assert!(pair[1].sender_timestamp_us - pair[0].sender_timestamp_us >= 100_000);
        }
        assert!(transport.frames.iter().all(|p| p.has_expected_payload()));
        assert_eq!(sender.stats(), SenderStats { sent: 10, failed: 0 });
    }

    #[test]
    fn test_first_tick_sends_immediately() {
        let mut sender = sender_10hz();
        let mut transport = RecordingTransport::default();
        let clock = ManualClock::new(0);

        let attempt = sender
            .tick(Duration::from_secs(42), &mut transport, &clock, GpsSnapshot::default())
            .unwrap();
        assert_eq!(attempt, SendAttempt { sequence_number: 0, accepted: true });
        assert!(sender
            .tick(Duration::from_millis(42_099), &mut transport, &clock, GpsSnapshot::default())
            .is_none());
    }

    #[test]
    fn test_failed_send_is_not_retried() {
        let mut sender = sender_10hz();
        let mut transport = RecordingTransport {
            refuse: [3].into_iter().collect(),
            ..Default::default()
        };
        let clock = ManualClock::new(0);

        let mut attempts = Vec::new();
        for i in 0..6u64 {
            let now = Duration::from_millis(i * 100);
            attempts.extend(sender.tick(now, &mut transport, &clock, GpsSnapshot::default()));
        }

        assert_eq!(attempts[3], SendAttempt { sequence_number: 3, accepted: false });
        assert_eq!(attempts[4], SendAttempt { sequence_number: 4, accepted: true });
        // Packet 3 was submitted exactly once
        let threes = transport.frames.iter().filter(|p| p.sequence_number == 3).count();
        assert_eq!(threes, 1);
        assert_eq!(sender.stats(), SenderStats { sent: 5, failed: 1 });
        assert_eq!(sender.next_sequence(), 6);
    }

    #[test]
    fn test_clock_failure_skips_without_consuming_sequence() {
        let mut sender = sender_10hz();
        let mut transport = RecordingTransport::default();
        let clock = ManualClock::new(0);
        clock.set_failing(true);

        assert!(sender.tick(Duration::ZERO, &mut transport, &clock, GpsSnapshot::default()).is_none());
        assert!(transport.frames.is_empty());

        clock.set_failing(false);
        let attempt = sender
            .tick(Duration::from_millis(1), &mut transport, &clock, GpsSnapshot::default())
            .unwrap();
        assert_eq!(attempt.sequence_number, 0);
    }
}

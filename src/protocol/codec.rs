use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result};
use super::packet::{GpsSnapshot, TestPacket};
use super::HEADER_LEN;

/// Fixed-size test packet codec
///
/// Every buffer handed to the decoder is one complete datagram or radio
/// frame. A buffer whose length is exactly [`frame_len`](Self::frame_len)
/// is telemetry; any other length is discarded without an error, which is
/// how unrelated traffic on the same port or channel is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    payload_len: usize,
}

impl PacketCodec {
    /// Creates a codec for packets carrying `payload_len` payload bytes
    pub fn new(payload_len: usize) -> Self {
        PacketCodec { payload_len }
    }

    /// Payload bytes per packet
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Size of one encoded packet
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    /// Encodes a packet into a standalone frame
    pub fn encode_packet(&self, packet: &TestPacket) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.frame_len());
        self.write_packet(packet, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decodes a frame, or returns `None` when its length is not ours
    pub fn decode_frame(&self, mut frame: &[u8]) -> Option<TestPacket> {
        if frame.len() != self.frame_len() {
            return None;
        }

        let sequence_number = frame.get_u32_le();
        let sender_timestamp_us = frame.get_i64_le();
        let sender_gps = GpsSnapshot {
            latitude: frame.get_f64_le(),
            longitude: frame.get_f64_le(),
            altitude_mm: frame.get_f64_le(),
            satellites: frame.get_i32_le(),
            horizontal_accuracy_mm: frame.get_u32_le(),
        };
        let payload = Bytes::copy_from_slice(frame);

        Some(TestPacket {
            sequence_number,
            sender_timestamp_us,
            sender_gps,
            payload,
        })
    }

    fn write_packet(&self, packet: &TestPacket, dst: &mut BytesMut) -> Result<()> {
        if packet.payload.len() != self.payload_len {
            return Err(Error::protocol(format!(
                "payload is {} bytes, wire format carries {}",
                packet.payload.len(),
                self.payload_len
            )));
        }

        dst.reserve(self.frame_len());
        dst.put_u32_le(packet.sequence_number);
        dst.put_i64_le(packet.sender_timestamp_us);
        dst.put_f64_le(packet.sender_gps.latitude);
        dst.put_f64_le(packet.sender_gps.longitude);
        dst.put_f64_le(packet.sender_gps.altitude_mm);
        dst.put_i32_le(packet.sender_gps.satellites);
        dst.put_u32_le(packet.sender_gps.horizontal_accuracy_mm);
        dst.extend_from_slice(&packet.payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = TestPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // The whole buffer is one frame; consume it either way
        let frame = src.split();
        Ok(self.decode_frame(&frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        self.decode(src)
    }
}

impl Encoder<TestPacket> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: TestPacket, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        self.write_packet(&item, dst)
    }
}

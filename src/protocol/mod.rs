//! Wire format module
//!
//! This module defines the telemetry test packet and its fixed-size,
//! little-endian encoding. Frame length is the only thing that tells a test
//! packet apart from other traffic.

pub mod codec;
pub mod packet;

pub use self::codec::PacketCodec;
pub use self::packet::{payload_pattern, GpsSnapshot, TestPacket};

// Constants
/// Bytes ahead of the payload: u32 + i64 + 3 x f64 + i32 + u32
pub const HEADER_LEN: usize = 4 + 8 + 8 + 8 + 8 + 4 + 4;

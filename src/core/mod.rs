//! Core types and configuration for linkprobe
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

pub use self::config::{
    GpsConfig, LinkConfig, LogConfig, LogFormat, NodeConfig, RegulatoryConfig, TimeSyncConfig,
    WifiConfig,
};
pub use self::error::{Error, Result};
pub use self::types::{DeviceRole, MacAddress, TransportKind};

/// Regulatory region applied by default (Australia)
pub const DEFAULT_COUNTRY: &str = "AU";

/// Australian regulatory ceiling of 30 dBm EIRP (1 W)
pub const MAX_TX_POWER_DBM: i8 = 30;

/// UDP data port shared by the access point and the station
pub const DATA_PORT: u16 = 5005;

/// UDP port of the host emulation of the link-layer medium
pub const LINK_EMULATION_PORT: u16 = 5006;

/// GPS-UTC offset in seconds as of 2017-01-01
pub const GPS_LEAP_SECONDS: i64 = 18;

/// Clock offsets above one second are hard-set rather than slewed
pub const STEP_THRESHOLD_US: i64 = 1_000_000;

/// Default payload size, sized like a MAVLink telemetry message
pub const DEFAULT_PAYLOAD_SIZE: usize = 75;

/// Lowest 2.4 GHz channel
pub const MIN_CHANNEL: u8 = 1;

/// Highest 2.4 GHz channel
pub const MAX_CHANNEL: u8 = 14;

/// Largest link-layer frame
pub const LINK_MAX_FRAME_LEN: usize = 250;

/// Largest unfragmented UDP payload on a 1500-byte MTU
pub const UDP_MAX_FRAME_LEN: usize = 1472;

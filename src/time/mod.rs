//! Time and position sources
//!
//! This module provides the two references every latency figure depends on:
//!
//! - The node's wall clock, readable by everyone and written only by the
//!   time synchroniser ([`WallClock`])
//! - A GPS receiver supplying absolute time and position ([`GpsSource`])
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use linkprobe::core::GpsConfig;
//! use linkprobe::time::{wait_for_fix, FixWait, NmeaGps, SoftClock, WallClock};
//!
//! #[tokio::main]
//! async fn main() -> linkprobe::Result<()> {
//!     let clock = Arc::new(SoftClock::new());
//!     let mut gps = NmeaGps::open(&GpsConfig::default(), 18)?;
//!
//!     let fix = wait_for_fix(&mut gps, FixWait::Forever).await?;
//!     println!("week {} tow {} ms, local {}", fix.week, fix.ms_into_week, clock.now_us()?);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod gps;
pub mod nmea;

pub use self::clock::{ClockWrite, ManualClock, SharedClock, SoftClock, SystemClock, WallClock};
pub use self::gps::{wait_for_fix, FixType, FixWait, GpsFix, GpsSource, SimulatedGps};
pub use self::nmea::{NmeaGps, NmeaParser};

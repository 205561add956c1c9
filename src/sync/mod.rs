//! Synchronization module
//!
//! GPS-derived clock synchronization. Each node compares its wall clock with
//! the absolute time reported by its own GPS receiver and corrects it, so two
//! nodes never need to talk to each other to agree on time.

pub mod epoch;
pub mod manager;

pub use self::epoch::{absolute_to_gps_time, gps_time_to_absolute};
pub use self::manager::{classify_offset, ClockOffset, SyncAction, SyncOutcome, TimeSync};

//! linkprobe: GPS-synchronised one-way latency and packet loss measurement
//!
//! Two nodes, a sender and a receiver, exchange fixed-size test packets over
//! an interchangeable radio transport. Each node disciplines its own wall
//! clock against its own GPS receiver, so the receiver can subtract the
//! sender's timestamp from its own without any round trip between them.
pub mod cli;
pub mod core;
pub mod network;
pub mod protocol;
pub mod record;
pub mod role;
pub mod sync;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use core::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

//! Sender and receiver roles
//!
//! A node runs exactly one role for its whole life. Both roles share the
//! bring-up sequence in [`node`]: radio up, wait for a GPS fix, force the
//! clock onto GPS time, then run the role's periodic work.

pub mod node;
pub mod receiver;
pub mod sender;

pub use self::node::{Node, GPS_STATUS_INTERVAL};
pub use self::receiver::{LinkContext, LossTracker, Receiver};
pub use self::sender::{SendAttempt, Sender, SenderStats};

/// Lifecycle of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Uninitialized,
    Initializing,
    /// Terminal; there is no shutdown path
    Running,
}

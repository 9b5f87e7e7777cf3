//! Binary RPC transport.
//!
//! Each call is one length-prefixed frame over a persistent TCP connection:
//! a method byte followed by the typed request fields. Replies start with a
//! status byte; a non-zero status carries an [`ErrorCode`](lockstep_core::ErrorCode)
//! and a message that the client turns back into an engine error.

use std::time::Duration;

pub mod client;
pub mod codec;
pub mod frame;
pub mod messages;
pub mod server;

pub use client::RpcEngineClient;
pub use codec::RpcAdapter;
pub use server::RpcEngineServer;

/// Per-call deadline for a configured timeout. Zero disables the deadline;
/// anything shorter than a millisecond is raised to one.
pub fn effective_deadline(configured: Duration) -> Option<Duration> {
    if configured.is_zero() {
        None
    } else {
        Some(configured.max(Duration::from_millis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_deadline() {
        assert_eq!(effective_deadline(Duration::ZERO), None);
        assert_eq!(
            effective_deadline(Duration::from_micros(10)),
            Some(Duration::from_millis(1))
        );
        assert_eq!(
            effective_deadline(Duration::from_secs(2)),
            Some(Duration::from_secs(2))
        );
    }
}

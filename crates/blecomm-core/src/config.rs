//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timers and bounds of the per-link protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Budget for the whole handshake, link-up to connection response.
    pub handshake_timeout: Duration,
    /// Retransmit interval for an unacknowledged sub-message.
    pub ack_timeout: Duration,
    /// How long to wait for the disconnection notice to be acknowledged
    /// before issuing the OS-level disconnect anyway.
    pub disconnect_ack_timeout: Duration,
    /// How long a dropped link may try to recover before the channel gives
    /// up and disconnects for good.
    pub reconnection_timeout: Duration,
    /// Ring capacity for per-channel duplicate suppression. Message ids are
    /// monotonic per session, so a small ring is exact.
    pub recently_delivered_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(1),
            disconnect_ack_timeout: Duration::from_secs(5),
            reconnection_timeout: Duration::from_secs(30),
            recently_delivered_capacity: 32,
        }
    }
}

impl Config {
    /// Compressed timers for tests.
    pub fn testing() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(800),
            ack_timeout: Duration::from_millis(60),
            disconnect_ack_timeout: Duration::from_millis(200),
            reconnection_timeout: Duration::from_secs(5),
            recently_delivered_capacity: 8,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_wire_constants() {
        let config = Config::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.ack_timeout, Duration::from_secs(1));
        assert_eq!(config.disconnect_ack_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn testing_preset_is_faster_than_default() {
        let fast = Config::testing();
        let slow = Config::default();
        assert!(fast.ack_timeout < slow.ack_timeout);
        assert!(fast.handshake_timeout < slow.handshake_timeout);
        assert!(fast.reconnection_timeout < slow.reconnection_timeout);
    }
}

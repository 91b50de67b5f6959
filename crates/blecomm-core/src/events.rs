//! Application-facing events and operation return codes.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::peer::Peer;

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Which side of a link we are on. Centrals initiate connections and issue
/// characteristic writes; peripherals advertise and issue notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => write!(f, "central"),
            Role::Peripheral => write!(f, "peripheral"),
        }
    }
}

// ----------------------------------------------------------------------------
// Return codes
// ----------------------------------------------------------------------------

/// Result of a communicator operation, with the wire-stable integer codes
/// applications may persist or log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    AlreadyStarted,
    AlreadyStopped,
    NotMainThread,
    Destroying,
    BluetoothLeNotSupported,
    Error,
}

impl OpStatus {
    pub fn code(self) -> i32 {
        match self {
            OpStatus::Success => 0,
            OpStatus::Error => -1,
            OpStatus::AlreadyStarted => -3,
            OpStatus::AlreadyStopped => -4,
            OpStatus::NotMainThread => -5,
            OpStatus::Destroying => -6,
            OpStatus::BluetoothLeNotSupported => -7,
        }
    }

    pub fn is_success(self) -> bool {
        self == OpStatus::Success
    }
}

/// Why an outbound connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFailReason {
    /// The remote application rejected the connection request.
    Rejected,
    /// Handshake timeout or a link-level failure.
    Error,
}

impl ConnectFailReason {
    pub fn code(self) -> i32 {
        match self {
            ConnectFailReason::Rejected => 1,
            ConnectFailReason::Error => -1,
        }
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Everything the communicator reports to the application, delivered in
/// order on each subscriber channel.
#[derive(Debug, Clone)]
pub enum Event {
    AdvertiseStarted,
    AdvertiseStopped,
    DiscoveryStarted,
    DiscoveryStopped,
    /// A device advertising the service was found by the scanner.
    PeerFound { peer: Peer },
    /// A found device went out of range or stopped advertising.
    PeerLost { peer: Peer },
    /// A found or connected peer changed (name, device handle); replace any
    /// stored copy with `new`.
    PeerUpdated { old: Peer, new: Peer },
    /// A remote central asked to connect; answer with `accept_connection`
    /// or `reject_connection`.
    ConnectionRequest { peer: Peer },
    /// The handshake completed; messages can flow until `Disconnected`.
    ConnectionSuccess { peer: Peer, role: Role },
    ConnectionFailed {
        peer: Peer,
        reason: ConnectFailReason,
    },
    /// The link dropped unexpectedly; recovery is in progress. Messages
    /// sent meanwhile are queued and delivered after the reconnection.
    ConnectionLost { peer: Peer },
    ConnectionResumed { peer: Peer },
    /// A text message arrived; `message.sender()` identifies the peer.
    MessageReceived { message: Message, role: Role },
    /// A binary message arrived.
    DataReceived { message: Message, role: Role },
    /// The peer is gone; `peers_left` counts the remaining connections.
    Disconnected { peer: Peer, peers_left: usize },
    /// The OS never reported the link down; the radio is being restarted to
    /// force the teardown.
    DisconnectionFailed,
    BluetoothLeNotSupported,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_status_codes_are_wire_stable() {
        assert_eq!(OpStatus::Success.code(), 0);
        assert_eq!(OpStatus::Error.code(), -1);
        assert_eq!(OpStatus::AlreadyStarted.code(), -3);
        assert_eq!(OpStatus::AlreadyStopped.code(), -4);
        assert_eq!(OpStatus::NotMainThread.code(), -5);
        assert_eq!(OpStatus::Destroying.code(), -6);
        assert_eq!(OpStatus::BluetoothLeNotSupported.code(), -7);
    }

    #[test]
    fn connect_fail_codes_are_wire_stable() {
        assert_eq!(ConnectFailReason::Rejected.code(), 1);
        assert_eq!(ConnectFailReason::Error.code(), -1);
    }
}

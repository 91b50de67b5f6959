//! Remote-device identity and live-link status.

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Random characters appended to the user-chosen name to form the advertised
/// `unique_name`. The suffix disambiguates devices sharing a display name
/// and stays stable across reconnections.
pub const NAME_SUFFIX_CHARS: usize = 2;

/// Advertised-name budget. BLE advertising beacons leave little room for a
/// device name next to the service UUID.
pub const ADVERTISED_NAME_MAX_BYTES: usize = 20;

// ----------------------------------------------------------------------------
// DeviceHandle
// ----------------------------------------------------------------------------

/// Opaque handle to a remote device as issued by the OS BLE stack. The
/// address is the only part the core inspects; two handles are the same
/// device exactly when their addresses match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    address: String,
}

impl DeviceHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// A device we can discover, connect to and exchange messages with.
///
/// `Peer` values handed to the application are snapshots: the authoritative
/// mutable state lives inside the owning channel, and a clone is cheap. The
/// application should compare peers by `unique_name`; the core compares by
/// device address where both sides have one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Peer {
    unique_name: String,
    name: String,
    device: Option<DeviceHandle>,
    hardware_connected: bool,
    connected: bool,
    reconnecting: bool,
    requesting_reconnection: bool,
    disconnecting: bool,
}

impl Peer {
    /// Build a peer from a scan result or inbound link. A `unique_name`
    /// shorter than the suffix is treated as unknown.
    pub fn new(device: Option<DeviceHandle>, unique_name: &str) -> Self {
        let mut peer = Self {
            device,
            ..Self::default()
        };
        peer.set_unique_name(unique_name);
        peer
    }

    /// The advertised name: user-chosen name plus the random suffix. Empty
    /// while the remote side has not introduced itself yet.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The user-facing name, with the suffix stripped.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub(crate) fn set_unique_name(&mut self, unique_name: &str) {
        let chars = unique_name.chars().count();
        if chars < NAME_SUFFIX_CHARS {
            return;
        }
        self.unique_name = unique_name.to_string();
        let keep = chars - NAME_SUFFIX_CHARS;
        self.name = unique_name.chars().take(keep).collect();
    }

    pub(crate) fn set_device(&mut self, device: DeviceHandle) {
        self.device = Some(device);
    }

    /// True while the OS reports a live link-layer connection, regardless of
    /// whether the protocol-level handshake has completed.
    pub fn is_hardware_connected(&self) -> bool {
        self.hardware_connected
    }

    /// True once the connection handshake has been accepted.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connected and not currently recovering from a link drop.
    pub fn is_fully_connected(&self) -> bool {
        self.connected && !self.reconnecting
    }

    /// True while the link has dropped and recovery is being attempted.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn is_requesting_reconnection(&self) -> bool {
        self.requesting_reconnection
    }

    /// True while a deliberate disconnection is in progress.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub(crate) fn set_hardware_connected(&mut self, hardware_connected: bool) {
        self.hardware_connected = hardware_connected;
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub(crate) fn set_reconnecting(&mut self, reconnecting: bool, connected: bool) {
        self.reconnecting = reconnecting;
        self.connected = connected;
    }

    pub(crate) fn set_requesting_reconnection(&mut self, requesting: bool) {
        if self.reconnecting || !requesting {
            self.requesting_reconnection = requesting;
        }
    }

    pub(crate) fn set_disconnecting(&mut self, disconnecting: bool) {
        self.disconnecting = disconnecting;
    }

    /// Device-level identity: equal addresses when both sides carry one.
    pub fn same_device(&self, other: &Peer) -> bool {
        match (&self.device, &other.device) {
            (Some(a), Some(b)) => a.address() == b.address(),
            _ => false,
        }
    }

    /// Logical identity across reconnections.
    pub fn same_unique_name(&self, other: &Peer) -> bool {
        !self.unique_name.is_empty() && self.unique_name == other.unique_name
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_splits_off_suffix() {
        let peer = Peer::new(None, "aliceXY");
        assert_eq!(peer.unique_name(), "aliceXY");
        assert_eq!(peer.name(), "alice");
    }

    #[test]
    fn short_unique_name_is_ignored() {
        let peer = Peer::new(None, "a");
        assert_eq!(peer.unique_name(), "");
        assert_eq!(peer.name(), "");
    }

    #[test]
    fn suffix_only_name_yields_empty_display_name() {
        let peer = Peer::new(None, "XY");
        assert_eq!(peer.unique_name(), "XY");
        assert_eq!(peer.name(), "");
    }

    #[test]
    fn multibyte_names_split_on_characters() {
        let peer = Peer::new(None, "héllo☃☄");
        assert_eq!(peer.name(), "héllo");
    }

    #[test]
    fn same_device_requires_both_addresses() {
        let a = Peer::new(Some(DeviceHandle::new("AA:BB")), "oneXY");
        let b = Peer::new(Some(DeviceHandle::new("AA:BB")), "twoXY");
        let c = Peer::new(None, "oneXY");
        assert!(a.same_device(&b));
        assert!(!a.same_device(&c));
        assert!(a.same_unique_name(&c));
    }

    #[test]
    fn requesting_reconnection_needs_reconnecting_state() {
        let mut peer = Peer::new(None, "aliceXY");
        peer.set_requesting_reconnection(true);
        assert!(!peer.is_requesting_reconnection());

        peer.set_reconnecting(true, false);
        peer.set_requesting_reconnection(true);
        assert!(peer.is_requesting_reconnection());

        peer.set_requesting_reconnection(false);
        assert!(!peer.is_requesting_reconnection());
    }

    #[test]
    fn fully_connected_excludes_reconnecting() {
        let mut peer = Peer::new(None, "aliceXY");
        peer.set_connected(true);
        assert!(peer.is_fully_connected());
        peer.set_reconnecting(true, true);
        assert!(!peer.is_fully_connected());
    }
}

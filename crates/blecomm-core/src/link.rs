//! Contract with the host OS BLE stack.
//!
//! The transport core never talks to a radio directly. A backend (BlueZ,
//! Core Bluetooth, Android, or the in-memory harness used by the test
//! suite) implements [`BleAdapter`] for adapter-wide operations and hands
//! out one [`LinkPort`] plus a [`LinkEvent`] stream per established link.
//!
//! Completion of [`LinkPort::write`] / [`LinkPort::notify`] is the
//! link-layer acknowledgement: the future resolves when the OS stack
//! delivers its characteristic-write or notification-sent callback.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkResult;
use crate::gatt::CharacteristicId;
use crate::peer::DeviceHandle;

// ----------------------------------------------------------------------------
// Link-level events
// ----------------------------------------------------------------------------

/// Inbound traffic and state changes of one link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A characteristic write (seen by the peripheral) or a value
    /// notification (seen by the central) from the remote device.
    Received {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    /// The OS stack reported STATE_DISCONNECTED for this link.
    Disconnected,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

// ----------------------------------------------------------------------------
// LinkPort
// ----------------------------------------------------------------------------

/// GATT primitives of one established link.
///
/// The OS stack permits one outstanding GATT operation per connection; the
/// core serializes its calls accordingly and implementations may assume no
/// two operations overlap.
#[async_trait]
pub trait LinkPort: Send + Sync {
    /// Write a characteristic value (central role). Resolves on the
    /// write-completed callback.
    async fn write(&self, characteristic: CharacteristicId, value: &[u8]) -> LinkResult<()>;

    /// Send a value notification (peripheral role). Resolves on the
    /// notification-sent callback.
    async fn notify(&self, characteristic: CharacteristicId, value: &[u8]) -> LinkResult<()>;

    /// Subscribe to notifications on a peripheral-to-central characteristic
    /// (central role).
    async fn subscribe(&self, characteristic: CharacteristicId) -> LinkResult<()>;

    /// Ask the OS to negotiate a larger link MTU (central role). Returns the
    /// granted usable payload size.
    async fn request_mtu(&self, mtu: u16) -> LinkResult<u16>;

    /// Usable payload bytes of one link-layer packet right now.
    fn mtu(&self) -> u16;

    /// Issue the OS-level disconnect primitive for this link.
    async fn close(&self) -> LinkResult<()>;
}

pub type SharedLink = Arc<dyn LinkPort>;

// ----------------------------------------------------------------------------
// Adapter-level events
// ----------------------------------------------------------------------------

/// Events of the adapter as a whole.
pub enum AdapterEvent {
    /// Radio power state changed.
    StateChanged { enabled: bool },
    /// Scan result: a device advertising the service.
    DeviceFound {
        device: DeviceHandle,
        advertised_name: String,
    },
    /// A previously found device went out of range or stopped advertising.
    DeviceLost { device: DeviceHandle },
    /// An inbound link-layer connection reached our GATT server.
    InboundLink {
        device: DeviceHandle,
        link: SharedLink,
        events: LinkEventReceiver,
    },
}

pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

// ----------------------------------------------------------------------------
// BleAdapter
// ----------------------------------------------------------------------------

/// The host OS BLE stack as seen by the communicator.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Whether this device supports BLE at all.
    fn is_le_supported(&self) -> bool;

    /// Current radio power state.
    fn is_enabled(&self) -> bool;

    /// Turn the radio on or off. State changes are reported through
    /// [`AdapterEvent::StateChanged`], also when triggered externally.
    async fn set_enabled(&self, enabled: bool) -> LinkResult<()>;

    /// Advertise the service under `unique_name`. Calling again while
    /// advertising refreshes the advertised name.
    async fn start_advertising(&self, unique_name: &str) -> LinkResult<()>;

    async fn stop_advertising(&self) -> LinkResult<()>;

    /// Scan for devices advertising the service.
    async fn start_scanning(&self) -> LinkResult<()>;

    async fn stop_scanning(&self) -> LinkResult<()>;

    /// Initiate an outbound link to `device`. Resolves on link-up with the
    /// link's port and event stream.
    async fn connect(&self, device: &DeviceHandle) -> LinkResult<(SharedLink, LinkEventReceiver)>;

    /// Take the adapter's event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<AdapterEventReceiver>;
}

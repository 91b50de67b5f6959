//! In-memory virtual BLE adapter.
//!
//! A [`VirtualBus`] is a shared airspace: every [`VirtualAdapter`] created
//! from it is one radio. Advertising radios are visible to scanning
//! radios, outbound connects produce paired in-memory links, and writes on
//! one side surface as receive events on the other — enough to drive full
//! communicators against each other without hardware.
//!
//! The bus also injects faults: it can drop a number of application-level
//! acknowledgements on a link (forcing retransmission) and sever links
//! (an unsolicited STATE_DISCONNECTED on both sides).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tracing::debug;

use blecomm_core::error::{LinkError, LinkResult};
use blecomm_core::link::{
    AdapterEvent, AdapterEventReceiver, AdapterEventSender, BleAdapter, LinkEvent,
    LinkEventReceiver, LinkEventSender, LinkPort, SharedLink,
};
use blecomm_core::wire::TARGET_MTU;
use blecomm_core::{CharacteristicId, DeviceHandle, Role};

/// Usable payload of an un-negotiated link (default ATT MTU of 23 minus
/// the 3-byte ATT header).
pub const DEFAULT_USABLE_MTU: u16 = 20;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Bus
// ----------------------------------------------------------------------------

struct RadioEntry {
    enabled: bool,
    advertising: Option<String>,
    scanning: bool,
    events: AdapterEventSender,
}

struct BusInner {
    radios: Mutex<HashMap<String, RadioEntry>>,
    links: Mutex<Vec<Weak<LinkShared>>>,
}

impl BusInner {
    fn live_links(&self) -> Vec<Arc<LinkShared>> {
        let mut links = lock(&self.links);
        links.retain(|link| link.strong_count() > 0);
        links.iter().filter_map(Weak::upgrade).collect()
    }

    fn sever_address(&self, address: &str) {
        for link in self.live_links() {
            if link.central_address == address || link.peripheral_address == address {
                link.sever();
            }
        }
    }
}

/// The shared airspace connecting all virtual adapters.
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                radios: Mutex::new(HashMap::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a radio at `address`. The radio starts enabled, not
    /// advertising and not scanning.
    pub fn adapter(&self, address: &str) -> Arc<VirtualAdapter> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        lock(&self.inner.radios).insert(
            address.to_string(),
            RadioEntry {
                enabled: true,
                advertising: None,
                scanning: false,
                events: tx,
            },
        );
        Arc::new(VirtualAdapter {
            bus: Arc::clone(&self.inner),
            address: address.to_string(),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Drop the next `count` application-level acknowledgements crossing
    /// any link between the two addresses, in either direction.
    pub fn drop_acks(&self, a: &str, b: &str, count: usize) {
        for link in self.links_between(a, b) {
            link.drop_acks.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Kill every link between the two addresses: both sides observe an
    /// unsolicited disconnection.
    pub fn sever_links(&self, a: &str, b: &str) {
        for link in self.links_between(a, b) {
            link.sever();
        }
    }

    fn links_between(&self, a: &str, b: &str) -> Vec<Arc<LinkShared>> {
        self.inner
            .live_links()
            .into_iter()
            .filter(|link| {
                (link.central_address == a && link.peripheral_address == b)
                    || (link.central_address == b && link.peripheral_address == a)
            })
            .collect()
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Links
// ----------------------------------------------------------------------------

struct LinkShared {
    central_address: String,
    peripheral_address: String,
    usable_mtu: AtomicU16,
    alive: AtomicBool,
    drop_acks: AtomicUsize,
    subscriptions: Mutex<HashSet<CharacteristicId>>,
    to_central: LinkEventSender,
    to_peripheral: LinkEventSender,
}

impl LinkShared {
    fn sever(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.to_central.send(LinkEvent::Disconnected);
            let _ = self.to_peripheral.send(LinkEvent::Disconnected);
        }
    }

    fn is_ack_characteristic(characteristic: CharacteristicId) -> bool {
        matches!(
            characteristic,
            CharacteristicId::ReadResponseMessageReceived
                | CharacteristicId::ReadResponseDataReceived
        )
    }

    /// Consume one pending ack-drop if this delivery is an ack.
    fn swallow_ack(&self, characteristic: CharacteristicId) -> bool {
        if !Self::is_ack_characteristic(characteristic) {
            return false;
        }
        self.drop_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One side of a paired in-memory link.
struct VirtualLink {
    shared: Arc<LinkShared>,
    side: Role,
}

#[async_trait]
impl LinkPort for VirtualLink {
    async fn write(&self, characteristic: CharacteristicId, value: &[u8]) -> LinkResult<()> {
        if self.side != Role::Central {
            return Err(LinkError::WriteFailed("peripherals notify, not write".into()));
        }
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if self.shared.swallow_ack(characteristic) {
            debug!(?characteristic, "swallowing ack write");
            return Ok(());
        }
        let _ = self.shared.to_peripheral.send(LinkEvent::Received {
            characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn notify(&self, characteristic: CharacteristicId, value: &[u8]) -> LinkResult<()> {
        if self.side != Role::Peripheral {
            return Err(LinkError::WriteFailed("centrals write, not notify".into()));
        }
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if !lock(&self.shared.subscriptions).contains(&characteristic) {
            // Nobody listening: the notification falls on the floor.
            return Ok(());
        }
        if self.shared.swallow_ack(characteristic) {
            debug!(?characteristic, "swallowing ack notification");
            return Ok(());
        }
        let _ = self.shared.to_central.send(LinkEvent::Received {
            characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, characteristic: CharacteristicId) -> LinkResult<()> {
        if self.side != Role::Central {
            return Err(LinkError::SubscribeFailed(
                "only the central subscribes".into(),
            ));
        }
        lock(&self.shared.subscriptions).insert(characteristic);
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> LinkResult<u16> {
        if self.side != Role::Central {
            return Err(LinkError::MtuNegotiationFailed(
                "only the central renegotiates".into(),
            ));
        }
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let granted = mtu.min(TARGET_MTU as u16).saturating_sub(3);
        self.shared.usable_mtu.store(granted, Ordering::SeqCst);
        Ok(granted)
    }

    fn mtu(&self) -> u16 {
        self.shared.usable_mtu.load(Ordering::SeqCst)
    }

    async fn close(&self) -> LinkResult<()> {
        self.shared.sever();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// One radio in the virtual airspace.
pub struct VirtualAdapter {
    bus: Arc<BusInner>,
    address: String,
    events: Mutex<Option<AdapterEventReceiver>>,
}

impl VirtualAdapter {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn with_radio<R>(&self, f: impl FnOnce(&mut RadioEntry) -> R) -> Option<R> {
        let mut radios = lock(&self.bus.radios);
        radios.get_mut(&self.address).map(f)
    }
}

#[async_trait]
impl BleAdapter for VirtualAdapter {
    fn is_le_supported(&self) -> bool {
        true
    }

    fn is_enabled(&self) -> bool {
        self.with_radio(|r| r.enabled).unwrap_or(false)
    }

    async fn set_enabled(&self, enabled: bool) -> LinkResult<()> {
        let changed = {
            let mut radios = lock(&self.bus.radios);
            let Some(entry) = radios.get_mut(&self.address) else {
                return Err(LinkError::AdapterUnavailable);
            };
            let changed = entry.enabled != enabled;
            entry.enabled = enabled;
            if !enabled {
                entry.advertising = None;
                entry.scanning = false;
            }
            changed.then(|| entry.events.clone())
        };
        if !enabled {
            self.bus.sever_address(&self.address);
        }
        if let Some(events) = changed {
            let _ = events.send(AdapterEvent::StateChanged { enabled });
        }
        Ok(())
    }

    async fn start_advertising(&self, unique_name: &str) -> LinkResult<()> {
        let scanners: Vec<AdapterEventSender> = {
            let mut radios = lock(&self.bus.radios);
            let Some(entry) = radios.get_mut(&self.address) else {
                return Err(LinkError::AdapterUnavailable);
            };
            if !entry.enabled {
                return Err(LinkError::AdapterUnavailable);
            }
            entry.advertising = Some(unique_name.to_string());
            radios
                .iter()
                .filter(|(addr, radio)| {
                    addr.as_str() != self.address && radio.enabled && radio.scanning
                })
                .map(|(_, radio)| radio.events.clone())
                .collect()
        };
        for events in scanners {
            let _ = events.send(AdapterEvent::DeviceFound {
                device: DeviceHandle::new(&self.address),
                advertised_name: unique_name.to_string(),
            });
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> LinkResult<()> {
        let lost: Vec<AdapterEventSender> = {
            let mut radios = lock(&self.bus.radios);
            let Some(entry) = radios.get_mut(&self.address) else {
                return Err(LinkError::AdapterUnavailable);
            };
            entry.advertising = None;
            radios
                .iter()
                .filter(|(addr, radio)| {
                    addr.as_str() != self.address && radio.enabled && radio.scanning
                })
                .map(|(_, radio)| radio.events.clone())
                .collect()
        };
        for events in lost {
            let _ = events.send(AdapterEvent::DeviceLost {
                device: DeviceHandle::new(&self.address),
            });
        }
        Ok(())
    }

    async fn start_scanning(&self) -> LinkResult<()> {
        let (events, found) = {
            let mut radios = lock(&self.bus.radios);
            let advertising: Vec<(String, String)> = radios
                .iter()
                .filter(|(addr, radio)| {
                    addr.as_str() != self.address && radio.enabled && radio.advertising.is_some()
                })
                .map(|(addr, radio)| {
                    (addr.clone(), radio.advertising.clone().unwrap_or_default())
                })
                .collect();
            let Some(entry) = radios.get_mut(&self.address) else {
                return Err(LinkError::AdapterUnavailable);
            };
            if !entry.enabled {
                return Err(LinkError::AdapterUnavailable);
            }
            entry.scanning = true;
            (entry.events.clone(), advertising)
        };
        for (address, advertised_name) in found {
            let _ = events.send(AdapterEvent::DeviceFound {
                device: DeviceHandle::new(address),
                advertised_name,
            });
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> LinkResult<()> {
        self.with_radio(|r| r.scanning = false)
            .ok_or(LinkError::AdapterUnavailable)
    }

    async fn connect(&self, device: &DeviceHandle) -> LinkResult<(SharedLink, LinkEventReceiver)> {
        let target_events = {
            let radios = lock(&self.bus.radios);
            let Some(me) = radios.get(&self.address) else {
                return Err(LinkError::AdapterUnavailable);
            };
            if !me.enabled {
                return Err(LinkError::AdapterUnavailable);
            }
            let Some(target) = radios.get(device.address()) else {
                return Err(LinkError::ConnectFailed("no such device".into()));
            };
            if !target.enabled {
                return Err(LinkError::ConnectFailed("device radio is off".into()));
            }
            target.events.clone()
        };

        let (to_central, central_rx) = tokio::sync::mpsc::unbounded_channel();
        let (to_peripheral, peripheral_rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            central_address: self.address.clone(),
            peripheral_address: device.address().to_string(),
            usable_mtu: AtomicU16::new(DEFAULT_USABLE_MTU),
            alive: AtomicBool::new(true),
            drop_acks: AtomicUsize::new(0),
            subscriptions: Mutex::new(HashSet::new()),
            to_central,
            to_peripheral,
        });
        lock(&self.bus.links).push(Arc::downgrade(&shared));

        let central_link: SharedLink = Arc::new(VirtualLink {
            shared: Arc::clone(&shared),
            side: Role::Central,
        });
        let peripheral_link: SharedLink = Arc::new(VirtualLink {
            shared,
            side: Role::Peripheral,
        });
        let _ = target_events.send(AdapterEvent::InboundLink {
            device: DeviceHandle::new(&self.address),
            link: peripheral_link,
            events: peripheral_rx,
        });
        Ok((central_link, central_rx))
    }

    fn take_events(&self) -> Option<AdapterEventReceiver> {
        lock(&self.events).take()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scanners_see_advertisers_in_either_order() {
        let bus = VirtualBus::new();
        let a = bus.adapter("AA:01");
        let b = bus.adapter("BB:01");
        let mut a_events = a.take_events().unwrap();

        // Advertise first, scan second.
        b.start_advertising("bobXY").await.unwrap();
        a.start_scanning().await.unwrap();
        match a_events.recv().await.unwrap() {
            AdapterEvent::DeviceFound {
                device,
                advertised_name,
            } => {
                assert_eq!(device.address(), "BB:01");
                assert_eq!(advertised_name, "bobXY");
            }
            _ => panic!("expected DeviceFound"),
        }

        // Scan first, advertise second.
        b.stop_advertising().await.unwrap();
        let _ = a_events.recv().await; // DeviceLost
        b.start_advertising("bob2Y").await.unwrap();
        match a_events.recv().await.unwrap() {
            AdapterEvent::DeviceFound {
                advertised_name, ..
            } => assert_eq!(advertised_name, "bob2Y"),
            _ => panic!("expected DeviceFound"),
        }
    }

    #[tokio::test]
    async fn connect_delivers_an_inbound_link() {
        let bus = VirtualBus::new();
        let a = bus.adapter("AA:02");
        let b = bus.adapter("BB:02");
        let mut b_events = b.take_events().unwrap();

        let (central, mut central_rx) = a.connect(&DeviceHandle::new("BB:02")).await.unwrap();
        let (peripheral, mut peripheral_rx) = match b_events.recv().await.unwrap() {
            AdapterEvent::InboundLink { device, link, events } => {
                assert_eq!(device.address(), "AA:02");
                (link, events)
            }
            _ => panic!("expected InboundLink"),
        };

        // Central write surfaces on the peripheral side.
        central
            .write(CharacteristicId::ConnectionRequest, b"aliceXY")
            .await
            .unwrap();
        match peripheral_rx.recv().await.unwrap() {
            LinkEvent::Received {
                characteristic,
                value,
            } => {
                assert_eq!(characteristic, CharacteristicId::ConnectionRequest);
                assert_eq!(value, b"aliceXY");
            }
            LinkEvent::Disconnected => panic!("unexpected disconnect"),
        }

        // Notifications are gated on subscription.
        peripheral
            .notify(CharacteristicId::ConnectionResponse, b"0")
            .await
            .unwrap();
        central
            .subscribe(CharacteristicId::ConnectionResponse)
            .await
            .unwrap();
        peripheral
            .notify(CharacteristicId::ConnectionResponse, b"0")
            .await
            .unwrap();
        match central_rx.recv().await.unwrap() {
            LinkEvent::Received { value, .. } => assert_eq!(value, b"0"),
            LinkEvent::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[tokio::test]
    async fn mtu_starts_small_and_negotiates_up() {
        let bus = VirtualBus::new();
        let a = bus.adapter("AA:03");
        let _b = bus.adapter("BB:03");
        let (central, _rx) = a.connect(&DeviceHandle::new("BB:03")).await.unwrap();

        assert_eq!(central.mtu(), DEFAULT_USABLE_MTU);
        let granted = central.request_mtu(TARGET_MTU as u16).await.unwrap();
        assert_eq!(granted, TARGET_MTU as u16 - 3);
        assert_eq!(central.mtu(), granted);
    }

    #[tokio::test]
    async fn severing_reports_disconnected_on_both_sides() {
        let bus = VirtualBus::new();
        let a = bus.adapter("AA:04");
        let b = bus.adapter("BB:04");
        let mut b_events = b.take_events().unwrap();

        let (central, mut central_rx) = a.connect(&DeviceHandle::new("BB:04")).await.unwrap();
        let mut peripheral_rx = match b_events.recv().await.unwrap() {
            AdapterEvent::InboundLink { events, .. } => events,
            _ => panic!("expected InboundLink"),
        };

        bus.sever_links("AA:04", "BB:04");
        assert!(matches!(
            central_rx.recv().await,
            Some(LinkEvent::Disconnected)
        ));
        assert!(matches!(
            peripheral_rx.recv().await,
            Some(LinkEvent::Disconnected)
        ));
        assert!(matches!(
            central
                .write(CharacteristicId::MessageReceive, b"x")
                .await,
            Err(LinkError::Closed)
        ));
    }
}

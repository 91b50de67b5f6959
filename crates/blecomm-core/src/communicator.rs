//! Top-level facade.
//!
//! The communicator owns one connection per role, the advertise/scan
//! lifecycle, the global outbound queues and the radio-state observer. Any
//! device runs both roles at once: it can accept inbound connections as a
//! peripheral while holding outbound ones as a central.
//!
//! Construct it inside a tokio runtime. The thread that constructs it
//! becomes the designated main thread: the advertise/discovery start/stop
//! operations must be called from it and fail with
//! [`OpStatus::NotMainThread`] anywhere else. Subscribe to [`Event`]s
//! before starting; every subscriber receives the full event stream until
//! the communicator is destroyed.
//!
//! Outbound messages go through two global FIFO queues (text and binary).
//! The head message is fanned out over the central connection, then the
//! peripheral one, and only then popped — so delivery order equals send
//! order per stream kind, surviving reconnections.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionNotice, UplinkReceiver, UplinkSender};
use crate::events::{Event, OpStatus, Role};
use crate::link::{AdapterEvent, AdapterEventReceiver, BleAdapter};
use crate::message::Message;
use crate::peer::{Peer, ADVERTISED_NAME_MAX_BYTES, NAME_SUFFIX_CHARS};
use crate::tools;
use crate::wire::StreamKind;

// ----------------------------------------------------------------------------
// Radio state
// ----------------------------------------------------------------------------

/// Flags guarded by the communicator's radio lock.
#[derive(Debug)]
struct RadioState {
    unique_name: String,
    advertising: bool,
    discovering: bool,
    turning_on: bool,
    turning_off: bool,
    restarting: bool,
    destroying: bool,
    initializing_connections: bool,
    /// Radio state found at construction, restored when the library turned
    /// the radio on only for itself.
    original_enabled: Option<bool>,
}

// ----------------------------------------------------------------------------
// Communicator
// ----------------------------------------------------------------------------

/// P2P BLE communicator: discovery, connection negotiation, reliable
/// ordered message exchange and reconnection recovery between two or more
/// devices.
pub struct Communicator {
    config: Config,
    adapter: Arc<dyn BleAdapter>,
    rt: tokio::runtime::Handle,
    home_thread: ThreadId,
    suffix: String,
    state: Mutex<RadioState>,
    central: Mutex<Option<Arc<Connection>>>,
    peripheral: Mutex<Option<Arc<Connection>>>,
    pending_messages: Mutex<VecDeque<Message>>,
    pending_data: Mutex<VecDeque<Message>>,
    message_signal: Arc<Notify>,
    data_signal: Arc<Notify>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    up_tx: UplinkSender,
}

impl Communicator {
    /// Create a communicator advertising as `name` (truncated to fit the
    /// advertising budget together with the random two-character suffix).
    /// Turns the radio on if it is off; the original state is restored once
    /// advertising and discovery are both stopped with no peers connected.
    pub fn new(adapter: Arc<dyn BleAdapter>, name: &str, config: Config) -> Arc<Self> {
        let rt = tokio::runtime::Handle::current();
        let suffix = tools::generate_name_suffix();
        let base = tools::truncate_utf8(name, ADVERTISED_NAME_MAX_BYTES - NAME_SUFFIX_CHARS);
        let unique_name = format!("{base}{suffix}");
        let (up_tx, up_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            config,
            adapter: Arc::clone(&adapter),
            rt: rt.clone(),
            home_thread: std::thread::current().id(),
            suffix,
            state: Mutex::new(RadioState {
                unique_name,
                advertising: false,
                discovering: false,
                turning_on: false,
                turning_off: false,
                restarting: false,
                destroying: false,
                initializing_connections: false,
                original_enabled: None,
            }),
            central: Mutex::new(None),
            peripheral: Mutex::new(None),
            pending_messages: Mutex::new(VecDeque::new()),
            pending_data: Mutex::new(VecDeque::new()),
            message_signal: Arc::new(Notify::new()),
            data_signal: Arc::new(Notify::new()),
            subscribers: Mutex::new(Vec::new()),
            up_tx,
        });

        let events = adapter.take_events();
        rt.spawn(run_event_loop(Arc::downgrade(&this), events, up_rx));
        rt.spawn(run_drain(Arc::downgrade(&this), StreamKind::Text));
        rt.spawn(run_drain(Arc::downgrade(&this), StreamKind::Binary));

        if this.adapter.is_le_supported() {
            if this.adapter.is_enabled() {
                tools::lock(&this.state).original_enabled = Some(true);
                this.initialize_connections();
            } else {
                {
                    let mut st = tools::lock(&this.state);
                    st.original_enabled = Some(false);
                    st.initializing_connections = true;
                    st.turning_on = true;
                }
                this.spawn_radio(true);
            }
        } else {
            // Deferred so subscribers attached right after construction
            // still see it.
            let unsupported = Arc::clone(&this);
            rt.spawn(async move {
                unsupported.emit(Event::BluetoothLeNotSupported);
            });
        }
        this
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to the event stream. The channel closes when the
    /// communicator is destroyed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        tools::lock(&self.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: Event) {
        tools::lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The advertised name: the user-chosen name plus the random suffix.
    pub fn unique_name(&self) -> String {
        tools::lock(&self.state).unique_name.clone()
    }

    pub fn is_advertising(&self) -> bool {
        tools::lock(&self.state).advertising
    }

    pub fn is_discovering(&self) -> bool {
        tools::lock(&self.state).discovering
    }

    /// Whether the device supports BLE at all.
    pub fn is_le_supported(&self) -> OpStatus {
        if self.adapter.is_le_supported() {
            OpStatus::Success
        } else {
            OpStatus::BluetoothLeNotSupported
        }
    }

    /// Unique names of peers currently recovering from a link drop, on
    /// either role.
    pub fn reconnecting_peers(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(peripheral) = self.peripheral() {
            names.extend(peripheral.reconnecting_peers());
        }
        if let Some(central) = self.central() {
            names.extend(central.reconnecting_peers());
        }
        names
    }

    /// Every peer connected on either role.
    pub fn connected_peers(&self) -> Vec<Peer> {
        let mut peers = Vec::new();
        if let Some(peripheral) = self.peripheral() {
            peers.extend(peripheral.connected_peers());
        }
        if let Some(central) = self.central() {
            peers.extend(central.connected_peers());
        }
        peers
    }

    fn central(&self) -> Option<Arc<Connection>> {
        tools::lock(&self.central).clone()
    }

    fn peripheral(&self) -> Option<Arc<Connection>> {
        tools::lock(&self.peripheral).clone()
    }

    fn connected_peer_count(&self) -> usize {
        self.connected_peers().len()
    }

    fn queue(&self, kind: StreamKind) -> &Mutex<VecDeque<Message>> {
        match kind {
            StreamKind::Text => &self.pending_messages,
            StreamKind::Binary => &self.pending_data,
        }
    }

    fn signal(&self, kind: StreamKind) -> &Arc<Notify> {
        match kind {
            StreamKind::Text => &self.message_signal,
            StreamKind::Binary => &self.data_signal,
        }
    }

    // ------------------------------------------------------------------
    // Advertise / discovery lifecycle
    // ------------------------------------------------------------------

    /// Start advertising so other devices can find us and request a
    /// connection. Main thread only.
    pub fn start_advertising(&self) -> OpStatus {
        let mut st = tools::lock(&self.state);
        if st.destroying {
            return OpStatus::Destroying;
        }
        if !self.adapter.is_le_supported() || self.peripheral().is_none() {
            return OpStatus::BluetoothLeNotSupported;
        }
        if std::thread::current().id() != self.home_thread {
            return OpStatus::NotMainThread;
        }
        if st.advertising {
            return OpStatus::AlreadyStarted;
        }
        if self.adapter.is_enabled() {
            let already_on_air = self
                .peripheral()
                .map(|c| c.has_reconnecting_peers())
                .unwrap_or(false);
            if !already_on_air {
                let adapter = Arc::clone(&self.adapter);
                let name = st.unique_name.clone();
                self.rt.spawn(async move {
                    if let Err(err) = adapter.start_advertising(&name).await {
                        warn!(%err, "starting advertising failed");
                    }
                });
            }
        } else {
            st.turning_on = true;
            self.spawn_radio(true);
        }
        st.advertising = true;
        drop(st);
        self.emit(Event::AdvertiseStarted);
        OpStatus::Success
    }

    /// Stop advertising. Main thread only. Advertising stays on the air
    /// while reconnecting peers still need it.
    pub fn stop_advertising(&self) -> OpStatus {
        let mut st = tools::lock(&self.state);
        if !self.adapter.is_le_supported() || self.peripheral().is_none() {
            return OpStatus::BluetoothLeNotSupported;
        }
        if std::thread::current().id() != self.home_thread {
            return OpStatus::NotMainThread;
        }
        if !st.advertising {
            return OpStatus::AlreadyStopped;
        }
        let keep_on_air = self
            .peripheral()
            .map(|c| c.has_reconnecting_peers())
            .unwrap_or(false);
        if !keep_on_air {
            let adapter = Arc::clone(&self.adapter);
            self.rt.spawn(async move {
                let _ = adapter.stop_advertising().await;
            });
        }
        st.advertising = false;
        self.maybe_restore_radio(&mut st);
        drop(st);
        self.emit(Event::AdvertiseStopped);
        OpStatus::Success
    }

    /// Start scanning for advertising devices; found peers are reported
    /// with [`Event::PeerFound`]. Main thread only.
    pub fn start_discovery(&self) -> OpStatus {
        let mut st = tools::lock(&self.state);
        if st.destroying {
            return OpStatus::Destroying;
        }
        if !self.adapter.is_le_supported() || self.central().is_none() {
            return OpStatus::BluetoothLeNotSupported;
        }
        if std::thread::current().id() != self.home_thread {
            return OpStatus::NotMainThread;
        }
        if st.discovering {
            return OpStatus::AlreadyStarted;
        }
        if self.adapter.is_enabled() {
            let already_scanning = self
                .central()
                .map(|c| c.has_reconnecting_peers())
                .unwrap_or(false);
            if !already_scanning {
                let adapter = Arc::clone(&self.adapter);
                self.rt.spawn(async move {
                    if let Err(err) = adapter.start_scanning().await {
                        warn!(%err, "starting discovery failed");
                    }
                });
            }
        } else {
            st.turning_on = true;
            self.spawn_radio(true);
        }
        st.discovering = true;
        drop(st);
        self.emit(Event::DiscoveryStarted);
        OpStatus::Success
    }

    /// Stop scanning. Main thread only.
    pub fn stop_discovery(&self) -> OpStatus {
        let mut st = tools::lock(&self.state);
        if !self.adapter.is_le_supported() || self.central().is_none() {
            return OpStatus::BluetoothLeNotSupported;
        }
        if std::thread::current().id() != self.home_thread {
            return OpStatus::NotMainThread;
        }
        if !st.discovering {
            return OpStatus::AlreadyStopped;
        }
        let keep_scanning = self
            .central()
            .map(|c| c.has_reconnecting_peers())
            .unwrap_or(false);
        if !keep_scanning {
            let adapter = Arc::clone(&self.adapter);
            self.rt.spawn(async move {
                let _ = adapter.stop_scanning().await;
            });
        }
        st.discovering = false;
        self.maybe_restore_radio(&mut st);
        drop(st);
        self.emit(Event::DiscoveryStopped);
        OpStatus::Success
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Ask a found peer for a connection. The outcome arrives as
    /// [`Event::ConnectionSuccess`] or [`Event::ConnectionFailed`].
    pub fn connect(&self, peer: &Peer) -> OpStatus {
        if tools::lock(&self.state).destroying {
            return OpStatus::Destroying;
        }
        match self.central() {
            Some(central) => {
                central.connect(peer.clone());
                OpStatus::Success
            }
            None => OpStatus::BluetoothLeNotSupported,
        }
    }

    /// Accept a pending connection request previously surfaced with
    /// [`Event::ConnectionRequest`].
    pub fn accept_connection(&self, peer: &Peer) -> OpStatus {
        match self.peripheral() {
            Some(peripheral) => {
                peripheral.accept_connection(peer);
                OpStatus::Success
            }
            None => OpStatus::BluetoothLeNotSupported,
        }
    }

    /// Reject a pending connection request.
    pub fn reject_connection(&self, peer: &Peer) -> OpStatus {
        match self.peripheral() {
            Some(peripheral) => {
                peripheral.reject_connection(peer);
                OpStatus::Success
            }
            None => OpStatus::BluetoothLeNotSupported,
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a text message for the receiver set in the message, or for
    /// every connected peer when none is set. Messages are delivered in
    /// send order per stream; peers that are reconnecting receive them
    /// after recovery.
    pub fn send_message(&self, message: Message) {
        tools::lock(&self.pending_messages).push_back(message);
        self.message_signal.notify_one();
    }

    /// Queue a binary message; same ordering rules as [`send_message`].
    ///
    /// [`send_message`]: Communicator::send_message
    pub fn send_data(&self, message: Message) {
        tools::lock(&self.pending_data).push_back(message);
        self.data_signal.notify_one();
    }

    // ------------------------------------------------------------------
    // Name
    // ------------------------------------------------------------------

    /// Change the advertised name. The random suffix is preserved, so
    /// remote devices keep recognizing this device as the same peer, and
    /// connected peers learn the new name over the air.
    pub fn set_name(&self, name: &str) -> OpStatus {
        let (Some(central), Some(peripheral)) = (self.central(), self.peripheral()) else {
            return OpStatus::BluetoothLeNotSupported;
        };
        let base = tools::truncate_utf8(name, ADVERTISED_NAME_MAX_BYTES - NAME_SUFFIX_CHARS);
        let unique_name = format!("{base}{}", self.suffix);
        let advertising = {
            let mut st = tools::lock(&self.state);
            st.unique_name = unique_name.clone();
            st.advertising
        };
        central.update_name(unique_name.clone());
        peripheral.update_name(unique_name.clone());
        if advertising {
            let adapter = Arc::clone(&self.adapter);
            self.rt.spawn(async move {
                let _ = adapter.start_advertising(&unique_name).await;
            });
        }
        OpStatus::Success
    }

    // ------------------------------------------------------------------
    // Disconnecting
    // ------------------------------------------------------------------

    /// Disconnect one peer; completion arrives as [`Event::Disconnected`].
    pub fn disconnect(&self, peer: &Peer) -> OpStatus {
        let (Some(central), Some(peripheral)) = (self.central(), self.peripheral()) else {
            return OpStatus::BluetoothLeNotSupported;
        };
        peripheral.disconnect(peer, None);
        central.disconnect(peer, None);
        let mut st = tools::lock(&self.state);
        self.maybe_restore_radio(&mut st);
        OpStatus::Success
    }

    /// Disconnect every connected peer, one at a time.
    pub fn disconnect_from_all(&self) -> OpStatus {
        let (Some(central), Some(peripheral)) = (self.central(), self.peripheral()) else {
            return OpStatus::BluetoothLeNotSupported;
        };
        self.rt.spawn(async move {
            peripheral.disconnect_all().await;
            central.disconnect_all().await;
        });
        OpStatus::Success
    }

    /// Release every resource. The radio is disabled, which cascades a
    /// link-down into every channel; once the OS reports the radio off,
    /// queues are dropped and all event subscriber channels close.
    pub fn destroy(&self) {
        {
            let mut st = tools::lock(&self.state);
            if st.destroying {
                return;
            }
            st.destroying = true;
        }
        if let Some(central) = self.central() {
            central.destroy();
        }
        if let Some(peripheral) = self.peripheral() {
            peripheral.destroy();
        }
        self.spawn_radio(false);
    }

    // ------------------------------------------------------------------
    // Radio plumbing
    // ------------------------------------------------------------------

    fn initialize_connections(self: &Arc<Self>) {
        let name = self.unique_name();
        {
            let mut central = tools::lock(&self.central);
            if central.is_none() {
                *central = Some(Connection::new(
                    Role::Central,
                    Arc::clone(&self.adapter),
                    name.clone(),
                    self.config.clone(),
                    self.rt.clone(),
                    self.up_tx.clone(),
                ));
            }
        }
        {
            let mut peripheral = tools::lock(&self.peripheral);
            if peripheral.is_none() {
                *peripheral = Some(Connection::new(
                    Role::Peripheral,
                    Arc::clone(&self.adapter),
                    name,
                    self.config.clone(),
                    self.rt.clone(),
                    self.up_tx.clone(),
                ));
            }
        }
        // Anything queued while the radio was coming up can flow now.
        self.message_signal.notify_one();
        self.data_signal.notify_one();
    }

    fn spawn_radio(&self, enabled: bool) {
        let adapter = Arc::clone(&self.adapter);
        self.rt.spawn(async move {
            if let Err(err) = adapter.set_enabled(enabled).await {
                warn!(%err, enabled, "changing radio state failed");
            }
        });
    }

    /// Turn the radio back off when the library switched it on purely for
    /// itself and nothing needs it anymore.
    fn maybe_restore_radio(&self, st: &mut RadioState) {
        if !st.advertising
            && !st.discovering
            && st.original_enabled == Some(false)
            && self.connected_peer_count() == 0
        {
            st.turning_off = true;
            self.spawn_radio(false);
        }
    }

    fn restart_radio(&self) {
        let mut st = tools::lock(&self.state);
        st.restarting = true;
        if self.adapter.is_enabled() {
            self.spawn_radio(false);
        } else if !st.turning_on {
            st.turning_on = true;
            self.spawn_radio(true);
        }
    }

    /// Stop the advertising/scanning that reconnection forced on, once the
    /// app flags are off and nobody is recovering anymore.
    fn settle_radio_after_recovery(&self) {
        let (advertising, discovering) = {
            let st = tools::lock(&self.state);
            (st.advertising, st.discovering)
        };
        let peripheral_recovering = self
            .peripheral()
            .map(|c| c.has_reconnecting_peers())
            .unwrap_or(false);
        let central_recovering = self
            .central()
            .map(|c| c.has_reconnecting_peers())
            .unwrap_or(false);
        if !advertising && !peripheral_recovering {
            let adapter = Arc::clone(&self.adapter);
            self.rt.spawn(async move {
                let _ = adapter.stop_advertising().await;
            });
        }
        if !discovering && !central_recovering {
            let adapter = Arc::clone(&self.adapter);
            self.rt.spawn(async move {
                let _ = adapter.stop_scanning().await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    fn handle_adapter_event(self: &Arc<Self>, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged { enabled } => self.handle_radio_state(enabled),
            AdapterEvent::DeviceFound {
                device,
                advertised_name,
            } => {
                let peer = Peer::new(Some(device), &advertised_name);
                let consumed = self
                    .central()
                    .map(|c| c.on_peer_found(&peer))
                    .unwrap_or(false);
                if !consumed {
                    self.emit(Event::PeerFound { peer });
                }
            }
            AdapterEvent::DeviceLost { device } => {
                self.emit(Event::PeerLost {
                    peer: Peer::new(Some(device), ""),
                });
            }
            AdapterEvent::InboundLink {
                device,
                link,
                events,
            } => {
                if let Some(peripheral) = self.peripheral() {
                    peripheral.handle_inbound_link(device, link, events);
                } else {
                    debug!("dropping inbound link, connections not initialized");
                }
            }
        }
    }

    fn handle_radio_state(self: &Arc<Self>, enabled: bool) {
        if enabled {
            let (initialize, advertising, discovering, name) = {
                let mut st = tools::lock(&self.state);
                let initialize = st.initializing_connections;
                st.initializing_connections = false;
                if st.turning_on {
                    st.turning_on = false;
                } else if st.restarting {
                    st.restarting = false;
                } else {
                    st.original_enabled = Some(true);
                }
                (initialize, st.advertising, st.discovering, st.unique_name.clone())
            };
            if initialize {
                self.initialize_connections();
            }
            let advertise = advertising
                || self
                    .peripheral()
                    .map(|c| c.has_reconnecting_peers())
                    .unwrap_or(false);
            if advertise {
                let adapter = Arc::clone(&self.adapter);
                self.rt.spawn(async move {
                    let _ = adapter.start_advertising(&name).await;
                });
            }
            let scan = discovering
                || self
                    .central()
                    .map(|c| c.has_reconnecting_peers())
                    .unwrap_or(false);
            if scan {
                let adapter = Arc::clone(&self.adapter);
                self.rt.spawn(async move {
                    let _ = adapter.start_scanning().await;
                });
            }
        } else {
            let (destroying, restarting, was_advertising, was_discovering) = {
                let mut st = tools::lock(&self.state);
                let destroying = st.destroying;
                let restarting = st.restarting;
                let was_advertising = st.advertising;
                let was_discovering = st.discovering;
                if !destroying && !restarting {
                    st.advertising = false;
                    st.discovering = false;
                    if st.turning_off {
                        st.turning_off = false;
                    } else {
                        st.original_enabled = Some(false);
                    }
                }
                (destroying, restarting, was_advertising, was_discovering)
            };
            if destroying {
                self.finish_destroy();
                return;
            }
            if restarting {
                self.spawn_radio(true);
                return;
            }
            if was_advertising {
                self.emit(Event::AdvertiseStopped);
            }
            if was_discovering {
                self.emit(Event::DiscoveryStopped);
            }
        }
    }

    fn finish_destroy(&self) {
        tools::lock(&self.pending_messages).clear();
        tools::lock(&self.pending_data).clear();
        *tools::lock(&self.central) = None;
        *tools::lock(&self.peripheral) = None;
        tools::lock(&self.subscribers).clear();
        info!("communicator destroyed");
    }

    fn handle_connection_notice(self: &Arc<Self>, role: Role, notice: ConnectionNotice) {
        match notice {
            ConnectionNotice::ConnectionRequest { peer } => {
                self.emit(Event::ConnectionRequest { peer });
            }
            ConnectionNotice::ConnectionSuccess { peer } => {
                self.emit(Event::ConnectionSuccess { peer, role });
            }
            ConnectionNotice::ConnectionFailed { peer, reason } => {
                self.emit(Event::ConnectionFailed { peer, reason });
            }
            ConnectionNotice::ConnectionLost { peer } => {
                // Recovery needs both sides on the air, whatever the app
                // flags say.
                let name = self.unique_name();
                let adapter = Arc::clone(&self.adapter);
                self.rt.spawn(async move {
                    let _ = adapter.start_advertising(&name).await;
                    let _ = adapter.start_scanning().await;
                });
                self.emit(Event::ConnectionLost { peer });
            }
            ConnectionNotice::ConnectionResumed { peer } => {
                self.settle_radio_after_recovery();
                self.emit(Event::ConnectionResumed { peer });
            }
            ConnectionNotice::PeerUpdated { old, new } => {
                self.emit(Event::PeerUpdated { old, new });
            }
            ConnectionNotice::MessageReceived { message, kind } => {
                let named = message
                    .sender()
                    .map(|s| !s.unique_name().is_empty())
                    .unwrap_or(false);
                if !named {
                    return;
                }
                match kind {
                    StreamKind::Text => self.emit(Event::MessageReceived { message, role }),
                    StreamKind::Binary => self.emit(Event::DataReceived { message, role }),
                }
            }
            ConnectionNotice::Disconnected {
                peer,
                was_connected,
            } => {
                let peers_left = self.connected_peer_count();
                self.settle_radio_after_recovery();
                if peers_left == 0 {
                    // Nobody left to drain the queued traffic to.
                    tools::lock(&self.pending_messages).clear();
                    tools::lock(&self.pending_data).clear();
                }
                if was_connected {
                    self.emit(Event::Disconnected { peer, peers_left });
                }
            }
            ConnectionNotice::DisconnectionFailed => {
                self.emit(Event::DisconnectionFailed);
                self.restart_radio();
            }
        }
    }

    async fn drain_queue(self: &Arc<Self>, kind: StreamKind) {
        loop {
            if tools::lock(&self.state).destroying {
                return;
            }
            let message = {
                let queue = tools::lock(self.queue(kind));
                queue.front().cloned()
            };
            let Some(message) = message else {
                return;
            };
            let (central, peripheral) = (self.central(), self.peripheral());
            if central.is_none() && peripheral.is_none() {
                // Radio still coming up; the message stays queued and the
                // drain resumes once the connections exist.
                return;
            }
            if let Some(central) = central {
                central.send(&message, kind).await;
            }
            if let Some(peripheral) = peripheral {
                peripheral.send(&message, kind).await;
            }
            tools::lock(self.queue(kind)).pop_front();
        }
    }
}

// ----------------------------------------------------------------------------
// Background tasks
// ----------------------------------------------------------------------------

enum LoopInput {
    Adapter(Option<AdapterEvent>),
    Notice(Option<(Role, ConnectionNotice)>),
}

async fn run_event_loop(
    weak: Weak<Communicator>,
    mut adapter_events: Option<AdapterEventReceiver>,
    mut up_rx: UplinkReceiver,
) {
    loop {
        let input = {
            let adapter_branch = adapter_events.as_mut();
            tokio::select! {
                ev = async {
                    match adapter_branch {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending::<Option<AdapterEvent>>().await,
                    }
                } => LoopInput::Adapter(ev),
                notice = up_rx.recv() => LoopInput::Notice(notice),
            }
        };
        let Some(this) = weak.upgrade() else {
            return;
        };
        match input {
            LoopInput::Adapter(Some(event)) => this.handle_adapter_event(event),
            LoopInput::Adapter(None) => adapter_events = None,
            LoopInput::Notice(Some((role, notice))) => this.handle_connection_notice(role, notice),
            LoopInput::Notice(None) => return,
        }
    }
}

/// One message at a time: fan the head out over both roles, then pop.
async fn run_drain(weak: Weak<Communicator>, kind: StreamKind) {
    loop {
        let signal = {
            let Some(this) = weak.upgrade() else {
                return;
            };
            Arc::clone(this.signal(kind))
        };
        signal.notified().await;
        let Some(this) = weak.upgrade() else {
            return;
        };
        this.drain_queue(kind).await;
    }
}

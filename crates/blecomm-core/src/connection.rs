//! Per-role connection management.
//!
//! A connection owns every channel of one role: the ordered channel set,
//! the strictly sequential message fan-out, and (for the central role) the
//! pending-connections queue that keeps at most one outbound connect
//! attempt in flight. A supervisor task consumes channel notices, owns
//! channel removal and resume routing, and forwards everything else to the
//! communicator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::{
    self, ChannelCommand, ChannelHandle, ChannelKey, ChannelNotice, NoticeReceiver, NoticeSender,
};
use crate::config::Config;
use crate::events::{ConnectFailReason, Role};
use crate::gatt::{CharacteristicId, RESPONSE_REJECT};
use crate::link::{BleAdapter, LinkEventReceiver, SharedLink};
use crate::message::Message;
use crate::peer::{DeviceHandle, Peer};
use crate::tools;
use crate::wire::StreamKind;

// ----------------------------------------------------------------------------
// Uplink to the communicator
// ----------------------------------------------------------------------------

/// Notices a connection forwards to the communicator, tagged with the role
/// they originate from.
pub(crate) enum ConnectionNotice {
    ConnectionRequest {
        peer: Peer,
    },
    ConnectionSuccess {
        peer: Peer,
    },
    ConnectionFailed {
        peer: Peer,
        reason: ConnectFailReason,
    },
    ConnectionLost {
        peer: Peer,
    },
    ConnectionResumed {
        peer: Peer,
    },
    PeerUpdated {
        old: Peer,
        new: Peer,
    },
    MessageReceived {
        message: Message,
        kind: StreamKind,
    },
    Disconnected {
        peer: Peer,
        was_connected: bool,
    },
    DisconnectionFailed,
}

pub(crate) type UplinkSender = mpsc::UnboundedSender<(Role, ConnectionNotice)>;
pub(crate) type UplinkReceiver = mpsc::UnboundedReceiver<(Role, ConnectionNotice)>;

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct PendingConnect {
    peer: Peer,
    resume: bool,
}

pub(crate) struct Connection {
    role: Role,
    adapter: Arc<dyn BleAdapter>,
    config: Config,
    rt: tokio::runtime::Handle,
    local_name: Mutex<String>,
    channels: Mutex<Vec<ChannelHandle>>,
    /// Central role: connect requests waiting for their turn.
    pending: Mutex<VecDeque<PendingConnect>>,
    /// Central role: unique name of the attempt currently in flight.
    current_attempt: Mutex<Option<String>>,
    notice_tx: NoticeSender,
    up: UplinkSender,
}

impl Connection {
    pub fn new(
        role: Role,
        adapter: Arc<dyn BleAdapter>,
        local_name: String,
        config: Config,
        rt: tokio::runtime::Handle,
        up: UplinkSender,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            role,
            adapter,
            config,
            rt: rt.clone(),
            local_name: Mutex::new(local_name),
            channels: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            current_attempt: Mutex::new(None),
            notice_tx,
            up,
        });
        rt.spawn(run_supervisor(Arc::downgrade(&conn), notice_rx));
        conn
    }

    fn local_name(&self) -> String {
        tools::lock(&self.local_name).clone()
    }

    fn send_up(&self, notice: ConnectionNotice) {
        let _ = self.up.send((self.role, notice));
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `message` over every matching channel, strictly one channel at
    /// a time, each channel completing before the next starts. Channels of
    /// disconnecting peers are skipped; an empty target set completes
    /// immediately.
    pub async fn send(&self, message: &Message, kind: StreamKind) {
        let targets: Vec<ChannelHandle> = {
            let channels = tools::lock(&self.channels);
            channels
                .iter()
                .filter(|ch| match message.receiver() {
                    Some(receiver) => ch.peer().unique_name() == receiver.unique_name(),
                    None => true,
                })
                .cloned()
                .collect()
        };
        for ch in targets {
            if ch.peer().is_disconnecting() {
                continue;
            }
            let (done_tx, done_rx) = oneshot::channel();
            let delivered = ch.send(ChannelCommand::Write {
                kind,
                message: message.clone(),
                done: done_tx,
            });
            if delivered {
                // A dropped sender (channel death) also releases us.
                let _ = done_rx.await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound connects (central)
    // ------------------------------------------------------------------

    /// Queue an outbound connection request. At most one connect attempt
    /// runs at a time; the rest wait in FIFO order.
    pub fn connect(self: &Arc<Self>, peer: Peer) {
        tools::lock(&self.pending).push_back(PendingConnect {
            peer,
            resume: false,
        });
        self.start_next_connect();
    }

    fn start_next_connect(self: &Arc<Self>) {
        let entry = {
            let mut attempt = tools::lock(&self.current_attempt);
            if attempt.is_some() {
                return;
            }
            let mut pending = tools::lock(&self.pending);
            let Some(entry) = pending.pop_front() else {
                return;
            };
            *attempt = Some(entry.peer.unique_name().to_string());
            entry
        };
        let this = Arc::clone(self);
        self.rt.spawn(async move {
            let result = match entry.peer.device().cloned() {
                Some(device) => this.adapter.connect(&device).await,
                None => Err(crate::error::LinkError::ConnectFailed(
                    "peer has no device handle".into(),
                )),
            };
            match result {
                Ok((link, events)) => this.on_link_established(entry, link, events),
                Err(err) => {
                    warn!(%err, peer = %entry.peer.unique_name(), "outbound connect failed");
                    this.send_up(ConnectionNotice::ConnectionFailed {
                        peer: entry.peer.clone(),
                        reason: ConnectFailReason::Error,
                    });
                    this.finish_connect_attempt(&entry.peer);
                }
            }
        });
    }

    fn on_link_established(
        self: &Arc<Self>,
        entry: PendingConnect,
        link: SharedLink,
        events: LinkEventReceiver,
    ) {
        if entry.resume {
            let target = self.find_reconnecting(entry.peer.unique_name());
            match target {
                Some(ch) => {
                    let _ = ch.send(ChannelCommand::Resume { link, events });
                }
                None => {
                    // The channel gave up while we were connecting.
                    debug!(peer = %entry.peer.unique_name(), "resume target is gone");
                    self.finish_connect_attempt(&entry.peer);
                }
            }
        } else {
            let handle = channel::spawn_channel(
                self.role,
                entry.peer.clone(),
                link,
                events,
                self.local_name(),
                self.config.clone(),
                self.notice_tx.clone(),
            );
            tools::lock(&self.channels).push(handle);
        }
    }

    /// Clear the in-flight marker if it belongs to `peer` and move on.
    fn finish_connect_attempt(self: &Arc<Self>, peer: &Peer) {
        {
            let mut attempt = tools::lock(&self.current_attempt);
            match attempt.as_deref() {
                Some(name) if name == peer.unique_name() => *attempt = None,
                _ => return,
            }
        }
        self.start_next_connect();
    }

    /// Scan-result routing: a reconnecting peer reappeared. Refresh its
    /// device handle and queue a resume connect. Returns `true` when the
    /// result was consumed by reconnection handling.
    pub fn on_peer_found(self: &Arc<Self>, found: &Peer) -> bool {
        if self.role != Role::Central {
            return false;
        }
        let matched = {
            let channels = tools::lock(&self.channels);
            channels
                .iter()
                .find(|ch| {
                    let peer = ch.peer();
                    peer.is_reconnecting()
                        && !peer.is_requesting_reconnection()
                        && peer.unique_name() == found.unique_name()
                })
                .cloned()
        };
        let Some(ch) = matched else {
            return false;
        };
        let Some(device) = found.device().cloned() else {
            return false;
        };
        info!(peer = %found.unique_name(), "reconnecting peer found again");
        ch.with_peer(|p| {
            p.set_device(device);
            p.set_requesting_reconnection(true);
        });
        tools::lock(&self.pending).push_back(PendingConnect {
            peer: ch.peer(),
            resume: true,
        });
        self.start_next_connect();
        true
    }

    // ------------------------------------------------------------------
    // Accept / reject (peripheral)
    // ------------------------------------------------------------------

    pub fn accept_connection(&self, peer: &Peer) -> bool {
        match self.find_channel(peer) {
            Some(ch) => ch.send(ChannelCommand::Accept),
            None => false,
        }
    }

    pub fn reject_connection(&self, peer: &Peer) -> bool {
        match self.find_channel(peer) {
            Some(ch) => ch.send(ChannelCommand::Reject),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    /// Disconnect one peer. `done` fires once the disconnection notice is
    /// on the air, was skipped, or the peer is unknown.
    pub fn disconnect(self: &Arc<Self>, peer: &Peer, done: Option<oneshot::Sender<()>>) {
        match self.find_channel(peer) {
            Some(ch) => {
                let _ = ch.send(ChannelCommand::Disconnect { done });
            }
            None => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Disconnect every peer, sequentially over a snapshot so the channel
    /// set is not mutated mid-iteration.
    pub async fn disconnect_all(self: &Arc<Self>) {
        let peers: Vec<Peer> = {
            let channels = tools::lock(&self.channels);
            channels.iter().map(|ch| ch.peer()).collect()
        };
        for peer in peers {
            let (done_tx, done_rx) = oneshot::channel();
            self.disconnect(&peer, Some(done_tx));
            let _ = done_rx.await;
        }
    }

    pub fn destroy(&self) {
        let channels = {
            let mut guard = tools::lock(&self.channels);
            std::mem::take(&mut *guard)
        };
        for ch in channels {
            let _ = ch.send(ChannelCommand::Shutdown);
        }
        tools::lock(&self.pending).clear();
    }

    // ------------------------------------------------------------------
    // Queries and updates
    // ------------------------------------------------------------------

    pub fn connected_peers(&self) -> Vec<Peer> {
        let channels = tools::lock(&self.channels);
        channels
            .iter()
            .map(|ch| ch.peer())
            .filter(Peer::is_connected)
            .collect()
    }

    pub fn reconnecting_peers(&self) -> Vec<String> {
        let channels = tools::lock(&self.channels);
        channels
            .iter()
            .map(|ch| ch.peer())
            .filter(Peer::is_reconnecting)
            .map(|p| p.unique_name().to_string())
            .collect()
    }

    pub fn has_reconnecting_peers(&self) -> bool {
        let channels = tools::lock(&self.channels);
        channels.iter().any(|ch| ch.peer().is_reconnecting())
    }

    pub fn update_name(&self, unique_name: String) {
        *tools::lock(&self.local_name) = unique_name.clone();
        let channels = tools::lock(&self.channels).clone();
        for ch in channels {
            let _ = ch.send(ChannelCommand::NameUpdate {
                unique_name: unique_name.clone(),
            });
        }
    }

    /// An inbound link reached our GATT server; grow a channel around it
    /// with a partial peer until the connection request names it.
    pub fn handle_inbound_link(
        &self,
        device: DeviceHandle,
        link: SharedLink,
        events: LinkEventReceiver,
    ) {
        let peer = Peer::new(Some(device), "");
        let handle = channel::spawn_channel(
            self.role,
            peer,
            link,
            events,
            self.local_name(),
            self.config.clone(),
            self.notice_tx.clone(),
        );
        tools::lock(&self.channels).push(handle);
    }

    fn find_channel(&self, peer: &Peer) -> Option<ChannelHandle> {
        let channels = tools::lock(&self.channels);
        channels
            .iter()
            .find(|ch| {
                let candidate = ch.peer();
                candidate.same_device(peer) || candidate.same_unique_name(peer)
            })
            .cloned()
    }

    fn find_reconnecting(&self, unique_name: &str) -> Option<ChannelHandle> {
        let channels = tools::lock(&self.channels);
        channels
            .iter()
            .find(|ch| {
                let peer = ch.peer();
                peer.is_reconnecting() && peer.unique_name() == unique_name
            })
            .cloned()
    }

    fn remove_channel(&self, key: ChannelKey) {
        tools::lock(&self.channels).retain(|ch| ch.key() != key);
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    fn handle_notice(self: &Arc<Self>, key: ChannelKey, notice: ChannelNotice) {
        match notice {
            ChannelNotice::ConnectionRequest { peer } => {
                self.send_up(ConnectionNotice::ConnectionRequest { peer });
            }
            ChannelNotice::ConnectionSuccess { peer } => {
                if self.role == Role::Central {
                    self.finish_connect_attempt(&peer);
                }
                self.send_up(ConnectionNotice::ConnectionSuccess { peer });
            }
            ChannelNotice::ConnectionFailed { peer, reason } => {
                if self.role == Role::Central {
                    self.finish_connect_attempt(&peer);
                }
                self.send_up(ConnectionNotice::ConnectionFailed { peer, reason });
            }
            ChannelNotice::ConnectionLost { peer } => {
                self.send_up(ConnectionNotice::ConnectionLost { peer });
            }
            ChannelNotice::ConnectionResumed { peer } => {
                if self.role == Role::Central {
                    self.finish_connect_attempt(&peer);
                }
                self.send_up(ConnectionNotice::ConnectionResumed { peer });
            }
            ChannelNotice::PeerUpdated { old, new } => {
                self.send_up(ConnectionNotice::PeerUpdated { old, new });
            }
            ChannelNotice::MessageReceived { message, kind } => {
                self.send_up(ConnectionNotice::MessageReceived { message, kind });
            }
            ChannelNotice::DisconnectionFailed => {
                self.send_up(ConnectionNotice::DisconnectionFailed);
            }
            ChannelNotice::Closed {
                peer,
                was_connected,
            } => {
                self.remove_channel(key);
                if self.role == Role::Central {
                    self.finish_connect_attempt(&peer);
                }
                self.send_up(ConnectionNotice::Disconnected {
                    peer,
                    was_connected,
                });
            }
            ChannelNotice::ResumeHandoff {
                unique_name,
                device,
                link,
                events,
            } => {
                self.remove_channel(key);
                match self.find_reconnecting(&unique_name) {
                    Some(ch) => {
                        if let Some(device) = device {
                            ch.with_peer(|p| p.set_device(device));
                        }
                        let _ = ch.send(ChannelCommand::Resume { link, events });
                    }
                    None => {
                        warn!(peer = %unique_name, "no reconnecting session for resume request");
                        self.rt.spawn(async move {
                            let _ = link
                                .notify(
                                    CharacteristicId::ConnectionResumedSend,
                                    &[RESPONSE_REJECT],
                                )
                                .await;
                            let _ = link.close().await;
                            drop(events);
                        });
                    }
                }
            }
        }
    }
}

async fn run_supervisor(weak: Weak<Connection>, mut rx: NoticeReceiver) {
    while let Some((key, notice)) = rx.recv().await {
        let Some(conn) = weak.upgrade() else {
            break;
        };
        conn.handle_notice(key, notice);
    }
}

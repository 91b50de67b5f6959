//! One channel per live link.
//!
//! A channel owns everything that happens on a single link to a single
//! peer: the handshake state machine, the per-stream reliable send loop,
//! receive reassembly with duplicate suppression, the disconnection
//! protocol and reconnection recovery. Each channel runs as one task — a
//! serial executor for its state — and reports upward to its owning
//! connection through [`ChannelNotice`] messages.
//!
//! All outbound GATT operations of a channel funnel through a single writer
//! task, because the OS stack permits one outstanding GATT operation per
//! connection at a time.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{ConnectFailReason, Role};
use crate::gatt::{
    self, CharacteristicId, CENTRAL_SUBSCRIPTIONS, DISCONNECTION_NOTICE, RESPONSE_ACCEPT,
    RESPONSE_REJECT,
};
use crate::link::{LinkEvent, LinkEventReceiver, SharedLink};
use crate::message::Message;
use crate::peer::{DeviceHandle, Peer};
use crate::sequence::{SequenceNumber, MESSAGE_ID_WIDTH};
use crate::timer::Alarm;
use crate::tools;
use crate::wire::{self, StreamKind, SubMessage, TARGET_MTU};

// ----------------------------------------------------------------------------
// Commands and notices
// ----------------------------------------------------------------------------

pub(crate) type ChannelKey = u64;

/// Instructions from the owning connection.
pub(crate) enum ChannelCommand {
    /// Queue a message on one stream; `done` fires once every sub-message
    /// has been delivered (or the channel dies, which drops the sender).
    Write {
        kind: StreamKind,
        message: Message,
        done: oneshot::Sender<()>,
    },
    /// Application accepted the pending connection request (peripheral).
    Accept,
    /// Application rejected the pending connection request (peripheral).
    Reject,
    /// A fresh link for a reconnecting channel.
    Resume {
        link: SharedLink,
        events: LinkEventReceiver,
    },
    /// The local advertised name changed; push it to the remote side.
    NameUpdate { unique_name: String },
    /// Run the disconnection protocol. `done` fires once the disconnection
    /// notice is on the air (or skipped).
    Disconnect { done: Option<oneshot::Sender<()>> },
    /// Tear down immediately without the over-the-air protocol.
    Shutdown,
}

/// Upcalls to the owning connection.
pub(crate) enum ChannelNotice {
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
    /// An inbound link introduced itself as a resumed session. The embryonic
    /// channel hands its link over; the connection routes it to the matching
    /// reconnecting channel (or refuses it).
    ResumeHandoff {
        unique_name: String,
        device: Option<DeviceHandle>,
        link: SharedLink,
        events: LinkEventReceiver,
    },
    /// The channel is finished and must be removed from the channel set.
    /// `was_connected` distinguishes a real disconnection from a handshake
    /// that never completed.
    Closed {
        peer: Peer,
        was_connected: bool,
    },
    /// The OS never reported the link down after a disconnect.
    DisconnectionFailed,
}

pub(crate) type NoticeSender = mpsc::UnboundedSender<(ChannelKey, ChannelNotice)>;
pub(crate) type NoticeReceiver = mpsc::UnboundedReceiver<(ChannelKey, ChannelNotice)>;

// ----------------------------------------------------------------------------
// Handle and shared state
// ----------------------------------------------------------------------------

static NEXT_CHANNEL_KEY: AtomicU64 = AtomicU64::new(1);

/// Peer state shared between the channel task and the channel set.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    peer: Mutex<Peer>,
}

impl ChannelShared {
    pub fn peer(&self) -> Peer {
        tools::lock(&self.peer).clone()
    }

    pub fn with_peer<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> R {
        f(&mut tools::lock(&self.peer))
    }
}

/// The connection-side handle to a running channel task.
#[derive(Clone)]
pub(crate) struct ChannelHandle {
    key: ChannelKey,
    shared: Arc<ChannelShared>,
    cmds: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Snapshot of the peer's current state.
    pub fn peer(&self) -> Peer {
        self.shared.peer()
    }

    pub fn with_peer<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> R {
        self.shared.with_peer(f)
    }

    pub fn send(&self, cmd: ChannelCommand) -> bool {
        self.cmds.send(cmd).is_ok()
    }
}

/// Start a channel task for a fresh link and return its handle.
pub(crate) fn spawn_channel(
    role: Role,
    mut peer: Peer,
    link: SharedLink,
    events: LinkEventReceiver,
    local_name: String,
    config: Config,
    notices: NoticeSender,
) -> ChannelHandle {
    peer.set_hardware_connected(true);
    let key = NEXT_CHANNEL_KEY.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::new(ChannelShared {
        peer: Mutex::new(peer),
    });
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let task = ChannelTask {
        key,
        role,
        config,
        shared: Arc::clone(&shared),
        local_name,
        notices,
        cmds: cmd_rx,
        internal_tx,
        internal_rx,
        link: Some(link),
        link_events: Some(events),
        writer: None,
        phase: Phase::PeripheralWaitRequest,
        handshake_timer: None,
        reconnection_timer: None,
        disconnect_timer: None,
        disconnect_done: None,
        text_stream: StreamState::new(),
        binary_stream: StreamState::new(),
        receiving: HashMap::new(),
        recently_delivered: VecDeque::new(),
        pending_acks: 0,
    };
    tokio::spawn(task.run());

    ChannelHandle {
        key,
        shared,
        cmds: cmd_tx,
    }
}

// ----------------------------------------------------------------------------
// Internal task state
// ----------------------------------------------------------------------------

/// Handshake and lifecycle phase of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Central: wrote the MTU probe, awaiting the MTU response.
    CentralMtuProbe { resume: bool },
    /// Central: wrote the connection (or resume) request, awaiting the answer.
    CentralConnecting { resume: bool },
    /// Peripheral: awaiting the MTU probe and connection request.
    PeripheralWaitRequest,
    /// Peripheral: connection request surfaced, awaiting the application.
    PeripheralWaitDecision,
    /// Peripheral: accept/reject response in flight.
    PeripheralResponding,
    Connected,
    Reconnecting,
    Disconnecting,
    Closed,
}

impl Phase {
    fn is_handshake(self) -> bool {
        matches!(
            self,
            Phase::CentralMtuProbe { .. }
                | Phase::CentralConnecting { .. }
                | Phase::PeripheralWaitRequest
                | Phase::PeripheralWaitDecision
                | Phase::PeripheralResponding
        )
    }

    fn is_resume_handshake(self) -> bool {
        matches!(
            self,
            Phase::CentralMtuProbe { resume: true } | Phase::CentralConnecting { resume: true }
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum InternalEvent {
    HandshakeTimeout,
    ReconnectionTimeout,
    DisconnectAckTimeout,
    DisconnectWatchdog,
    AckTimeout(StreamKind),
    WriteDone { tag: WriteTag, ok: bool },
}

/// Which pending operation a completed GATT write belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTag {
    Frame(StreamKind),
    Ack,
    ConnectionAccept,
    ConnectionReject,
    ResumeAccept,
    DisconnectNotice,
}

struct WriteJob {
    characteristic: CharacteristicId,
    value: Vec<u8>,
    tag: Option<WriteTag>,
}

/// One message queued for transmission, already split into frames.
struct OutgoingMessage {
    frames: VecDeque<SubMessage>,
    done: Option<oneshot::Sender<()>>,
}

/// The sub-message currently on the air. Delivered once both the link-layer
/// ack (write completion) and the application-level ack have arrived.
struct InFlight {
    frame: SubMessage,
    link_acked: bool,
    app_acked: bool,
}

impl InFlight {
    fn new(frame: SubMessage) -> Self {
        Self {
            frame,
            link_acked: false,
            app_acked: false,
        }
    }
}

/// Send-side state of one stream kind.
struct StreamState {
    next_message_id: SequenceNumber,
    queue: VecDeque<OutgoingMessage>,
    in_flight: Option<InFlight>,
    ack_timer: Option<Alarm>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_message_id: SequenceNumber::new(MESSAGE_ID_WIDTH),
            queue: VecDeque::new(),
            in_flight: None,
            ack_timer: None,
        }
    }
}

/// Receive-side reassembly of one message id.
struct PartialMessage {
    payload: Vec<u8>,
    last_sub_seq: SequenceNumber,
}

enum ReceiveProgress {
    Advanced,
    Stale,
    Gap,
}

enum Input {
    Command(Option<ChannelCommand>),
    Link(Option<LinkEvent>),
    Internal(InternalEvent),
}

struct ChannelTask {
    key: ChannelKey,
    role: Role,
    config: Config,
    shared: Arc<ChannelShared>,
    local_name: String,
    notices: NoticeSender,
    cmds: mpsc::UnboundedReceiver<ChannelCommand>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    link: Option<SharedLink>,
    link_events: Option<LinkEventReceiver>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    phase: Phase,
    handshake_timer: Option<Alarm>,
    reconnection_timer: Option<Alarm>,
    disconnect_timer: Option<Alarm>,
    disconnect_done: Option<oneshot::Sender<()>>,
    text_stream: StreamState,
    binary_stream: StreamState,
    receiving: HashMap<SequenceNumber, PartialMessage>,
    recently_delivered: VecDeque<SequenceNumber>,
    pending_acks: usize,
}

impl ChannelTask {
    async fn run(mut self) {
        self.spawn_writer();
        match self.role {
            Role::Central => self.start_central_handshake(false).await,
            Role::Peripheral => {
                self.handshake_timer =
                    Some(self.alarm(self.config.handshake_timeout, InternalEvent::HandshakeTimeout));
                self.phase = Phase::PeripheralWaitRequest;
            }
        }

        while self.phase != Phase::Closed {
            let input = {
                let cmds = &mut self.cmds;
                let internal = &mut self.internal_rx;
                let link_events = self.link_events.as_mut();
                tokio::select! {
                    cmd = cmds.recv() => Input::Command(cmd),
                    Some(ev) = internal.recv() => Input::Internal(ev),
                    ev = async {
                        match link_events {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending::<Option<LinkEvent>>().await,
                        }
                    } => Input::Link(ev),
                }
            };
            match input {
                Input::Command(None) => self.shutdown(),
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
                Input::Internal(ev) => self.handle_internal(ev).await,
                Input::Link(None) | Input::Link(Some(LinkEvent::Disconnected)) => {
                    self.handle_link_down()
                }
                Input::Link(Some(LinkEvent::Received {
                    characteristic,
                    value,
                })) => self.handle_received(characteristic, value).await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn alarm(&self, after: Duration, event: InternalEvent) -> Alarm {
        Alarm::schedule(after, self.internal_tx.clone(), event)
    }

    fn notice(&self, notice: ChannelNotice) {
        let _ = self.notices.send((self.key, notice));
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Text => &mut self.text_stream,
            StreamKind::Binary => &mut self.binary_stream,
        }
    }

    fn spawn_writer(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let role = self.role;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match role {
                    Role::Central => link.write(job.characteristic, &job.value).await,
                    Role::Peripheral => link.notify(job.characteristic, &job.value).await,
                };
                if let Err(ref err) = result {
                    debug!(%err, characteristic = ?job.characteristic, "gatt operation failed");
                }
                if let Some(tag) = job.tag {
                    if internal
                        .send(InternalEvent::WriteDone {
                            tag,
                            ok: result.is_ok(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        self.writer = Some(tx);
    }

    fn enqueue_write(
        &mut self,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        tag: Option<WriteTag>,
    ) {
        match &self.writer {
            Some(writer) => {
                let _ = writer.send(WriteJob {
                    characteristic,
                    value,
                    tag,
                });
            }
            None => debug!(?characteristic, "dropping write, no link"),
        }
    }

    fn attach_link(&mut self, link: SharedLink, events: LinkEventReceiver) {
        self.link = Some(link);
        self.link_events = Some(events);
        self.spawn_writer();
    }

    fn detach_link(&mut self) {
        self.link = None;
        self.link_events = None;
        self.writer = None;
        self.pending_acks = 0;
    }

    fn cancel_timers(&mut self) {
        self.handshake_timer = None;
        self.reconnection_timer = None;
        self.disconnect_timer = None;
    }

    fn abandon_streams(&mut self) {
        for kind in StreamKind::ALL {
            let stream = self.stream_mut(kind);
            stream.queue.clear();
            stream.in_flight = None;
            stream.ack_timer = None;
        }
    }

    /// Spawn the OS-level disconnect and watch for STATE_DISCONNECTED.
    fn start_close(&mut self) {
        if let Some(link) = self.link.clone() {
            tokio::spawn(async move {
                let _ = link.close().await;
            });
        }
        self.disconnect_timer = Some(self.alarm(
            self.config.disconnect_ack_timeout,
            InternalEvent::DisconnectWatchdog,
        ));
    }

    /// Final teardown: close the link, drop queued work, report `Closed`.
    fn close_now(&mut self, was_connected: bool) {
        if let Some(link) = self.link.take() {
            tokio::spawn(async move {
                let _ = link.close().await;
            });
        }
        self.detach_link();
        self.abandon_streams();
        self.cancel_timers();
        self.notice(ChannelNotice::Closed {
            peer: self.shared.peer(),
            was_connected,
        });
        self.phase = Phase::Closed;
    }

    fn shutdown(&mut self) {
        if let Some(link) = self.link.take() {
            tokio::spawn(async move {
                let _ = link.close().await;
            });
        }
        self.detach_link();
        self.abandon_streams();
        self.cancel_timers();
        self.phase = Phase::Closed;
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn start_central_handshake(&mut self, resume: bool) {
        self.handshake_timer =
            Some(self.alarm(self.config.handshake_timeout, InternalEvent::HandshakeTimeout));
        let Some(link) = self.link.clone() else {
            return;
        };
        self.phase = Phase::CentralMtuProbe { resume };
        if let Err(err) = link.subscribe(CharacteristicId::MtuResponse).await {
            warn!(%err, "subscribing to the mtu response failed");
            self.fail_handshake(ConnectFailReason::Error);
            return;
        }
        self.enqueue_write(CharacteristicId::MtuRequest, vec![0u8; TARGET_MTU], None);
    }

    /// MTU response arrived; upgrade if needed, subscribe the remaining
    /// characteristics and send the connection (or resume) request.
    async fn continue_central_handshake(&mut self, reported: usize) {
        let resume = self.phase.is_resume_handshake();
        let Some(link) = self.link.clone() else {
            return;
        };
        if reported < 200 {
            if let Err(err) = link.request_mtu(TARGET_MTU as u16).await {
                warn!(%err, "mtu upgrade failed");
                self.fail_handshake(ConnectFailReason::Error);
                return;
            }
        }
        for characteristic in CENTRAL_SUBSCRIPTIONS {
            if let Err(err) = link.subscribe(characteristic).await {
                warn!(%err, ?characteristic, "subscribe failed");
                self.fail_handshake(ConnectFailReason::Error);
                return;
            }
        }
        let target = if resume {
            CharacteristicId::ConnectionResumedReceive
        } else {
            CharacteristicId::ConnectionRequest
        };
        self.enqueue_write(target, self.local_name.clone().into_bytes(), None);
        self.phase = Phase::CentralConnecting { resume };
    }

    fn finish_central_handshake(&mut self, answer: Option<u8>) {
        match answer {
            Some(RESPONSE_ACCEPT) => {
                self.handshake_timer = None;
                self.shared.with_peer(|p| p.set_connected(true));
                self.phase = Phase::Connected;
                info!(peer = %self.shared.peer().unique_name(), "connection established");
                self.notice(ChannelNotice::ConnectionSuccess {
                    peer: self.shared.peer(),
                });
                self.pump_all();
            }
            Some(RESPONSE_REJECT) => {
                self.handshake_timer = None;
                info!(peer = %self.shared.peer().unique_name(), "connection rejected");
                self.notice(ChannelNotice::ConnectionFailed {
                    peer: self.shared.peer(),
                    reason: ConnectFailReason::Rejected,
                });
                self.close_now(false);
            }
            _ => self.fail_handshake(ConnectFailReason::Error),
        }
    }

    fn finish_central_resume(&mut self, answer: Option<u8>) {
        match answer {
            Some(RESPONSE_ACCEPT) => self.complete_resume(),
            // The remote side no longer has the session.
            _ => self.close_now(true),
        }
    }

    fn fail_handshake(&mut self, reason: ConnectFailReason) {
        if self.phase.is_resume_handshake() {
            self.revert_to_reconnecting();
            return;
        }
        self.handshake_timer = None;
        let peer = self.shared.peer();
        // A peripheral-side embryo whose remote never introduced itself has
        // nothing meaningful to report.
        if self.role == Role::Central || !peer.unique_name().is_empty() {
            self.notice(ChannelNotice::ConnectionFailed { peer, reason });
        }
        self.close_now(false);
    }

    /// A resume attempt fell through; go back to waiting for the scanner to
    /// find the peer again. The reconnection timer keeps running.
    fn revert_to_reconnecting(&mut self) {
        self.handshake_timer = None;
        if let Some(link) = self.link.take() {
            tokio::spawn(async move {
                let _ = link.close().await;
            });
        }
        self.detach_link();
        self.shared.with_peer(|p| p.set_requesting_reconnection(false));
        self.phase = Phase::Reconnecting;
    }

    fn answer_connection_request(&mut self, accept: bool) {
        if self.phase != Phase::PeripheralWaitDecision {
            debug!(phase = ?self.phase, "ignoring accept/reject outside decision phase");
            return;
        }
        let (byte, tag) = if accept {
            (RESPONSE_ACCEPT, WriteTag::ConnectionAccept)
        } else {
            (RESPONSE_REJECT, WriteTag::ConnectionReject)
        };
        self.enqueue_write(CharacteristicId::ConnectionResponse, vec![byte], Some(tag));
        self.phase = Phase::PeripheralResponding;
    }

    fn handle_connection_request(&mut self, value: Vec<u8>) {
        if self.phase != Phase::PeripheralWaitRequest {
            return;
        }
        let name = String::from_utf8_lossy(&value).into_owned();
        self.shared.with_peer(|p| p.set_unique_name(&name));
        self.phase = Phase::PeripheralWaitDecision;
        self.notice(ChannelNotice::ConnectionRequest {
            peer: self.shared.peer(),
        });
    }

    /// The inbound link is a resumed session for some reconnecting channel.
    /// Hand the link over to the connection and retire this embryo.
    fn hand_off_resume(&mut self, value: Vec<u8>) {
        if self.phase != Phase::PeripheralWaitRequest {
            return;
        }
        let unique_name = String::from_utf8_lossy(&value).into_owned();
        let (link, events) = match (self.link.take(), self.link_events.take()) {
            (Some(link), Some(events)) => (link, events),
            _ => return,
        };
        self.writer = None;
        self.cancel_timers();
        info!(peer = %unique_name, "routing resumed session to its channel");
        let device = self.shared.peer().device().cloned();
        self.notice(ChannelNotice::ResumeHandoff {
            unique_name,
            device,
            link,
            events,
        });
        self.phase = Phase::Closed;
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    async fn handle_resume(&mut self, link: SharedLink, events: LinkEventReceiver) {
        if self.phase != Phase::Reconnecting {
            debug!(phase = ?self.phase, "ignoring resume outside recovery");
            return;
        }
        self.attach_link(link, events);
        self.shared.with_peer(|p| p.set_hardware_connected(true));
        match self.role {
            Role::Central => self.start_central_handshake(true).await,
            Role::Peripheral => {
                self.enqueue_write(
                    CharacteristicId::ConnectionResumedSend,
                    vec![RESPONSE_ACCEPT],
                    Some(WriteTag::ResumeAccept),
                );
            }
        }
    }

    fn complete_resume(&mut self) {
        self.handshake_timer = None;
        self.reconnection_timer = None;
        self.shared.with_peer(|p| {
            p.set_hardware_connected(true);
            p.set_reconnecting(false, true);
            p.set_requesting_reconnection(false);
        });
        self.phase = Phase::Connected;
        info!(peer = %self.shared.peer().unique_name(), "connection resumed");
        self.notice(ChannelNotice::ConnectionResumed {
            peer: self.shared.peer(),
        });
        // Whatever was on the air when the link dropped goes out again; the
        // receiver's duplicate suppression absorbs the overlap.
        for kind in StreamKind::ALL {
            let frame = self
                .stream_mut(kind)
                .in_flight
                .as_ref()
                .map(|f| f.frame.clone());
            match frame {
                Some(frame) => {
                    if let Some(in_flight) = self.stream_mut(kind).in_flight.as_mut() {
                        in_flight.link_acked = false;
                        in_flight.app_acked = false;
                    }
                    self.transmit_frame(kind, frame);
                }
                None => self.pump(kind),
            }
        }
    }

    // ------------------------------------------------------------------
    // Reliable send loop
    // ------------------------------------------------------------------

    fn queue_message(&mut self, kind: StreamKind, message: Message, done: oneshot::Sender<()>) {
        let frames = {
            let stream = self.stream_mut(kind);
            let id = stream.next_message_id.clone();
            stream.next_message_id.increment();
            message.split_into_sub_messages(&id)
        };
        debug!(?kind, frames = frames.len(), "queueing outbound message");
        self.stream_mut(kind).queue.push_back(OutgoingMessage {
            frames,
            done: Some(done),
        });
        self.pump(kind);
    }

    /// Release the next sub-message if the stream is idle. Transmission is
    /// paused while a received frame's ack is still being put on the air.
    fn pump(&mut self, kind: StreamKind) {
        if self.phase != Phase::Connected || self.pending_acks > 0 || self.writer.is_none() {
            return;
        }
        let frame = {
            let stream = self.stream_mut(kind);
            if stream.in_flight.is_some() {
                return;
            }
            let Some(front) = stream.queue.front_mut() else {
                return;
            };
            match front.frames.pop_front() {
                Some(frame) => {
                    stream.in_flight = Some(InFlight::new(frame.clone()));
                    frame
                }
                None => return,
            }
        };
        self.transmit_frame(kind, frame);
    }

    fn pump_all(&mut self) {
        for kind in StreamKind::ALL {
            self.pump(kind);
        }
    }

    fn transmit_frame(&mut self, kind: StreamKind, frame: SubMessage) {
        let characteristic = gatt::frame_characteristic(self.role, kind);
        self.enqueue_write(characteristic, frame.encode(), Some(WriteTag::Frame(kind)));
        let timer = self.alarm(self.config.ack_timeout, InternalEvent::AckTimeout(kind));
        self.stream_mut(kind).ack_timer = Some(timer);
    }

    /// The same frame goes out again until it is acknowledged or the link
    /// is torn down.
    fn retransmit(&mut self, kind: StreamKind) {
        if self.phase != Phase::Connected {
            return;
        }
        let frame = self
            .stream_mut(kind)
            .in_flight
            .as_ref()
            .map(|f| f.frame.clone());
        if let Some(frame) = frame {
            debug!(
                ?kind,
                id = %frame.message_id,
                seq = %frame.sub_sequence,
                "retransmitting sub-message"
            );
            self.transmit_frame(kind, frame);
        }
    }

    fn handle_app_ack(&mut self, kind: StreamKind, bytes: Vec<u8>) {
        let (id, seq) = match wire::decode_ack(&bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, "dropping malformed ack");
                return;
            }
        };
        let matched = {
            let stream = self.stream_mut(kind);
            match stream.in_flight.as_mut() {
                Some(f) if f.frame.message_id == id && f.frame.sub_sequence == seq => {
                    f.app_acked = true;
                    true
                }
                // A late ack for an earlier transmission of a frame we have
                // already moved past.
                _ => false,
            }
        };
        if matched {
            self.advance_if_delivered(kind);
        }
    }

    fn advance_if_delivered(&mut self, kind: StreamKind) {
        let complete = {
            let stream = self.stream_mut(kind);
            matches!(stream.in_flight, Some(ref f) if f.link_acked && f.app_acked)
        };
        if !complete {
            return;
        }
        let message_finished = {
            let stream = self.stream_mut(kind);
            stream.in_flight = None;
            stream.ack_timer = None;
            stream
                .queue
                .front()
                .map(|m| m.frames.is_empty())
                .unwrap_or(false)
        };
        if message_finished {
            let done = self.stream_mut(kind).queue.pop_front().and_then(|m| m.done);
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        self.pump(kind);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, kind: StreamKind, bytes: Vec<u8>) {
        let frame = match SubMessage::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "dropping malformed frame");
                return;
            }
        };
        let id = frame.message_id.clone();
        if self.recently_delivered.contains(&id) {
            self.send_ack(kind, &frame);
            return;
        }
        let progress = match self.receiving.entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(PartialMessage {
                    payload: frame.payload.clone(),
                    last_sub_seq: frame.sub_sequence.clone(),
                });
                ReceiveProgress::Advanced
            }
            Entry::Occupied(mut slot) => {
                let partial = slot.get_mut();
                let mut expected = partial.last_sub_seq.clone();
                expected.increment();
                if frame.sub_sequence == expected {
                    partial.payload.extend_from_slice(&frame.payload);
                    partial.last_sub_seq = frame.sub_sequence.clone();
                    ReceiveProgress::Advanced
                } else if frame.sub_sequence <= partial.last_sub_seq {
                    ReceiveProgress::Stale
                } else {
                    ReceiveProgress::Gap
                }
            }
        };
        match progress {
            // Withholding the ack makes the source retransmit into the gap.
            ReceiveProgress::Gap => {
                debug!(id = %id, seq = %frame.sub_sequence, "sequence gap, dropping frame");
            }
            ReceiveProgress::Stale => self.send_ack(kind, &frame),
            ReceiveProgress::Advanced => {
                if frame.is_final() {
                    if let Some(partial) = self.receiving.remove(&id) {
                        self.remember_delivered(id);
                        match tools::take_first_char(&partial.payload) {
                            Some((header, rest)) => {
                                let message =
                                    Message::received(self.shared.peer(), header, rest.to_vec());
                                self.notice(ChannelNotice::MessageReceived { message, kind });
                            }
                            None => warn!("discarding message without a header character"),
                        }
                    }
                }
                self.send_ack(kind, &frame);
            }
        }
    }

    fn send_ack(&mut self, kind: StreamKind, frame: &SubMessage) {
        self.pending_acks += 1;
        self.enqueue_write(
            gatt::ack_characteristic(kind),
            frame.ack_bytes(),
            Some(WriteTag::Ack),
        );
    }

    fn remember_delivered(&mut self, id: SequenceNumber) {
        self.recently_delivered.push_back(id);
        while self.recently_delivered.len() > self.config.recently_delivered_capacity {
            self.recently_delivered.pop_front();
        }
    }

    // ------------------------------------------------------------------
    // Name updates
    // ------------------------------------------------------------------

    fn push_name_update(&mut self, unique_name: String) {
        self.local_name = unique_name.clone();
        if self.phase == Phase::Connected {
            self.enqueue_write(
                gatt::name_update_characteristic(self.role),
                unique_name.into_bytes(),
                None,
            );
        }
    }

    fn handle_name_update(&mut self, value: Vec<u8>) {
        let name = String::from_utf8_lossy(&value).into_owned();
        let old = self.shared.peer();
        self.shared.with_peer(|p| p.set_unique_name(&name));
        let new = self.shared.peer();
        if old.unique_name() != new.unique_name() {
            self.notice(ChannelNotice::PeerUpdated { old, new });
        }
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    fn begin_disconnect(&mut self, done: Option<oneshot::Sender<()>>) {
        match self.phase {
            Phase::Reconnecting => {
                // Nothing to say over the air; stop recovering.
                if let Some(done) = done {
                    let _ = done.send(());
                }
                self.close_now(true);
            }
            Phase::Connected => {
                self.shared.with_peer(|p| p.set_disconnecting(true));
                self.abandon_streams();
                self.disconnect_done = done;
                self.enqueue_write(
                    gatt::disconnection_characteristic(self.role),
                    DISCONNECTION_NOTICE.to_vec(),
                    Some(WriteTag::DisconnectNotice),
                );
                self.disconnect_timer = Some(self.alarm(
                    self.config.disconnect_ack_timeout,
                    InternalEvent::DisconnectAckTimeout,
                ));
                self.phase = Phase::Disconnecting;
            }
            Phase::Disconnecting | Phase::Closed => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            _ => {
                // The handshake never completed; tear down quietly.
                if let Some(done) = done {
                    let _ = done.send(());
                }
                self.close_now(false);
            }
        }
    }

    fn handle_remote_disconnect(&mut self) {
        match self.phase {
            // Already tearing down; the remote notice changes nothing.
            Phase::Disconnecting | Phase::Closed => return,
            Phase::Connected | Phase::Reconnecting => {}
            // Never connected; just drop the link quietly.
            _ => {
                self.close_now(false);
                return;
            }
        }
        info!(peer = %self.shared.peer().unique_name(), "remote requested disconnection");
        self.shared.with_peer(|p| p.set_disconnecting(true));
        self.abandon_streams();
        self.phase = Phase::Disconnecting;
        self.start_close();
    }

    fn handle_link_down(&mut self) {
        self.shared.with_peer(|p| p.set_hardware_connected(false));
        self.detach_link();
        match self.phase {
            Phase::Disconnecting => {
                self.cancel_timers();
                if let Some(done) = self.disconnect_done.take() {
                    let _ = done.send(());
                }
                info!(peer = %self.shared.peer().unique_name(), "link closed");
                self.notice(ChannelNotice::Closed {
                    peer: self.shared.peer(),
                    was_connected: true,
                });
                self.phase = Phase::Closed;
            }
            Phase::Connected => {
                info!(peer = %self.shared.peer().unique_name(), "connection lost, starting recovery");
                self.shared.with_peer(|p| p.set_reconnecting(true, false));
                for kind in StreamKind::ALL {
                    self.stream_mut(kind).ack_timer = None;
                }
                self.reconnection_timer = Some(self.alarm(
                    self.config.reconnection_timeout,
                    InternalEvent::ReconnectionTimeout,
                ));
                self.phase = Phase::Reconnecting;
                self.notice(ChannelNotice::ConnectionLost {
                    peer: self.shared.peer(),
                });
            }
            Phase::Reconnecting | Phase::Closed => {}
            _ if self.phase.is_resume_handshake() => self.revert_to_reconnecting(),
            _ => {
                // The link died before the handshake finished.
                self.cancel_timers();
                let peer = self.shared.peer();
                if self.role == Role::Central || !peer.unique_name().is_empty() {
                    self.notice(ChannelNotice::ConnectionFailed {
                        peer,
                        reason: ConnectFailReason::Error,
                    });
                }
                self.notice(ChannelNotice::Closed {
                    peer: self.shared.peer(),
                    was_connected: false,
                });
                self.phase = Phase::Closed;
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Write {
                kind,
                message,
                done,
            } => self.queue_message(kind, message, done),
            ChannelCommand::Accept => self.answer_connection_request(true),
            ChannelCommand::Reject => self.answer_connection_request(false),
            ChannelCommand::Resume { link, events } => self.handle_resume(link, events).await,
            ChannelCommand::NameUpdate { unique_name } => self.push_name_update(unique_name),
            ChannelCommand::Disconnect { done } => self.begin_disconnect(done),
            ChannelCommand::Shutdown => self.shutdown(),
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::HandshakeTimeout => {
                if self.phase.is_handshake() {
                    warn!(peer = %self.shared.peer().unique_name(), "handshake timed out");
                    self.fail_handshake(ConnectFailReason::Error);
                }
            }
            InternalEvent::ReconnectionTimeout => {
                if self.phase == Phase::Reconnecting || self.phase.is_resume_handshake() {
                    info!(peer = %self.shared.peer().unique_name(), "reconnection window elapsed");
                    self.close_now(true);
                }
            }
            InternalEvent::DisconnectAckTimeout => {
                if self.phase == Phase::Disconnecting {
                    // Proceed without the ack.
                    if let Some(done) = self.disconnect_done.take() {
                        let _ = done.send(());
                    }
                    self.start_close();
                }
            }
            InternalEvent::DisconnectWatchdog => {
                if self.phase == Phase::Disconnecting {
                    warn!("link never reported down");
                    self.notice(ChannelNotice::DisconnectionFailed);
                }
            }
            InternalEvent::AckTimeout(kind) => self.retransmit(kind),
            InternalEvent::WriteDone { tag, ok } => self.handle_write_done(tag, ok),
        }
    }

    fn handle_write_done(&mut self, tag: WriteTag, ok: bool) {
        match tag {
            WriteTag::Frame(kind) => {
                if !ok {
                    debug!(?kind, "frame write failed, retrying on ack timeout");
                    return;
                }
                let matched = {
                    let stream = self.stream_mut(kind);
                    match stream.in_flight.as_mut() {
                        Some(in_flight) => {
                            in_flight.link_acked = true;
                            true
                        }
                        None => false,
                    }
                };
                if matched {
                    self.advance_if_delivered(kind);
                }
            }
            WriteTag::Ack => {
                self.pending_acks = self.pending_acks.saturating_sub(1);
                if self.pending_acks == 0 {
                    self.pump_all();
                }
            }
            WriteTag::ConnectionAccept => {
                if ok {
                    self.handshake_timer = None;
                    self.shared.with_peer(|p| p.set_connected(true));
                    self.phase = Phase::Connected;
                    info!(peer = %self.shared.peer().unique_name(), "connection accepted");
                    self.notice(ChannelNotice::ConnectionSuccess {
                        peer: self.shared.peer(),
                    });
                    self.pump_all();
                } else {
                    self.fail_handshake(ConnectFailReason::Error);
                }
            }
            WriteTag::ConnectionReject => self.close_now(false),
            WriteTag::ResumeAccept => {
                if ok {
                    self.complete_resume();
                } else {
                    self.revert_to_reconnecting();
                }
            }
            WriteTag::DisconnectNotice => {
                if self.phase == Phase::Disconnecting {
                    self.disconnect_timer = None;
                    if let Some(done) = self.disconnect_done.take() {
                        let _ = done.send(());
                    }
                    self.start_close();
                }
            }
        }
    }

    async fn handle_received(&mut self, characteristic: CharacteristicId, value: Vec<u8>) {
        match self.phase {
            Phase::CentralMtuProbe { .. } if characteristic == CharacteristicId::MtuResponse => {
                self.continue_central_handshake(value.len()).await;
                return;
            }
            Phase::CentralConnecting { resume: false }
                if characteristic == CharacteristicId::ConnectionResponse =>
            {
                self.finish_central_handshake(value.first().copied());
                return;
            }
            Phase::CentralConnecting { resume: true }
                if characteristic == CharacteristicId::ConnectionResumedSend =>
            {
                self.finish_central_resume(value.first().copied());
                return;
            }
            _ => {}
        }
        match characteristic {
            CharacteristicId::MtuRequest => {
                let usable = self.link.as_ref().map(|l| l.mtu() as usize).unwrap_or(0);
                self.enqueue_write(CharacteristicId::MtuResponse, vec![0u8; usable], None);
            }
            CharacteristicId::ConnectionRequest => self.handle_connection_request(value),
            CharacteristicId::ConnectionResumedReceive => self.hand_off_resume(value),
            CharacteristicId::NameUpdateReceive | CharacteristicId::NameUpdateSend => {
                self.handle_name_update(value)
            }
            CharacteristicId::DisconnectionReceive | CharacteristicId::DisconnectionSend => {
                self.handle_remote_disconnect()
            }
            _ => {
                if let Some(kind) = gatt::inbound_frame_stream(self.role, characteristic) {
                    self.handle_frame(kind, value);
                } else if let Some(kind) = gatt::inbound_ack_stream(characteristic) {
                    self.handle_app_ack(kind, value);
                } else {
                    debug!(?characteristic, "ignoring unexpected value");
                }
            }
        }
    }
}

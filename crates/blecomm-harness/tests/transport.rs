//! End-to-end transport tests: two (or three) full communicators talking
//! over the virtual bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use blecomm_core::{
    Communicator, Config, ConnectFailReason, Event, Message, OpStatus, Peer, Role,
};
use blecomm_harness::VirtualBus;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

struct Node {
    communicator: Arc<Communicator>,
    events: UnboundedReceiver<Event>,
}

fn node(bus: &VirtualBus, address: &str, name: &str) -> Node {
    let communicator = Communicator::new(bus.adapter(address), name, Config::testing());
    let events = communicator.subscribe();
    Node {
        communicator,
        events,
    }
}

/// Wait until `pick` matches an event, skipping everything else.
async fn expect<T>(
    events: &mut UnboundedReceiver<Event>,
    mut pick: impl FnMut(&Event) -> Option<T>,
) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn peer_found(name: &str) -> impl FnMut(&Event) -> Option<Peer> + '_ {
    move |event| match event {
        Event::PeerFound { peer } if peer.unique_name().starts_with(name) => Some(peer.clone()),
        _ => None,
    }
}

fn message_received(event: &Event) -> Option<Message> {
    match event {
        Event::MessageReceived { message, .. } => Some(message.clone()),
        _ => None,
    }
}

fn data_received(event: &Event) -> Option<Message> {
    match event {
        Event::DataReceived { message, .. } => Some(message.clone()),
        _ => None,
    }
}

/// Advertise on `b`, discover from `a`, connect and accept. Returns the two
/// connected-peer snapshots: `b` as seen by `a`, and `a` as seen by `b`.
async fn connect_pair(a: &mut Node, b: &mut Node, b_name: &str) -> (Peer, Peer) {
    // Idempotent across repeated pairings: AlreadyStarted is fine here.
    b.communicator.start_advertising();
    a.communicator.start_discovery();

    let found = expect(&mut a.events, peer_found(b_name)).await;
    assert!(a.communicator.connect(&found).is_success());

    let request = expect(&mut b.events, |event| match event {
        Event::ConnectionRequest { peer } => Some(peer.clone()),
        _ => None,
    })
    .await;
    assert!(b.communicator.accept_connection(&request).is_success());

    let peer_b = expect(&mut a.events, |event| match event {
        Event::ConnectionSuccess { peer, role: Role::Central } => Some(peer.clone()),
        _ => None,
    })
    .await;
    let peer_a = expect(&mut b.events, |event| match event {
        Event::ConnectionSuccess { peer, role: Role::Peripheral } => Some(peer.clone()),
        _ => None,
    })
    .await;
    (peer_b, peer_a)
}

/// Assert that no event matched by `reject` shows up within `window`.
async fn expect_silence(
    events: &mut UnboundedReceiver<Event>,
    window: Duration,
    mut reject: impl FnMut(&Event) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => assert!(!reject(&event), "unexpected event: {event:?}"),
            Ok(None) | Err(_) => return,
        }
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test]
async fn single_chunk_round_trip() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:01", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:02", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    a.communicator.send_message(Message::text("a", "hi"));

    let received = expect(&mut b.events, message_received).await;
    assert_eq!(received.header(), "a");
    assert_eq!(received.as_text(), "hi");
    assert_eq!(
        received.sender().expect("sender is set").unique_name(),
        a.communicator.unique_name()
    );

    // The peripheral side sends over notifications; same contract.
    b.communicator.send_message(Message::text("b", "hello back"));
    let reply = expect(&mut a.events, message_received).await;
    assert_eq!(reply.header(), "b");
    assert_eq!(reply.as_text(), "hello back");
    assert_eq!(
        reply.sender().expect("sender is set").unique_name(),
        b.communicator.unique_name()
    );
}

#[tokio::test]
async fn multi_chunk_split_and_reassembly() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:11", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:12", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    // 500 payload bytes + 1 header byte split as 184 + 184 + 133.
    let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    a.communicator
        .send_data(Message::binary("x", payload.clone()));

    let received = expect(&mut b.events, data_received).await;
    assert_eq!(received.header(), "x");
    assert_eq!(received.data(), payload.as_slice());
}

#[tokio::test]
async fn lost_ack_causes_retransmit_not_duplicate_delivery() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:21", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:22", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    bus.drop_acks("AA:00:00:00:00:21", "AA:00:00:00:00:22", 1);

    a.communicator.send_message(Message::text("a", "first"));
    let received = expect(&mut b.events, message_received).await;
    assert_eq!(received.as_text(), "first");

    // The retransmitted frame is absorbed by duplicate suppression.
    expect_silence(&mut b.events, Duration::from_millis(400), |event| {
        matches!(event, Event::MessageReceived { .. })
    })
    .await;

    // The stream advances: a later message still arrives, in order.
    a.communicator.send_message(Message::text("a", "second"));
    let received = expect(&mut b.events, message_received).await;
    assert_eq!(received.as_text(), "second");
}

#[tokio::test]
async fn ordering_is_preserved_per_stream() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:31", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:32", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    for i in 0..5 {
        a.communicator
            .send_message(Message::text("n", &format!("msg-{i}")));
    }
    for i in 0..5 {
        let received = expect(&mut b.events, message_received).await;
        assert_eq!(received.as_text(), format!("msg-{i}"));
    }
}

#[tokio::test]
async fn link_loss_recovers_and_drains_queued_messages() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:41", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:42", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    bus.sever_links("AA:00:00:00:00:41", "AA:00:00:00:00:42");

    expect(&mut a.events, |event| {
        matches!(event, Event::ConnectionLost { .. }).then_some(())
    })
    .await;
    expect(&mut b.events, |event| {
        matches!(event, Event::ConnectionLost { .. }).then_some(())
    })
    .await;

    // Messages sent while reconnecting are queued, not dropped.
    a.communicator.send_message(Message::text("q", "queued-1"));
    a.communicator.send_message(Message::text("q", "queued-2"));

    expect(&mut a.events, |event| {
        matches!(event, Event::ConnectionResumed { .. }).then_some(())
    })
    .await;
    expect(&mut b.events, |event| {
        matches!(event, Event::ConnectionResumed { .. }).then_some(())
    })
    .await;

    let first = expect(&mut b.events, message_received).await;
    assert_eq!(first.as_text(), "queued-1");
    let second = expect(&mut b.events, message_received).await;
    assert_eq!(second.as_text(), "queued-2");
}

#[tokio::test]
async fn rejected_connection_fails_cleanly() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:51", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:52", "bob");

    assert!(b.communicator.start_advertising().is_success());
    assert!(a.communicator.start_discovery().is_success());

    let found = expect(&mut a.events, peer_found("bob")).await;
    assert!(a.communicator.connect(&found).is_success());

    let request = expect(&mut b.events, |event| match event {
        Event::ConnectionRequest { peer } => Some(peer.clone()),
        _ => None,
    })
    .await;
    assert!(b.communicator.reject_connection(&request).is_success());

    let reason = expect(&mut a.events, |event| match event {
        Event::ConnectionFailed { reason, .. } => Some(*reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, ConnectFailReason::Rejected);
    assert!(a.communicator.connected_peers().is_empty());
    assert!(b.communicator.connected_peers().is_empty());
}

#[tokio::test]
async fn receiver_targeting_filters_broadcast() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:61", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:62", "bob");
    let mut c = node(&bus, "AA:00:00:00:00:63", "carol");

    connect_pair(&mut a, &mut b, "bob").await;
    let (peer_c, _) = connect_pair(&mut a, &mut c, "carol").await;

    a.communicator
        .send_message(Message::text("t", "for carol only").with_receiver(peer_c));

    let received = expect(&mut c.events, message_received).await;
    assert_eq!(received.as_text(), "for carol only");

    expect_silence(&mut b.events, Duration::from_millis(400), |event| {
        matches!(event, Event::MessageReceived { .. })
    })
    .await;

    // An untargeted message reaches both.
    a.communicator.send_message(Message::text("t", "everyone"));
    let at_b = expect(&mut b.events, message_received).await;
    let at_c = expect(&mut c.events, message_received).await;
    assert_eq!(at_b.as_text(), "everyone");
    assert_eq!(at_c.as_text(), "everyone");
}

#[tokio::test]
async fn clean_disconnect_notifies_both_sides() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:71", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:72", "bob");
    let (peer_b, _) = connect_pair(&mut a, &mut b, "bob").await;

    assert!(a.communicator.disconnect(&peer_b).is_success());

    let peers_left = expect(&mut a.events, |event| match event {
        Event::Disconnected { peers_left, .. } => Some(*peers_left),
        _ => None,
    })
    .await;
    assert_eq!(peers_left, 0);

    expect(&mut b.events, |event| {
        matches!(event, Event::Disconnected { .. }).then_some(())
    })
    .await;
    assert!(a.communicator.connected_peers().is_empty());
    assert!(b.communicator.connected_peers().is_empty());
}

#[tokio::test]
async fn text_and_binary_streams_are_independent() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:81", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:82", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    a.communicator
        .send_data(Message::binary("d", vec![7u8; 600]));
    a.communicator.send_message(Message::text("m", "text"));

    // The streams interleave freely, so gather both without assuming an
    // arrival order.
    let mut text = None;
    let mut data = None;
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while text.is_none() || data.is_none() {
            match b.events.recv().await.expect("event stream closed") {
                Event::MessageReceived { message, .. } => text = Some(message),
                Event::DataReceived { message, .. } => data = Some(message),
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for both streams");

    assert_eq!(text.expect("text message").as_text(), "text");
    assert_eq!(data.expect("data message").data(), vec![7u8; 600].as_slice());
}

// ----------------------------------------------------------------------------
// Lifecycle and return codes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_return_codes() {
    let bus = VirtualBus::new();
    let a = node(&bus, "AA:00:00:00:00:91", "alice");

    assert_eq!(a.communicator.start_advertising(), OpStatus::Success);
    assert_eq!(a.communicator.start_advertising(), OpStatus::AlreadyStarted);
    assert_eq!(a.communicator.stop_advertising(), OpStatus::Success);
    assert_eq!(a.communicator.stop_advertising(), OpStatus::AlreadyStopped);

    assert_eq!(a.communicator.stop_discovery(), OpStatus::AlreadyStopped);
    assert_eq!(a.communicator.start_discovery(), OpStatus::Success);
    assert_eq!(a.communicator.start_discovery(), OpStatus::AlreadyStarted);
    assert_eq!(a.communicator.stop_discovery(), OpStatus::Success);
}

#[tokio::test]
async fn lifecycle_emits_events() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:A1", "alice");

    a.communicator.start_advertising();
    expect(&mut a.events, |event| {
        matches!(event, Event::AdvertiseStarted).then_some(())
    })
    .await;
    a.communicator.stop_advertising();
    expect(&mut a.events, |event| {
        matches!(event, Event::AdvertiseStopped).then_some(())
    })
    .await;
}

#[tokio::test]
async fn start_operations_require_the_main_thread() {
    let bus = VirtualBus::new();
    let a = node(&bus, "AA:00:00:00:00:B1", "alice");

    let communicator = Arc::clone(&a.communicator);
    let status = std::thread::spawn(move || communicator.start_advertising())
        .join()
        .expect("thread panicked");
    assert_eq!(status, OpStatus::NotMainThread);
    assert!(!a.communicator.is_advertising());
}

#[tokio::test]
async fn destroy_closes_the_event_stream() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:C1", "alice");

    a.communicator.destroy();
    let closed = tokio::time::timeout(EVENT_TIMEOUT, async {
        while a.events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "event stream never closed");
    assert_eq!(a.communicator.connect(&Peer::new(None, "xxYY")), OpStatus::Destroying);
}

#[tokio::test]
async fn set_name_propagates_to_connected_peers() {
    let bus = VirtualBus::new();
    let mut a = node(&bus, "AA:00:00:00:00:D1", "alice");
    let mut b = node(&bus, "AA:00:00:00:00:D2", "bob");
    connect_pair(&mut a, &mut b, "bob").await;

    assert!(a.communicator.set_name("alicia").is_success());

    let updated = expect(&mut b.events, |event| match event {
        Event::PeerUpdated { new, .. } => Some(new.clone()),
        _ => None,
    })
    .await;
    assert_eq!(updated.name(), "alicia");
    assert_eq!(updated.unique_name(), a.communicator.unique_name());
}

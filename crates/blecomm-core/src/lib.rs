//! Peer-to-peer BLE reliable-message transport.
//!
//! This crate lets two or more devices discover each other over Bluetooth
//! Low Energy, negotiate a connection, exchange arbitrary-length reliable
//! messages (text or binary), recover from transient radio drops, and
//! disconnect cleanly.
//!
//! ## Architecture Overview
//!
//! - [`Communicator`] — the facade the application talks to: advertising
//!   and discovery lifecycle, connect/accept/reject, the global outbound
//!   queues, and the event stream.
//! - Connections (internal) — one per BLE role. Any device is central and
//!   peripheral at once; each connection owns the channels of its role and
//!   fans messages out to them strictly in order.
//! - Channels (internal) — one per live link. A channel runs the
//!   handshake, the per-stream reliable send loop (one sub-message in
//!   flight, retransmitted until acknowledged), receive reassembly with
//!   duplicate suppression, the disconnection protocol and reconnection
//!   recovery.
//! - [`link`] — the contract with the host OS BLE stack. The core never
//!   touches a radio; a backend implements [`BleAdapter`] and [`LinkPort`].
//!   The `blecomm-harness` crate ships an in-memory implementation used by
//!   the integration tests.
//!
//! Messages longer than one link-layer packet are split into sub-messages
//! of at most 192 bytes ([`wire`]) and reassembled on the far side; text
//! and binary traffic travel as two independent streams with independent
//! ordering.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blecomm_core::{Communicator, Config, Event, Message};
//! # use blecomm_core::BleAdapter;
//!
//! # async fn example(adapter: Arc<dyn BleAdapter>) {
//! // Must run inside a tokio runtime; the constructing thread becomes the
//! // designated main thread for the start/stop operations.
//! let communicator = Communicator::new(adapter, "device name", Config::default());
//! let mut events = communicator.subscribe();
//!
//! communicator.start_advertising();
//! communicator.start_discovery();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::PeerFound { peer } => {
//!             communicator.connect(&peer);
//!         }
//!         Event::ConnectionRequest { peer } => {
//!             communicator.accept_connection(&peer);
//!         }
//!         Event::ConnectionSuccess { peer, .. } => {
//!             communicator.send_message(Message::text("a", "hello").with_receiver(peer));
//!         }
//!         Event::MessageReceived { message, .. } => {
//!             println!("{}: {}", message.sender().unwrap().name(), message.as_text());
//!         }
//!         _ => {}
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod gatt;
pub mod link;
pub mod message;
pub mod peer;
pub mod sequence;
pub mod wire;

mod channel;
mod communicator;
mod connection;
mod timer;
mod tools;

pub use communicator::Communicator;
pub use config::Config;
pub use error::{LinkError, LinkResult, WireError};
pub use events::{ConnectFailReason, Event, OpStatus, Role};
pub use gatt::{CharacteristicId, SERVICE_UUID};
pub use link::{AdapterEvent, BleAdapter, LinkEvent, LinkPort, SharedLink};
pub use message::Message;
pub use peer::{DeviceHandle, Peer};
pub use sequence::SequenceNumber;
pub use wire::{FrameKind, StreamKind, SubMessage};

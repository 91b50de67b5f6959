//! GATT service layout shared by both roles.
//!
//! A single primary service carries sixteen characteristics, one per
//! protocol concern and direction. Centrals write the `*Receive`
//! characteristics and subscribe to the `*Send` ones; peripherals notify the
//! `*Send` characteristics. The two `ReadResponse*` characteristics carry
//! the application-level (message_id ‖ sub_sequence) acknowledgements in
//! both directions: written by the central, notified by the peripheral.

use uuid::Uuid;

use crate::events::Role;
use crate::wire::StreamKind;

// ----------------------------------------------------------------------------
// UUIDs
// ----------------------------------------------------------------------------

/// Primary service advertised and scanned for.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1234_0000_1000_8000_00805F9B34FB);

/// Bluetooth base UUID with a zeroed 16-bit slot.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

// ----------------------------------------------------------------------------
// Characteristics
// ----------------------------------------------------------------------------

/// Every characteristic of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    ConnectionRequest,
    ConnectionResponse,
    MtuRequest,
    MtuResponse,
    MessageReceive,
    MessageSend,
    ReadResponseMessageReceived,
    DataReceive,
    DataSend,
    ReadResponseDataReceived,
    NameUpdateReceive,
    NameUpdateSend,
    ConnectionResumedReceive,
    ConnectionResumedSend,
    DisconnectionReceive,
    DisconnectionSend,
}

impl CharacteristicId {
    pub const ALL: [CharacteristicId; 16] = [
        CharacteristicId::ConnectionRequest,
        CharacteristicId::ConnectionResponse,
        CharacteristicId::MtuRequest,
        CharacteristicId::MtuResponse,
        CharacteristicId::MessageReceive,
        CharacteristicId::MessageSend,
        CharacteristicId::ReadResponseMessageReceived,
        CharacteristicId::DataReceive,
        CharacteristicId::DataSend,
        CharacteristicId::ReadResponseDataReceived,
        CharacteristicId::NameUpdateReceive,
        CharacteristicId::NameUpdateSend,
        CharacteristicId::ConnectionResumedReceive,
        CharacteristicId::ConnectionResumedSend,
        CharacteristicId::DisconnectionReceive,
        CharacteristicId::DisconnectionSend,
    ];

    /// 16-bit-style UUID of this characteristic.
    pub const fn uuid(self) -> Uuid {
        short_uuid(match self {
            CharacteristicId::ConnectionRequest => 0xBC01,
            CharacteristicId::ConnectionResponse => 0xBC02,
            CharacteristicId::MtuRequest => 0xBC03,
            CharacteristicId::MtuResponse => 0xBC04,
            CharacteristicId::MessageReceive => 0xBC05,
            CharacteristicId::MessageSend => 0xBC06,
            CharacteristicId::ReadResponseMessageReceived => 0xBC07,
            CharacteristicId::DataReceive => 0xBC08,
            CharacteristicId::DataSend => 0xBC09,
            CharacteristicId::ReadResponseDataReceived => 0xBC0A,
            CharacteristicId::NameUpdateReceive => 0xBC0B,
            CharacteristicId::NameUpdateSend => 0xBC0C,
            CharacteristicId::ConnectionResumedReceive => 0xBC0D,
            CharacteristicId::ConnectionResumedSend => 0xBC0E,
            CharacteristicId::DisconnectionReceive => 0xBC0F,
            CharacteristicId::DisconnectionSend => 0xBC10,
        })
    }
}

/// Peripheral-to-central characteristics a central subscribes to after the
/// MTU probe (`MtuResponse` is subscribed first, before the probe write).
pub const CENTRAL_SUBSCRIPTIONS: [CharacteristicId; 8] = [
    CharacteristicId::ConnectionResponse,
    CharacteristicId::MessageSend,
    CharacteristicId::DataSend,
    CharacteristicId::NameUpdateSend,
    CharacteristicId::ConnectionResumedSend,
    CharacteristicId::DisconnectionSend,
    CharacteristicId::ReadResponseMessageReceived,
    CharacteristicId::ReadResponseDataReceived,
];

// ----------------------------------------------------------------------------
// Wire constants
// ----------------------------------------------------------------------------

/// Handshake/resume response byte meaning "accepted".
pub const RESPONSE_ACCEPT: u8 = b'0';

/// Handshake/resume response byte meaning "rejected".
pub const RESPONSE_REJECT: u8 = b'1';

/// Body of a disconnection notice. BLE disallows zero-length characteristic
/// writes; a single byte satisfies that.
pub const DISCONNECTION_NOTICE: [u8; 1] = [1];

// ----------------------------------------------------------------------------
// Role/stream routing
// ----------------------------------------------------------------------------

/// Characteristic a sender of `role` uses to transmit frames of `kind`.
pub(crate) fn frame_characteristic(role: Role, kind: StreamKind) -> CharacteristicId {
    match (role, kind) {
        (Role::Central, StreamKind::Text) => CharacteristicId::MessageReceive,
        (Role::Central, StreamKind::Binary) => CharacteristicId::DataReceive,
        (Role::Peripheral, StreamKind::Text) => CharacteristicId::MessageSend,
        (Role::Peripheral, StreamKind::Binary) => CharacteristicId::DataSend,
    }
}

/// Characteristic carrying application-level acks for `kind`, either
/// direction.
pub(crate) fn ack_characteristic(kind: StreamKind) -> CharacteristicId {
    match kind {
        StreamKind::Text => CharacteristicId::ReadResponseMessageReceived,
        StreamKind::Binary => CharacteristicId::ReadResponseDataReceived,
    }
}

/// Stream a received frame belongs to, from the receiving role's view.
pub(crate) fn inbound_frame_stream(role: Role, ch: CharacteristicId) -> Option<StreamKind> {
    match (role, ch) {
        (Role::Central, CharacteristicId::MessageSend) => Some(StreamKind::Text),
        (Role::Central, CharacteristicId::DataSend) => Some(StreamKind::Binary),
        (Role::Peripheral, CharacteristicId::MessageReceive) => Some(StreamKind::Text),
        (Role::Peripheral, CharacteristicId::DataReceive) => Some(StreamKind::Binary),
        _ => None,
    }
}

/// Stream a received application-level ack refers to.
pub(crate) fn inbound_ack_stream(ch: CharacteristicId) -> Option<StreamKind> {
    match ch {
        CharacteristicId::ReadResponseMessageReceived => Some(StreamKind::Text),
        CharacteristicId::ReadResponseDataReceived => Some(StreamKind::Binary),
        _ => None,
    }
}

/// Characteristic a `role` uses to announce its own disconnection.
pub(crate) fn disconnection_characteristic(role: Role) -> CharacteristicId {
    match role {
        Role::Central => CharacteristicId::DisconnectionReceive,
        Role::Peripheral => CharacteristicId::DisconnectionSend,
    }
}

/// Characteristic a `role` uses to push a name update.
pub(crate) fn name_update_characteristic(role: Role) -> CharacteristicId {
    match role {
        Role::Central => CharacteristicId::NameUpdateReceive,
        Role::Peripheral => CharacteristicId::NameUpdateSend,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_uuid_matches_wire_constant() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00001234-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn characteristic_uuids_are_distinct() {
        for (i, a) in CharacteristicId::ALL.iter().enumerate() {
            for b in &CharacteristicId::ALL[i + 1..] {
                assert_ne!(a.uuid(), b.uuid(), "{a:?} collides with {b:?}");
            }
        }
    }

    #[test]
    fn short_uuids_use_the_bluetooth_base() {
        let uuid = CharacteristicId::ConnectionRequest.uuid().to_string();
        assert!(uuid.starts_with("0000bc01-0000-1000-8000-"));
    }

    #[test]
    fn frame_routing_is_symmetric() {
        for kind in [StreamKind::Text, StreamKind::Binary] {
            let written = frame_characteristic(Role::Central, kind);
            assert_eq!(inbound_frame_stream(Role::Peripheral, written), Some(kind));
            let notified = frame_characteristic(Role::Peripheral, kind);
            assert_eq!(inbound_frame_stream(Role::Central, notified), Some(kind));
        }
    }

    #[test]
    fn ack_characteristics_route_back_to_their_stream() {
        for kind in [StreamKind::Text, StreamKind::Binary] {
            assert_eq!(inbound_ack_stream(ack_characteristic(kind)), Some(kind));
        }
        assert_eq!(inbound_ack_stream(CharacteristicId::MessageSend), None);
    }
}

//! Error types for the transport core.

use thiserror::Error;

use crate::gatt::CharacteristicId;

// ----------------------------------------------------------------------------
// Wire errors
// ----------------------------------------------------------------------------

/// Errors produced while decoding an on-wire sub-message frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame too short: {len} bytes (minimum 8)")]
    FrameTooShort { len: usize },

    #[error("unknown frame kind byte {0:#04x}")]
    InvalidFrameKind(u8),

    #[error("sequence digit {0:#04x} outside the printable alphabet")]
    InvalidSequenceDigit(u8),

    #[error("payload of {len} bytes exceeds the {max}-byte frame budget")]
    PayloadTooLarge { len: usize, max: usize },
}

// ----------------------------------------------------------------------------
// Link errors
// ----------------------------------------------------------------------------

/// Errors reported by the host OS BLE stack behind the link traits.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is closed")]
    Closed,

    #[error("characteristic not available: {0:?}")]
    CharacteristicUnavailable(CharacteristicId),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("MTU negotiation failed: {0}")]
    MtuNegotiationFailed(String),

    #[error("adapter unavailable")]
    AdapterUnavailable,

    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

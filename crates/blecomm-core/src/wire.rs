//! On-wire sub-message frames.
//!
//! Application messages are split into sub-messages of at most
//! [`SUB_MESSAGE_TOTAL`] bytes, each prefixed with an 8-byte header:
//!
//! | field        | width | encoding                                     |
//! |--------------|-------|----------------------------------------------|
//! | message_id   | 4     | [`SequenceNumber`], per complete message     |
//! | sub_sequence | 3     | [`SequenceNumber`], 0-based within a message |
//! | kind         | 1     | `'1'` non-final, `'2'` final                 |
//! | payload      | ≤184  | header char + payload slice (first frame)    |

use crate::error::WireError;
use crate::sequence::{SequenceNumber, MESSAGE_ID_WIDTH, SUB_SEQUENCE_WIDTH};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Link MTU requested from the OS stack during the handshake.
pub const TARGET_MTU: usize = 247;

/// Total size budget of one encoded sub-message.
pub const SUB_MESSAGE_TOTAL: usize = 192;

/// Encoded header size.
pub const SUB_MESSAGE_HEADER: usize = MESSAGE_ID_WIDTH + SUB_SEQUENCE_WIDTH + 1;

/// Maximum payload bytes per sub-message.
pub const SUB_MESSAGE_PAYLOAD: usize = SUB_MESSAGE_TOTAL - SUB_MESSAGE_HEADER;

/// Encoded size of an application-level acknowledgement (id ‖ sub_sequence).
pub const ACK_LENGTH: usize = MESSAGE_ID_WIDTH + SUB_SEQUENCE_WIDTH;

const KIND_NON_FINAL: u8 = b'1';
const KIND_FINAL: u8 = b'2';

// ----------------------------------------------------------------------------
// Stream kinds
// ----------------------------------------------------------------------------

/// The two independent reliable streams carried by a channel. Each has its
/// own characteristics, message-id counter and queues, so text and binary
/// traffic may interleave on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Text,
    Binary,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Text, StreamKind::Binary];
}

// ----------------------------------------------------------------------------
// Frame kind
// ----------------------------------------------------------------------------

/// Whether more sub-messages of the same message follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    NonFinal,
    Final,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::NonFinal => KIND_NON_FINAL,
            FrameKind::Final => KIND_FINAL,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            KIND_NON_FINAL => Ok(FrameKind::NonFinal),
            KIND_FINAL => Ok(FrameKind::Final),
            other => Err(WireError::InvalidFrameKind(other)),
        }
    }
}

// ----------------------------------------------------------------------------
// SubMessage
// ----------------------------------------------------------------------------

/// One framed chunk of a split application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    pub message_id: SequenceNumber,
    pub sub_sequence: SequenceNumber,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl SubMessage {
    pub fn new(
        message_id: SequenceNumber,
        sub_sequence: SequenceNumber,
        kind: FrameKind,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(payload.len() <= SUB_MESSAGE_PAYLOAD);
        Self {
            message_id,
            sub_sequence,
            kind,
            payload,
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == FrameKind::Final
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SUB_MESSAGE_HEADER + self.payload.len());
        bytes.extend_from_slice(self.message_id.to_bytes());
        bytes.extend_from_slice(self.sub_sequence.to_bytes());
        bytes.push(self.kind.to_byte());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse from wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < SUB_MESSAGE_HEADER {
            return Err(WireError::FrameTooShort { len: bytes.len() });
        }
        let payload_len = bytes.len() - SUB_MESSAGE_HEADER;
        if payload_len > SUB_MESSAGE_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                len: payload_len,
                max: SUB_MESSAGE_PAYLOAD,
            });
        }
        let message_id = SequenceNumber::from_bytes(&bytes[..MESSAGE_ID_WIDTH])?;
        let sub_sequence =
            SequenceNumber::from_bytes(&bytes[MESSAGE_ID_WIDTH..MESSAGE_ID_WIDTH + SUB_SEQUENCE_WIDTH])?;
        let kind = FrameKind::from_byte(bytes[SUB_MESSAGE_HEADER - 1])?;
        Ok(Self {
            message_id,
            sub_sequence,
            kind,
            payload: bytes[SUB_MESSAGE_HEADER..].to_vec(),
        })
    }

    /// The (message_id ‖ sub_sequence) bytes echoed back as the
    /// application-level acknowledgement.
    pub fn ack_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ACK_LENGTH);
        bytes.extend_from_slice(self.message_id.to_bytes());
        bytes.extend_from_slice(self.sub_sequence.to_bytes());
        bytes
    }
}

/// Parse an application-level acknowledgement back into its counters.
pub fn decode_ack(bytes: &[u8]) -> Result<(SequenceNumber, SequenceNumber), WireError> {
    if bytes.len() < ACK_LENGTH {
        return Err(WireError::FrameTooShort { len: bytes.len() });
    }
    let message_id = SequenceNumber::from_bytes(&bytes[..MESSAGE_ID_WIDTH])?;
    let sub_sequence = SequenceNumber::from_bytes(&bytes[MESSAGE_ID_WIDTH..ACK_LENGTH])?;
    Ok((message_id, sub_sequence))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> SubMessage {
        SubMessage::new(
            SequenceNumber::new(MESSAGE_ID_WIDTH),
            SequenceNumber::new(SUB_SEQUENCE_WIDTH),
            FrameKind::Final,
            payload.to_vec(),
        )
    }

    #[test]
    fn header_budget_adds_up() {
        assert_eq!(SUB_MESSAGE_HEADER, 8);
        assert_eq!(SUB_MESSAGE_PAYLOAD, 184);
    }

    #[test]
    fn encode_layout_is_canonical() {
        let mut id = SequenceNumber::new(MESSAGE_ID_WIDTH);
        id.increment();
        let mut seq = SequenceNumber::new(SUB_SEQUENCE_WIDTH);
        seq.increment();
        seq.increment();
        let sub = SubMessage::new(id, seq, FrameKind::NonFinal, b"payload".to_vec());
        let bytes = sub.encode();

        assert_eq!(&bytes[..4], b"!!!\"");
        assert_eq!(&bytes[4..7], b"!!#");
        assert_eq!(bytes[7], b'1');
        assert_eq!(&bytes[8..], b"payload");
    }

    #[test]
    fn decode_round_trips() {
        let sub = frame(b"ahello");
        let parsed = SubMessage::decode(&sub.encode()).unwrap();
        assert_eq!(parsed, sub);
    }

    #[test]
    fn decode_accepts_empty_payload() {
        let sub = frame(b"");
        let parsed = SubMessage::decode(&sub.encode()).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert!(matches!(
            SubMessage::decode(b"!!!!"),
            Err(WireError::FrameTooShort { len: 4 })
        ));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut bytes = frame(b"x").encode();
        bytes[7] = b'9';
        assert!(matches!(
            SubMessage::decode(&bytes),
            Err(WireError::InvalidFrameKind(b'9'))
        ));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut bytes = frame(b"").encode();
        bytes.extend_from_slice(&vec![0u8; SUB_MESSAGE_PAYLOAD + 1]);
        assert!(matches!(
            SubMessage::decode(&bytes),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn ack_bytes_round_trip() {
        let mut id = SequenceNumber::new(MESSAGE_ID_WIDTH);
        id.increment();
        let sub = SubMessage::new(
            id.clone(),
            SequenceNumber::new(SUB_SEQUENCE_WIDTH),
            FrameKind::Final,
            vec![],
        );
        let ack = sub.ack_bytes();
        assert_eq!(ack.len(), ACK_LENGTH);
        let (parsed_id, parsed_seq) = decode_ack(&ack).unwrap();
        assert_eq!(parsed_id, id);
        assert!(parsed_seq.is_zero());
    }
}

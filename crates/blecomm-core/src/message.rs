//! User-facing message container.
//!
//! A message carries a one-character header and a payload, either text or
//! raw bytes depending on which send path it travels. Setting a `receiver`
//! targets a single peer; leaving it unset broadcasts to every connected
//! peer. The `sender` is never transmitted: the receiving side fills it in
//! from the channel the message arrived on.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::peer::Peer;
use crate::sequence::{SequenceNumber, SUB_SEQUENCE_WIDTH};
use crate::tools;
use crate::wire::{FrameKind, SubMessage, SUB_MESSAGE_PAYLOAD};

/// Characters in a message header.
pub const HEADER_CHARS: usize = 1;

/// A text or binary message exchanged with one or all connected peers.
///
/// The header is a single character the application can use to distinguish
/// message types; pick any character and ignore it if a single type is
/// enough. Cloneable so it can double as a display/storage representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    sender: Option<Peer>,
    receiver: Option<Peer>,
    header: String,
    data: Vec<u8>,
}

impl Message {
    /// A text message for every connected peer.
    pub fn text(header: &str, text: &str) -> Self {
        Self {
            sender: None,
            receiver: None,
            header: tools::fix_char_length(header, HEADER_CHARS),
            data: text.as_bytes().to_vec(),
        }
    }

    /// A binary message for every connected peer.
    pub fn binary(header: &str, data: Vec<u8>) -> Self {
        Self {
            sender: None,
            receiver: None,
            header: tools::fix_char_length(header, HEADER_CHARS),
            data,
        }
    }

    /// Target a single peer instead of broadcasting.
    pub fn with_receiver(mut self, receiver: Peer) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Build a received message with the sender resolved from its channel.
    pub(crate) fn received(sender: Peer, header: String, data: Vec<u8>) -> Self {
        Self {
            sender: Some(sender),
            receiver: None,
            header,
            data,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn set_header(&mut self, header: &str) {
        self.header = tools::fix_char_length(header, HEADER_CHARS);
    }

    /// The peer this message came from; `None` on outgoing messages.
    pub fn sender(&self) -> Option<&Peer> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: Option<Peer>) {
        self.sender = sender;
    }

    /// The targeted peer; `None` means every connected peer.
    pub fn receiver(&self) -> Option<&Peer> {
        self.receiver.as_ref()
    }

    pub fn set_receiver(&mut self, receiver: Option<Peer>) {
        self.receiver = receiver;
    }

    /// Payload interpreted as UTF-8 text.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Split into ordered sub-messages under `message_id`.
    ///
    /// The byte stream to split is the header's UTF-8 bytes followed by the
    /// payload, so the first sub-message always starts with the header
    /// character and reassembly is the exact inverse. A message that fits in
    /// one chunk yields a single final frame.
    pub fn split_into_sub_messages(&self, message_id: &SequenceNumber) -> VecDeque<SubMessage> {
        let mut stream = Vec::with_capacity(self.header.len() + self.data.len());
        stream.extend_from_slice(self.header.as_bytes());
        stream.extend_from_slice(&self.data);

        let mut chunks = tools::split_bytes(&stream, SUB_MESSAGE_PAYLOAD);
        let mut sub_sequence = SequenceNumber::new(SUB_SEQUENCE_WIDTH);
        let mut frames = VecDeque::with_capacity(chunks.len());
        while let Some(chunk) = chunks.pop_front() {
            let kind = if chunks.is_empty() {
                FrameKind::Final
            } else {
                FrameKind::NonFinal
            };
            frames.push_back(SubMessage::new(
                message_id.clone(),
                sub_sequence.clone(),
                kind,
                chunk,
            ));
            sub_sequence.increment();
        }
        frames
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::MESSAGE_ID_WIDTH;

    fn message_id() -> SequenceNumber {
        SequenceNumber::new(MESSAGE_ID_WIDTH)
    }

    #[test]
    fn header_is_fixed_to_one_character() {
        assert_eq!(Message::text("abc", "x").header(), "a");
        assert_eq!(Message::text("", "x").header(), " ");
        assert_eq!(Message::text("☃!", "x").header(), "☃");
    }

    #[test]
    fn short_message_yields_single_final_frame() {
        let frames = Message::text("a", "hi").split_into_sub_messages(&message_id());
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert!(frame.is_final());
        assert!(frame.sub_sequence.is_zero());
        assert_eq!(frame.payload, b"ahi");
    }

    #[test]
    fn long_message_splits_into_ordered_chunks() {
        // 500 payload bytes plus one header byte: 184 + 184 + 133.
        let payload = vec![0x42u8; 500];
        let message = Message::binary("x", payload.clone());
        let frames = message.split_into_sub_messages(&message_id());

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), 184);
        assert_eq!(frames[1].payload.len(), 184);
        assert_eq!(frames[2].payload.len(), 133);
        assert!(!frames[0].is_final());
        assert!(!frames[1].is_final());
        assert!(frames[2].is_final());

        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sub_sequence.value(), i as u64);
        }
        assert_eq!(frames[0].payload[0], b'x');
    }

    #[test]
    fn split_then_reassemble_is_identity() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let message = Message::binary("q", payload.clone());

        let mut rebuilt = Vec::new();
        for frame in message.split_into_sub_messages(&message_id()) {
            rebuilt.extend_from_slice(&frame.payload);
        }
        let (header, rest) = tools::take_first_char(&rebuilt).unwrap();
        assert_eq!(header, "q");
        assert_eq!(rest, payload.as_slice());
    }

    #[test]
    fn multibyte_header_survives_split() {
        let message = Message::text("☃", "snow");
        let frames = message.split_into_sub_messages(&message_id());
        let (header, rest) = tools::take_first_char(&frames[0].payload).unwrap();
        assert_eq!(header, "☃");
        assert_eq!(rest, b"snow");
    }

    #[test]
    fn receiver_targeting() {
        let peer = Peer::new(None, "bobXY");
        let message = Message::text("a", "hello").with_receiver(peer.clone());
        assert!(message.receiver().unwrap().same_unique_name(&peer));
        assert!(Message::text("a", "hello").receiver().is_none());
    }

    #[test]
    fn text_accessor_round_trips() {
        let message = Message::text("a", "héllo ☃");
        assert_eq!(message.as_text(), "héllo ☃");
    }
}

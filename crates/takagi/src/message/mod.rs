// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! CoAP message model
//!
//! [`Message`] is the transport-neutral parsed form shared by the UDP and
//! TCP codecs. Type and message-id exist only on UDP (RFC 8323 drops both),
//! so they are optional fields; the UDP codec rejects messages without them.
//!
//! [`Options`] is an ordered multimap: entries are kept sorted by option
//! number, and repeated numbers (Uri-Path, Uri-Query) preserve insertion
//! order, which is exactly the order required on the wire.

mod request;
mod response;

pub use request::Request;
pub use response::Response;

use crate::codec::{bytes_to_uint, uint_to_bytes};

/// UDP message types (RFC 7252 Sec.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Confirmable - requires an ACK.
    Con = 0,
    /// Non-confirmable.
    Non = 1,
    /// Acknowledgement, pairs with a CON by message-id.
    Ack = 2,
    /// Reset - rejects a message.
    Rst = 3,
}

impl MessageType {
    /// Decode from the 2-bit wire field.
    pub fn from_wire(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Con,
            1 => MessageType::Non,
            2 => MessageType::Ack,
            _ => MessageType::Rst,
        }
    }

    /// Encode to the 2-bit wire field.
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// Transport a message was received on or will be sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// RFC 7252 datagram framing.
    Udp,
    /// RFC 8323 stream framing.
    Tcp,
}

/// Ordered multimap of option number -> raw value bytes.
///
/// Invariant: entries are sorted by number (non-decreasing); repeated
/// numbers keep insertion order. This makes wire emission a plain
/// iteration with delta encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Options {
    entries: Vec<(u16, Vec<u8>)>,
}

impl Options {
    /// Empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an option value, keeping the set ordered by number and
    /// preserving insertion order among equal numbers.
    pub fn insert(&mut self, number: u16, value: Vec<u8>) {
        let at = self
            .entries
            .iter()
            .position(|(n, _)| *n > number)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (number, value));
    }

    /// Insert an integer option with minimal big-endian encoding
    /// (0 encodes as zero bytes).
    pub fn insert_uint(&mut self, number: u16, value: u32) {
        self.insert(number, uint_to_bytes(value));
    }

    /// First value for the number, if present.
    pub fn first(&self, number: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }

    /// All values for the number, in insertion order.
    pub fn all(&self, number: u16) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    /// First value for the number decoded as a big-endian unsigned integer.
    pub fn uint(&self, number: u16) -> Option<u32> {
        self.first(number).map(bytes_to_uint)
    }

    /// True when at least one value is present for the number.
    pub fn contains(&self, number: u16) -> bool {
        self.entries.iter().any(|(n, _)| *n == number)
    }

    /// Remove every value for the number.
    pub fn remove(&mut self, number: u16) {
        self.entries.retain(|(n, _)| *n != number);
    }

    /// Replace every value for the number with one value.
    pub fn set(&mut self, number: u16, value: Vec<u8>) {
        self.remove(number);
        self.insert(number, value);
    }

    /// Replace every value for the number with one integer value.
    pub fn set_uint(&mut self, number: u16, value: u32) {
        self.set(number, uint_to_bytes(value));
    }

    /// Iterate entries in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.entries.iter().map(|(n, v)| (*n, v.as_slice()))
    }

    /// Number of option values (repetitions counted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no options are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One CoAP message, parsed or about to be encoded.
///
/// Immutable by convention after parse; the server never mutates an
/// inbound message, it builds a fresh outbound one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transport framing this message belongs to.
    pub transport: Transport,
    /// UDP message type; `None` on TCP.
    pub mtype: Option<MessageType>,
    /// UDP message-id for deduplication and ACK pairing; `None` on TCP.
    pub message_id: Option<u16>,
    /// Token correlating request and response (0..=8 bytes).
    pub token: Vec<u8>,
    /// Message code byte (class.detail).
    pub code: u8,
    /// Option set.
    pub options: Options,
    /// Payload bytes (empty means no payload marker on the wire).
    pub payload: Vec<u8>,
}

impl Message {
    /// New UDP message.
    pub fn udp(mtype: MessageType, code: u8, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            transport: Transport::Udp,
            mtype: Some(mtype),
            message_id: Some(message_id),
            token,
            code,
            options: Options::new(),
            payload: Vec::new(),
        }
    }

    /// New TCP message (no type, no message-id).
    pub fn tcp(code: u8, token: Vec<u8>) -> Self {
        Self {
            transport: Transport::Tcp,
            mtype: None,
            message_id: None,
            token,
            code,
            options: Options::new(),
            payload: Vec::new(),
        }
    }

    /// Path reconstructed from Uri-Path options, always with a leading
    /// slash ("/" when no Uri-Path option is present).
    pub fn path(&self) -> String {
        let segments = self.options.all(crate::protocol::constants::OPT_URI_PATH);
        if segments.is_empty() {
            return "/".to_string();
        }
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        path
    }

    /// Set Uri-Path options from a slash-separated path, skipping empty
    /// segments so `/a//b` and `/a/b` produce identical options.
    pub fn set_path(&mut self, path: &str) {
        self.options.remove(crate::protocol::constants::OPT_URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options
                .insert(crate::protocol::constants::OPT_URI_PATH, segment.as_bytes().to_vec());
        }
    }
}

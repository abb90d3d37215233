// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Outbound response construction.
//!
//! Pairing rules (RFC 7252 Sec.5.2): a confirmable request gets a
//! piggybacked ACK echoing message-id and token; a non-confirmable
//! request gets a NON with the same correlates. TCP responses carry only
//! the token.

use super::{Message, MessageType, Request, Transport};
use crate::protocol::constants as c;

/// An outbound CoAP response under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    message: Message,
}

impl Response {
    /// Start a response paired to `request` with the given code.
    pub fn for_request(request: &Request, code: u8) -> Self {
        let inbound = request.message();
        let message = match inbound.transport {
            Transport::Udp => {
                let mtype = match inbound.mtype {
                    Some(MessageType::Con) => MessageType::Ack,
                    _ => MessageType::Non,
                };
                Message::udp(
                    mtype,
                    code,
                    inbound.message_id.unwrap_or(0),
                    inbound.token.clone(),
                )
            }
            Transport::Tcp => Message::tcp(code, inbound.token.clone()),
        };
        Self { message }
    }

    /// A standalone reset for a rejected UDP message.
    pub fn reset(message_id: u16) -> Self {
        Self {
            message: Message::udp(MessageType::Rst, 0, message_id, Vec::new()),
        }
    }

    /// Response code.
    pub fn code(&self) -> u8 {
        self.message.code
    }

    /// Replace the response code.
    pub fn set_code(&mut self, code: u8) {
        self.message.code = code;
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Replace the payload bytes.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.message.payload = payload;
    }

    /// Content-Format option, when set.
    pub fn content_format(&self) -> Option<u16> {
        self.message
            .options
            .uint(c::OPT_CONTENT_FORMAT)
            .map(|v| v as u16)
    }

    /// Set the Content-Format option (replacing an existing one).
    pub fn set_content_format(&mut self, format: u16) {
        self.message
            .options
            .set_uint(c::OPT_CONTENT_FORMAT, u32::from(format));
    }

    /// Set the Observe option (24-bit sequence).
    pub fn set_observe(&mut self, sequence: u32) {
        self.message.options.set_uint(
            c::OPT_OBSERVE,
            sequence % crate::config::OBSERVE_SEQUENCE_MODULUS,
        );
    }

    /// Add an arbitrary option value.
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        self.message.options.insert(number, value);
    }

    /// The finished message.
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Borrow the message being built.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

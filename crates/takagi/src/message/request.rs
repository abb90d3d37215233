// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Parsed inbound request view.
//!
//! Wraps a decoded [`Message`] with the peer address and the helper
//! surface handlers use: method predicates, content negotiation inputs,
//! query parameters, and URI reconstruction from options.

use super::{Message, Transport};
use crate::protocol::constants as c;
use crate::ser::{SerError, SerRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;

/// An inbound CoAP request.
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
    peer: SocketAddr,
}

impl Request {
    /// Wrap a decoded message received from `peer`.
    pub fn new(message: Message, peer: SocketAddr) -> Self {
        Self { message, peer }
    }

    /// The underlying message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Remote address the request arrived from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Request code byte.
    pub fn code(&self) -> u8 {
        self.message.code
    }

    /// Request token.
    pub fn token(&self) -> &[u8] {
        &self.message.token
    }

    /// Transport the request arrived on.
    pub fn transport(&self) -> Transport {
        self.message.transport
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Path reconstructed from Uri-Path options.
    pub fn path(&self) -> String {
        self.message.path()
    }

    // ------------------------------------------------------------------
    // Method predicates
    // ------------------------------------------------------------------

    /// True for GET requests.
    pub fn is_get(&self) -> bool {
        self.message.code == c::METHOD_GET
    }

    /// True for POST requests.
    pub fn is_post(&self) -> bool {
        self.message.code == c::METHOD_POST
    }

    /// True for PUT requests.
    pub fn is_put(&self) -> bool {
        self.message.code == c::METHOD_PUT
    }

    /// True for DELETE requests.
    pub fn is_delete(&self) -> bool {
        self.message.code == c::METHOD_DELETE
    }

    /// True for a GET carrying any Observe option.
    pub fn is_observe(&self) -> bool {
        self.is_get() && self.message.options.contains(c::OPT_OBSERVE)
    }

    /// Observe option value, when present (0 register, 1 deregister).
    pub fn observe(&self) -> Option<u32> {
        self.message.options.uint(c::OPT_OBSERVE)
    }

    /// True for a GET with Observe=0 (subscription registration).
    pub fn is_observe_register(&self) -> bool {
        self.is_get() && self.observe() == Some(0)
    }

    /// True for a GET with Observe=1 (subscription cancellation).
    pub fn is_observe_deregister(&self) -> bool {
        self.is_get() && self.observe() == Some(1)
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// First value of option `number`.
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.message.options.first(number)
    }

    /// True when option `number` is present.
    pub fn has_option(&self, number: u16) -> bool {
        self.message.options.contains(number)
    }

    /// Accept option value, when present.
    pub fn accept(&self) -> Option<u16> {
        self.message.options.uint(c::OPT_ACCEPT).map(|v| v as u16)
    }

    /// True when the peer accepts `format`: either it asked for it, or it
    /// sent no Accept option at all.
    pub fn accepts(&self, format: u16) -> bool {
        match self.accept() {
            Some(requested) => requested == format,
            None => true,
        }
    }

    /// Content-Format option of the request body, when present.
    pub fn content_format(&self) -> Option<u16> {
        self.message
            .options
            .uint(c::OPT_CONTENT_FORMAT)
            .map(|v| v as u16)
    }

    /// Query parameters from repeated Uri-Query options. A value-less key
    /// maps to the empty string; later repeats of a key win.
    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for raw in self.message.options.all(c::OPT_URI_QUERY) {
            let text = String::from_utf8_lossy(raw);
            match text.split_once('=') {
                Some((key, value)) => params.insert(key.to_string(), value.to_string()),
                None => params.insert(text.to_string(), String::new()),
            };
        }
        params
    }

    /// Decode the payload through the serialization registry, keyed by the
    /// request Content-Format (JSON when absent).
    pub fn payload_value(&self, registry: &SerRegistry) -> Result<Value, SerError> {
        let format = self.content_format().unwrap_or(c::FORMAT_JSON);
        registry.decode(format, &self.message.payload)
    }

    /// Reconstruct the request URI from Uri-Host/Uri-Port/Uri-Path/Uri-Query
    /// options, falling back to the peer address for the authority.
    pub fn uri(&self) -> String {
        let host = self
            .option(c::OPT_URI_HOST)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_else(|| self.peer.ip().to_string());
        let port = self
            .message
            .options
            .uint(c::OPT_URI_PORT)
            .map(|v| v as u16)
            .unwrap_or(crate::config::COAP_DEFAULT_PORT);

        let mut uri = format!("coap://{}:{}{}", host, port, self.path());
        let queries = self.message.options.all(c::OPT_URI_QUERY);
        if !queries.is_empty() {
            let joined: Vec<String> = queries
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect();
            uri.push('?');
            uri.push_str(&joined.join("&"));
        }
        uri
    }
}

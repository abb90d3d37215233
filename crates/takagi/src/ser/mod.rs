// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Payload serialization registry
//!
//! Maps content-format codes to payload codecs. Handlers produce
//! [`serde_json::Value`] payloads; the negotiated content format picks the
//! codec that turns them into wire bytes (and back for request bodies).
//!
//! Baseline registrations: text/plain (0), application/link-format (40),
//! application/json (50), application/cbor (60). Hosts and plugins register
//! additional formats at runtime; lookups honor them immediately.

mod cbor;
mod json;

pub use cbor::CborCodec;
pub use json::JsonCodec;

use crate::protocol::constants::{
    FORMAT_CBOR, FORMAT_JSON, FORMAT_LINK_FORMAT, FORMAT_TEXT_PLAIN,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Serialization failure.
#[derive(Debug)]
pub enum SerError {
    /// No codec registered for the content-format code.
    UnknownFormat(u16),
    /// The codec rejected the value.
    Encode(String),
    /// The codec rejected the bytes.
    Decode(String),
}

impl fmt::Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerError::UnknownFormat(code) => write!(f, "unknown content-format {}", code),
            SerError::Encode(msg) => write!(f, "payload encode failed: {}", msg),
            SerError::Decode(msg) => write!(f, "payload decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SerError {}

/// A payload codec for one content format.
pub trait PayloadCodec: Send + Sync {
    /// Encode a structured value to wire bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerError>;
    /// Decode wire bytes to a structured value.
    fn decode(&self, bytes: &[u8]) -> Result<Value, SerError>;
    /// MIME name for diagnostics.
    fn mime(&self) -> &'static str;
}

/// text/plain and application/link-format: strings pass through, other
/// values render as their JSON text.
struct TextCodec {
    mime: &'static str,
}

impl PayloadCodec for TextCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerError> {
        match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Ok(other.to_string().into_bytes()),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerError::Decode(format!("invalid utf-8: {}", e)))?;
        Ok(Value::String(text.to_string()))
    }

    fn mime(&self) -> &'static str {
        self.mime
    }
}

/// Thread-safe content-format -> codec table.
pub struct SerRegistry {
    codecs: Mutex<HashMap<u16, Arc<dyn PayloadCodec>>>,
}

impl SerRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            codecs: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the baseline codecs installed.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(FORMAT_TEXT_PLAIN, Arc::new(TextCodec { mime: "text/plain" }));
        registry.register(
            FORMAT_LINK_FORMAT,
            Arc::new(TextCodec {
                mime: "application/link-format",
            }),
        );
        registry.register(FORMAT_JSON, Arc::new(JsonCodec));
        registry.register(FORMAT_CBOR, Arc::new(CborCodec));
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, Arc<dyn PayloadCodec>>> {
        match self.codecs.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Ser] codec table lock poisoned, recovering");
                e.into_inner()
            }
        }
    }

    /// Install or replace the codec for a content-format code.
    pub fn register(&self, code: u16, codec: Arc<dyn PayloadCodec>) {
        log::trace!("[Ser] registered content-format {} ({})", code, codec.mime());
        self.lock().insert(code, codec);
    }

    /// True when a codec is registered for the code.
    pub fn supports(&self, code: u16) -> bool {
        self.lock().contains_key(&code)
    }

    fn codec_for(&self, code: u16) -> Result<Arc<dyn PayloadCodec>, SerError> {
        self.lock()
            .get(&code)
            .cloned()
            .ok_or(SerError::UnknownFormat(code))
    }

    /// Encode a value with the codec for `code`.
    pub fn encode(&self, code: u16, value: &Value) -> Result<Vec<u8>, SerError> {
        self.codec_for(code)?.encode(value)
    }

    /// Decode bytes with the codec for `code`.
    pub fn decode(&self, code: u16, bytes: &[u8]) -> Result<Value, SerError> {
        self.codec_for(code)?.decode(bytes)
    }

    /// MIME name for a registered code.
    pub fn mime_for(&self, code: u16) -> Option<&'static str> {
        self.lock().get(&code).map(|codec| codec.mime())
    }
}

impl fmt::Debug for SerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<u16> = self.lock().keys().copied().collect();
        f.debug_struct("SerRegistry").field("codes", &codes).finish()
    }
}

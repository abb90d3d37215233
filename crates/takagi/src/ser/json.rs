// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! application/json payload codec (content-format 50).

use super::{PayloadCodec, SerError};
use serde_json::Value;

/// JSON codec backed by serde_json.
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerError> {
        serde_json::to_vec(value).map_err(|e| SerError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerError> {
        serde_json::from_slice(bytes).map_err(|e| SerError::Decode(e.to_string()))
    }

    fn mime(&self) -> &'static str {
        "application/json"
    }
}

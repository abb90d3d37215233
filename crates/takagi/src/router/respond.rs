// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Response construction and content-format negotiation.
//!
//! Negotiation order (first match wins):
//! 1. A route-forced format must be registered in the serialization
//!    registry, else `4.15 Unsupported Content-Format`.
//! 2. A request `Accept` option must be both registered and in the
//!    route's allowed list, else `4.06 Not Acceptable`.
//! 3. Otherwise the first allowed format with a registered codec, falling
//!    back to JSON.
//!
//! Handlers short-circuit with [`Halt`]: helpers return
//! `Result<_, Halt>` so `?` aborts the rest of the handler and surfaces
//! the carried response.

use crate::message::{Request, Response};
use crate::protocol::constants as c;
use crate::ser::SerRegistry;
use serde_json::{json, Value};

/// Aborts handler execution, surfacing the carried response.
#[derive(Debug)]
pub struct Halt(pub Response);

/// What handlers return: a response, or an early exit via [`Halt`].
pub type HandlerResult = Result<Response, Halt>;

/// Payload forms accepted by the response builder.
#[derive(Debug, Clone)]
pub enum Body {
    /// Structured value, encoded by the negotiated codec.
    Value(Value),
    /// Pre-encoded bytes, emitted as-is.
    Bytes(Vec<u8>),
    /// No payload.
    Empty,
}

/// Per-request response builder bound to the serialization registry.
pub struct Responder<'a> {
    request: &'a Request,
    ser: &'a SerRegistry,
}

impl<'a> Responder<'a> {
    /// Builder for one request.
    pub fn new(request: &'a Request, ser: &'a SerRegistry) -> Self {
        Self { request, ser }
    }

    /// The request being answered.
    pub fn request(&self) -> &Request {
        self.request
    }

    /// The serialization registry in use.
    pub fn registry(&self) -> &SerRegistry {
        self.ser
    }

    /// Pick the response content format, or produce the negotiation error
    /// response.
    pub fn negotiate(&self, allowed: &[u16], force: Option<u16>) -> Result<u16, Response> {
        if let Some(forced) = force {
            if !self.ser.supports(forced) {
                return Err(self.error_response(
                    c::CODE_UNSUPPORTED_CONTENT_FORMAT,
                    "Unsupported Content-Format",
                ));
            }
            return Ok(forced);
        }

        if let Some(accept) = self.request.accept() {
            if self.ser.supports(accept) && allowed.contains(&accept) {
                return Ok(accept);
            }
            return Err(self.error_response(c::CODE_NOT_ACCEPTABLE, "Not Acceptable"));
        }

        Ok(allowed
            .iter()
            .copied()
            .find(|format| self.ser.supports(*format))
            .unwrap_or(c::FORMAT_JSON))
    }

    /// Build a response with full negotiation.
    pub fn respond(&self, code: u8, body: Body, allowed: &[u16], force: Option<u16>) -> Response {
        let format = match self.negotiate(allowed, force) {
            Ok(format) => format,
            Err(error_response) => return error_response,
        };

        let mut response = Response::for_request(self.request, code);
        match body {
            Body::Empty => {}
            Body::Bytes(bytes) => {
                if response.content_format().is_none() {
                    response.set_content_format(format);
                }
                response.set_payload(bytes);
            }
            Body::Value(value) => {
                if response.content_format().is_none() {
                    response.set_content_format(format);
                }
                match self.ser.encode(format, &value) {
                    Ok(bytes) => response.set_payload(bytes),
                    Err(e) => {
                        log::error!("[Respond] payload encode failed: {}", e);
                        return self.internal_server_error();
                    }
                }
            }
        }
        response
    }

    // ------------------------------------------------------------------
    // Success helpers
    // ------------------------------------------------------------------

    /// `2.05 Content` with a JSON body.
    pub fn json(&self, value: Value) -> Response {
        self.respond(
            c::CODE_CONTENT,
            Body::Value(value),
            &[c::FORMAT_JSON],
            Some(c::FORMAT_JSON),
        )
    }

    /// `2.05 Content` with negotiated encoding.
    pub fn content(&self, value: Value, allowed: &[u16]) -> Response {
        self.respond(c::CODE_CONTENT, Body::Value(value), allowed, None)
    }

    /// `2.01 Created`.
    pub fn created(&self, value: Value) -> Response {
        self.success(c::CODE_CREATED, value)
    }

    /// `2.04 Changed`.
    pub fn changed(&self, value: Value) -> Response {
        self.success(c::CODE_CHANGED, value)
    }

    /// `2.02 Deleted`.
    pub fn deleted(&self, value: Value) -> Response {
        self.success(c::CODE_DELETED, value)
    }

    /// `2.03 Valid`.
    pub fn valid(&self, value: Value) -> Response {
        self.success(c::CODE_VALID, value)
    }

    fn success(&self, code: u8, value: Value) -> Response {
        self.respond(code, Body::Value(value), &[c::FORMAT_JSON], Some(c::FORMAT_JSON))
    }

    // ------------------------------------------------------------------
    // Error helpers
    // ------------------------------------------------------------------

    /// `4.00 Bad Request`.
    pub fn bad_request(&self, message: &str) -> Response {
        self.error_response(c::CODE_BAD_REQUEST, message)
    }

    /// `4.01 Unauthorized`.
    pub fn unauthorized(&self, message: &str) -> Response {
        self.error_response(c::CODE_UNAUTHORIZED, message)
    }

    /// `4.03 Forbidden`.
    pub fn forbidden(&self, message: &str) -> Response {
        self.error_response(c::CODE_FORBIDDEN, message)
    }

    /// `4.04 Not Found`.
    pub fn not_found(&self) -> Response {
        self.error_response(c::CODE_NOT_FOUND, "Not Found")
    }

    /// `4.05 Method Not Allowed`.
    pub fn method_not_allowed(&self) -> Response {
        self.error_response(c::CODE_METHOD_NOT_ALLOWED, "Method Not Allowed")
    }

    /// `5.00 Internal Server Error`.
    pub fn internal_server_error(&self) -> Response {
        self.error_response(c::CODE_INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// An error response with `{ "error": message }` as JSON body.
    pub fn error_response(&self, code: u8, message: &str) -> Response {
        let mut response = Response::for_request(self.request, code);
        response.set_content_format(c::FORMAT_JSON);
        match self.ser.encode(c::FORMAT_JSON, &json!({ "error": message })) {
            Ok(bytes) => response.set_payload(bytes),
            Err(e) => log::error!("[Respond] error body encode failed: {}", e),
        }
        response
    }

    /// Abort the handler with the given response.
    pub fn halt(&self, response: Response) -> Halt {
        Halt(response)
    }
}

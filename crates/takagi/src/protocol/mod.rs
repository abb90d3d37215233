// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! CoAP protocol layer: numeric constants and runtime registries.
//!
//! [`constants`] holds the RFC-assigned numbers; [`ProtocolRegistries`]
//! bundles the five live registries (methods, response codes, options,
//! content formats, signaling codes) that the codec, negotiation, and
//! discovery layers consult. Plugins extend the tables at runtime through
//! the same `register` contract used for seeding.

pub mod constants;
pub mod registry;

pub use registry::{Registry, RegistryEntry, RegistryError};

use crate::bus::hooks::EventSink;
use constants as c;
use std::sync::Arc;

// Seed tables: (value, name, symbol, rfc). Values are the wire-level
// numbers; u8 code-class constants widen into the u16 registry space.
const METHOD_SEED: &[(u8, &str, &str, &str)] = &[
    (c::METHOD_GET, "GET", "get", "RFC 7252"),
    (c::METHOD_POST, "POST", "post", "RFC 7252"),
    (c::METHOD_PUT, "PUT", "put", "RFC 7252"),
    (c::METHOD_DELETE, "DELETE", "delete", "RFC 7252"),
];

const RESPONSE_SEED: &[(u8, &str, &str, &str)] = &[
    (c::CODE_CREATED, "2.01 Created", "created", "RFC 7252"),
    (c::CODE_DELETED, "2.02 Deleted", "deleted", "RFC 7252"),
    (c::CODE_VALID, "2.03 Valid", "valid", "RFC 7252"),
    (c::CODE_CHANGED, "2.04 Changed", "changed", "RFC 7252"),
    (c::CODE_CONTENT, "2.05 Content", "content", "RFC 7252"),
    (c::CODE_BAD_REQUEST, "4.00 Bad Request", "bad_request", "RFC 7252"),
    (c::CODE_UNAUTHORIZED, "4.01 Unauthorized", "unauthorized", "RFC 7252"),
    (c::CODE_BAD_OPTION, "4.02 Bad Option", "bad_option", "RFC 7252"),
    (c::CODE_FORBIDDEN, "4.03 Forbidden", "forbidden", "RFC 7252"),
    (c::CODE_NOT_FOUND, "4.04 Not Found", "not_found", "RFC 7252"),
    (
        c::CODE_METHOD_NOT_ALLOWED,
        "4.05 Method Not Allowed",
        "method_not_allowed",
        "RFC 7252",
    ),
    (c::CODE_NOT_ACCEPTABLE, "4.06 Not Acceptable", "not_acceptable", "RFC 7252"),
    (
        c::CODE_PRECONDITION_FAILED,
        "4.12 Precondition Failed",
        "precondition_failed",
        "RFC 7252",
    ),
    (
        c::CODE_ENTITY_TOO_LARGE,
        "4.13 Request Entity Too Large",
        "entity_too_large",
        "RFC 7252",
    ),
    (
        c::CODE_UNSUPPORTED_CONTENT_FORMAT,
        "4.15 Unsupported Content-Format",
        "unsupported_content_format",
        "RFC 7252",
    ),
    (
        c::CODE_INTERNAL_SERVER_ERROR,
        "5.00 Internal Server Error",
        "internal_server_error",
        "RFC 7252",
    ),
    (c::CODE_NOT_IMPLEMENTED, "5.01 Not Implemented", "not_implemented", "RFC 7252"),
    (c::CODE_BAD_GATEWAY, "5.02 Bad Gateway", "bad_gateway", "RFC 7252"),
    (
        c::CODE_SERVICE_UNAVAILABLE,
        "5.03 Service Unavailable",
        "service_unavailable",
        "RFC 7252",
    ),
    (c::CODE_GATEWAY_TIMEOUT, "5.04 Gateway Timeout", "gateway_timeout", "RFC 7252"),
    (
        c::CODE_PROXYING_NOT_SUPPORTED,
        "5.05 Proxying Not Supported",
        "proxying_not_supported",
        "RFC 7252",
    ),
];

const OPTION_SEED: &[(u16, &str, &str, &str)] = &[
    (c::OPT_IF_MATCH, "If-Match", "if_match", "RFC 7252"),
    (c::OPT_URI_HOST, "Uri-Host", "uri_host", "RFC 7252"),
    (c::OPT_ETAG, "ETag", "etag", "RFC 7252"),
    (c::OPT_IF_NONE_MATCH, "If-None-Match", "if_none_match", "RFC 7252"),
    (c::OPT_OBSERVE, "Observe", "observe", "RFC 7641"),
    (c::OPT_URI_PORT, "Uri-Port", "uri_port", "RFC 7252"),
    (c::OPT_LOCATION_PATH, "Location-Path", "location_path", "RFC 7252"),
    (c::OPT_URI_PATH, "Uri-Path", "uri_path", "RFC 7252"),
    (c::OPT_CONTENT_FORMAT, "Content-Format", "content_format", "RFC 7252"),
    (c::OPT_MAX_AGE, "Max-Age", "max_age", "RFC 7252"),
    (c::OPT_URI_QUERY, "Uri-Query", "uri_query", "RFC 7252"),
    (c::OPT_ACCEPT, "Accept", "accept", "RFC 7252"),
    (c::OPT_LOCATION_QUERY, "Location-Query", "location_query", "RFC 7252"),
    (c::OPT_PROXY_URI, "Proxy-Uri", "proxy_uri", "RFC 7252"),
    (c::OPT_PROXY_SCHEME, "Proxy-Scheme", "proxy_scheme", "RFC 7252"),
    (c::OPT_SIZE1, "Size1", "size1", "RFC 7252"),
];

const FORMAT_SEED: &[(u16, &str, &str, &str)] = &[
    (c::FORMAT_TEXT_PLAIN, "text/plain", "text", "RFC 7252"),
    (c::FORMAT_LINK_FORMAT, "application/link-format", "link_format", "RFC 6690"),
    (c::FORMAT_XML, "application/xml", "xml", "RFC 7252"),
    (c::FORMAT_OCTET_STREAM, "application/octet-stream", "octet_stream", "RFC 7252"),
    (c::FORMAT_JSON, "application/json", "json", "RFC 7252"),
    (c::FORMAT_CBOR, "application/cbor", "cbor", "RFC 8949"),
];

const SIGNAL_SEED: &[(u8, &str, &str, &str)] = &[
    (c::SIGNAL_CSM, "7.01 CSM", "csm", "RFC 8323"),
    (c::SIGNAL_PING, "7.02 Ping", "ping", "RFC 8323"),
    (c::SIGNAL_PONG, "7.03 Pong", "pong", "RFC 8323"),
    (c::SIGNAL_RELEASE, "7.04 Release", "release", "RFC 8323"),
    (c::SIGNAL_ABORT, "7.05 Abort", "abort", "RFC 8323"),
];

/// The five protocol-constant registries used across the framework.
#[derive(Debug)]
pub struct ProtocolRegistries {
    /// Request method codes (class 0).
    pub methods: Registry,
    /// Response codes (classes 2, 4, 5).
    pub responses: Registry,
    /// Option numbers.
    pub options: Registry,
    /// Content-format identifiers.
    pub content_formats: Registry,
    /// TCP signaling codes (class 7).
    pub signaling: Registry,
}

impl ProtocolRegistries {
    /// Create empty registries (tests build on this to start from scratch).
    pub fn empty() -> Self {
        Self {
            methods: Registry::new("method"),
            responses: Registry::new("response"),
            options: Registry::new("option"),
            content_formats: Registry::new("content_format"),
            signaling: Registry::new("signaling"),
        }
    }

    /// Create registries seeded with the RFC 7252 / 7641 / 8323 baseline.
    pub fn with_defaults() -> Self {
        let registries = Self::empty();
        registries.seed_defaults();
        registries
    }

    /// Attach the hook sink to all five registries.
    pub fn attach_sink(&self, sink: &Arc<dyn EventSink>) {
        self.methods.attach_sink(Arc::clone(sink));
        self.responses.attach_sink(Arc::clone(sink));
        self.options.attach_sink(Arc::clone(sink));
        self.content_formats.attach_sink(Arc::clone(sink));
        self.signaling.attach_sink(Arc::clone(sink));
    }

    /// Method name for a request code ("GET", "POST", ...).
    pub fn method_name(&self, code: u8) -> Option<String> {
        self.methods.name_for(u16::from(code))
    }

    /// Response name for a code ("2.05 Content", ...).
    pub fn response_name(&self, code: u8) -> Option<String> {
        self.responses.name_for(u16::from(code))
    }

    // Seeding conflicts cannot happen on empty tables; swallow the Results
    // to keep the loops flat.
    fn seed_defaults(&self) {
        for &(value, name, symbol, rfc) in METHOD_SEED {
            let _ = self
                .methods
                .register(u16::from(value), name, Some(symbol), Some(rfc));
        }
        for &(value, name, symbol, rfc) in RESPONSE_SEED {
            let _ = self
                .responses
                .register(u16::from(value), name, Some(symbol), Some(rfc));
        }
        for &(value, name, symbol, rfc) in OPTION_SEED {
            let _ = self.options.register(value, name, Some(symbol), Some(rfc));
        }
        for &(value, name, symbol, rfc) in FORMAT_SEED {
            let _ = self
                .content_formats
                .register(value, name, Some(symbol), Some(rfc));
        }
        for &(value, name, symbol, rfc) in SIGNAL_SEED {
            let _ = self
                .signaling
                .register(u16::from(value), name, Some(symbol), Some(rfc));
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! # Takagi - CoAP server framework
//!
//! A pure Rust CoAP (RFC 7252) server framework with HTTP-like routing,
//! server-push subscriptions (Observe, RFC 7641), CoAP-over-TCP framing
//! with signaling (RFC 8323), `/.well-known/core` discovery (RFC 6690),
//! and an embedded address-keyed event bus that backs both the plugin
//! hook system and the Observe fan-out.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use takagi::{App, Result};
//! use serde_json::json;
//!
//! fn main() -> Result<()> {
//!     let app = App::builder("thermostat").port(5683).build();
//!
//!     app.router().route("GET", "/sensors/:id", |_req, ctx| {
//!         let id = ctx.param("id").unwrap_or("?").to_string();
//!         Ok(ctx.reply().json(json!({ "sensor": id, "value": 21.5 })))
//!     })?;
//!
//!     app.observable("/sensors/temp")?;
//!     app.notify("/sensors/temp", json!({ "value": 21.5 }));
//!
//!     app.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Application Layer                            |
//! |        App -> Router / Middleware -> Handlers -> Responder          |
//! +---------------------------------------------------------------------+
//! |                          Fabric Layer                               |
//! |     Event Bus (pub/sub, wildcards, request-reply) | Hooks           |
//! |     Observe Registry (subscriptions, fan-out, sweeps)               |
//! +---------------------------------------------------------------------+
//! |                         Protocol Layer                              |
//! |   Constant Registries | Wire Codec (UDP + TCP) | Payload Codecs     |
//! +---------------------------------------------------------------------+
//! |                        Transport Layer                              |
//! |   UDP worker pool (multi-process + threads) | TCP thread-per-conn   |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`App`] | Entry point: owns every subsystem, explicit start/stop |
//! | [`Router`](router::Router) | (method, path) route table with `:param` patterns |
//! | [`EventBus`](bus::EventBus) | Address-keyed pub/sub with round-robin sends and request-reply |
//! | [`ObserveRegistry`](observe::ObserveRegistry) | RFC 7641 subscriptions and notification fan-out |
//! | [`ProtocolRegistries`](protocol::ProtocolRegistries) | Live tables of methods, codes, options, formats |
//!
//! ## Modules Overview
//!
//! - [`app`] - Application facade and lifecycle (start here)
//! - [`router`] - Routing, middleware, negotiation, discovery
//! - [`bus`] - Event bus and lifecycle hooks
//! - [`observe`] - Observe subscriptions and fan-out
//! - [`codec`] - RFC 7252 / RFC 8323 wire codecs
//! - [`protocol`] - Protocol constants and runtime registries
//! - [`plugin`] - Plugin registration and lifecycle
//! - [`transport`] - UDP and TCP servers
//!
//! ## See Also
//!
//! - [RFC 7252 - CoAP](https://www.rfc-editor.org/rfc/rfc7252)
//! - [RFC 7641 - Observing Resources in CoAP](https://www.rfc-editor.org/rfc/rfc7641)
//! - [RFC 8323 - CoAP over TCP](https://www.rfc-editor.org/rfc/rfc8323)
//! - [RFC 6690 - CoRE Link Format](https://www.rfc-editor.org/rfc/rfc6690)

/// Application facade and lifecycle.
pub mod app;
/// Event bus: pub/sub, point-to-point, request-reply, hooks.
pub mod bus;
/// CoAP wire codecs for UDP and TCP framings.
pub mod codec;
/// Global configuration (protocol constants, runtime settings).
pub mod config;
/// Message model: parsed messages, requests, responses.
pub mod message;
/// Observe subscriptions and notification fan-out (RFC 7641).
pub mod observe;
/// Plugin registration, dependency resolution, lifecycle.
pub mod plugin;
/// Protocol constants and runtime registries.
pub mod protocol;
/// Routing, middleware chain, response building, discovery.
pub mod router;
/// Payload serialization registry (content-format codecs).
pub mod ser;
/// UDP and TCP transport servers.
pub mod transport;

pub use app::{App, AppBuilder, Error, Result};
pub use bus::{BusMessage, EventBus, Scope};
pub use message::{Message, MessageType, Request, Response, Transport};
pub use observe::{ObserveRegistry, Subscription};
pub use plugin::{ConfigSchema, FieldSpec, FieldType, Plugin, PluginManager};
pub use protocol::ProtocolRegistries;
pub use router::{Capabilities, Chain, Context, HandlerResult, Middleware, Router};
pub use ser::SerRegistry;

/// Framework version string (plugins state minimum versions against it).
pub const VERSION: &str = "0.3.0";

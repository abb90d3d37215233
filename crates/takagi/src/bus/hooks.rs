// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Lifecycle hooks.
//!
//! Named framework events (`server_starting`, `router_route_added`,
//! `plugin_enabled`, `observe_subscribed`, ...) are published on the bus
//! under `hooks.<event>` with `Local` scope. Subscribers receive the
//! payload map verbatim; subscriber errors are contained by the bus
//! executor and never reach the emitter.
//!
//! [`EventSink`] is the narrow publisher interface the registries, the
//! router, the observe registry, and the plugin manager depend on, so
//! none of them references a concrete bus type.

use super::{EventBus, Scope};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Narrow emitter interface for lifecycle events.
pub trait EventSink: Send + Sync {
    /// Emit a named event with a payload map.
    fn emit(&self, event: &str, payload: Value);
}

/// Bus-backed hook emitter.
pub struct Hooks {
    bus: Arc<EventBus>,
}

impl Hooks {
    /// Hooks publishing on the given bus.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Address for a hook event name.
    pub fn address(event: &str) -> String {
        format!("hooks.{}", event)
    }
}

impl EventSink for Hooks {
    fn emit(&self, event: &str, payload: Value) {
        log::trace!("[Hooks] {} {}", event, payload);
        self.bus
            .publish_scoped(&Self::address(event), payload, HashMap::new(), Scope::Local);
    }
}

/// Sink that discards events; placeholder until a bus is wired in.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

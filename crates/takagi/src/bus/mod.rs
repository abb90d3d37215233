// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Event bus: address-keyed publish/subscribe with wildcard routing,
//! point-to-point round-robin, request-reply futures, and optional
//! bounded buffering.
//!
//! Delivery model: publishers enqueue onto a sharded executor keyed by
//! handler id, so each handler observes messages in publish order while
//! distinct handlers run in parallel. Handler errors are caught by the
//! executor and never reach the publisher.
//!
//! Scopes: `Local` stays in-process (default), `Cluster` is reserved,
//! `Global` additionally updates the latest-state cache and forwards to
//! the CoAP observe bridge when one is attached. Unknown scope names
//! normalize to `Local`.

pub mod address;
pub mod buffer;
pub mod executor;
pub mod hooks;
pub mod reply;

pub use hooks::{EventSink, Hooks};
pub use reply::Reply;

use crate::config::{
    BUS_BUFFER_CAPACITY, BUS_BUFFER_TTL, BUS_EXECUTOR_THREADS, BUS_MAINTENANCE_INTERVAL,
    BUS_REPLY_TTL,
};
use buffer::MessageBuffer;
use executor::Executor;
use reply::ReplySlot;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Distribution scope of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// This instance only (default).
    Local,
    /// Reserved for clustered deployments.
    Cluster,
    /// Local delivery plus the external CoAP observer bridge.
    Global,
}

impl Scope {
    /// Parse a scope name; unknown names normalize to `Local`.
    pub fn normalize(name: &str) -> Scope {
        match name.to_ascii_uppercase().as_str() {
            "GLOBAL" => Scope::Global,
            "CLUSTER" => Scope::Cluster,
            _ => Scope::Local,
        }
    }
}

/// A message traveling over the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Dotted destination address.
    pub address: String,
    /// Structured body.
    pub body: Value,
    /// Free-form headers.
    pub headers: HashMap<String, String>,
    /// Reply address for request-reply exchanges.
    pub reply_to: Option<String>,
    /// Distribution scope.
    pub scope: Scope,
}

impl BusMessage {
    /// New message with empty headers and no reply address.
    pub fn new(address: &str, body: Value, scope: Scope) -> Self {
        Self {
            address: address.to_string(),
            body,
            headers: HashMap::new(),
            reply_to: None,
            scope,
        }
    }
}

/// Bus operation failure.
#[derive(Debug, PartialEq, Eq)]
pub enum BusError {
    /// Request-reply deadline elapsed with no reply.
    Timeout,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "request-reply timed out"),
        }
    }
}

impl std::error::Error for BusError {}

/// Handler callback type.
pub type BusHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Delivery counters (relaxed; consumers only need monotonic snapshots).
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    replies_expired: AtomicU64,
}

impl BusMetrics {
    /// Messages accepted by publish/send.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Handler invocations queued.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages with no matching handler (or rejected post-shutdown).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Temporary reply consumers reclaimed unused.
    pub fn replies_expired(&self) -> u64 {
        self.replies_expired.load(Ordering::Relaxed)
    }
}

struct HandlerEntry {
    id: u64,
    callback: BusHandler,
    /// Skip this handler for messages that arrive from outside the
    /// process. There is no remote ingress yet; the flag only gates
    /// future cluster delivery.
    #[allow(dead_code)]
    local_only: bool,
    /// Temporary reply consumers expire when unused past this instant.
    expires: Option<Instant>,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<String, Vec<HandlerEntry>>,
    ids: HashMap<u64, String>,
    cursors: HashMap<String, usize>,
    next_handler_id: u64,
    next_reply_id: u64,
    latest: HashMap<String, Value>,
}

/// The event bus.
pub struct EventBus {
    state: Mutex<BusState>,
    executor: Executor,
    buffer: Option<Mutex<MessageBuffer>>,
    bridge: Mutex<Option<BusHandler>>,
    metrics: BusMetrics,
    maintenance_running: Arc<AtomicBool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Bus without message buffering.
    pub fn new() -> Self {
        Self::build(None, BUS_EXECUTOR_THREADS)
    }

    /// Bus with per-address buffering using the default bounds.
    pub fn with_buffering() -> Self {
        Self::with_buffer(BUS_BUFFER_CAPACITY, BUS_BUFFER_TTL)
    }

    /// Bus with per-address buffering using explicit bounds.
    pub fn with_buffer(capacity: usize, ttl: Duration) -> Self {
        Self::build(Some(MessageBuffer::new(capacity, ttl)), BUS_EXECUTOR_THREADS)
    }

    fn build(buffer: Option<MessageBuffer>, threads: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            executor: Executor::new(threads),
            buffer: buffer.map(Mutex::new),
            bridge: Mutex::new(None),
            metrics: BusMetrics::default(),
            maintenance_running: Arc::new(AtomicBool::new(false)),
            maintenance: Mutex::new(None),
        }
    }

    /// Delivery counters.
    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Bus] state lock poisoned, recovering");
                e.into_inner()
            }
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a handler for `address` (exact or wildcard pattern).
    /// Returns the handler id used for unregistration.
    pub fn consumer<F>(&self, address: &str, callback: F) -> u64
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(address, Arc::new(callback), false, None)
    }

    /// Register a handler that must never receive remotely-originated
    /// messages.
    pub fn local_consumer<F>(&self, address: &str, callback: F) -> u64
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(address, Arc::new(callback), true, None)
    }

    fn register(
        &self,
        address: &str,
        callback: BusHandler,
        local_only: bool,
        expires: Option<Instant>,
    ) -> u64 {
        let mut state = self.lock_state();
        let id = state.next_handler_id;
        state.next_handler_id += 1;
        state.ids.insert(id, address.to_string());
        state
            .handlers
            .entry(address.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                callback,
                local_only,
                expires,
            });
        log::trace!("[Bus] consumer {} registered on {}", id, address);
        id
    }

    /// Remove a handler by id. Unknown ids are ignored.
    pub fn unregister(&self, id: u64) {
        let mut state = self.lock_state();
        if let Some(address) = remove_handler(&mut state, id) {
            log::trace!("[Bus] consumer {} unregistered from {}", id, address);
        }
    }

    /// Attach the CoAP observer bridge invoked for `Global` publishes.
    pub fn set_global_bridge<F>(&self, callback: F)
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let mut bridge = match self.bridge.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        *bridge = Some(Arc::new(callback));
    }

    // ------------------------------------------------------------------
    // Publish / subscribe
    // ------------------------------------------------------------------

    /// Publish to every handler whose address or pattern matches.
    pub fn publish(&self, address: &str, body: Value) {
        self.publish_message(BusMessage::new(address, body, Scope::Local));
    }

    /// Publish with explicit headers and scope.
    pub fn publish_scoped(
        &self,
        address: &str,
        body: Value,
        headers: HashMap<String, String>,
        scope: Scope,
    ) {
        let mut message = BusMessage::new(address, body, scope);
        message.headers = headers;
        self.publish_message(message);
    }

    /// Publish a fully built message.
    pub fn publish_message(&self, message: BusMessage) {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        // Buffer writes happen synchronously before local delivery so an
        // immediate replay sees the message.
        if let Some(buffer) = &self.buffer {
            let mut buffer = match buffer.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            buffer.store(&message, Instant::now());
        }

        if message.scope == Scope::Global {
            self.lock_state()
                .latest
                .insert(message.address.clone(), message.body.clone());
            let bridge = {
                let guard = match self.bridge.lock() {
                    Ok(guard) => guard,
                    Err(e) => e.into_inner(),
                };
                guard.clone()
            };
            if let Some(bridge) = bridge {
                let cloned = message.clone();
                let key = address_key(&message.address);
                self.executor.submit(key, Box::new(move || bridge(&cloned)));
            }
        }

        let targets = self.matching_handlers(&message.address);
        if targets.is_empty() {
            log::trace!("[Bus] no handler for {}", message.address);
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        for (id, callback) in targets {
            let cloned = message.clone();
            if self.executor.submit(id, Box::new(move || callback(&cloned))) {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot handlers matching `address`, removing one-shot reply
    /// consumers from the table as they are claimed.
    fn matching_handlers(&self, target: &str) -> Vec<(u64, BusHandler)> {
        let mut state = self.lock_state();
        let mut matched = Vec::new();
        let mut claimed = Vec::new();

        for (registered, entries) in &state.handlers {
            let hit = registered == target
                || (address::is_pattern(registered) && address::matches(registered, target));
            if !hit {
                continue;
            }
            for entry in entries {
                matched.push((entry.id, Arc::clone(&entry.callback)));
                if entry.expires.is_some() {
                    claimed.push(entry.id);
                }
            }
        }

        for id in claimed {
            remove_handler(&mut state, id);
        }
        matched
    }

    /// Latest body published with `Global` scope to an address.
    pub fn latest(&self, address: &str) -> Option<Value> {
        self.lock_state().latest.get(address).cloned()
    }

    // ------------------------------------------------------------------
    // Point-to-point and request-reply
    // ------------------------------------------------------------------

    /// Deliver to exactly one handler on the address, selected round-robin.
    pub fn send(&self, address: &str, body: Value) {
        self.send_inner(address, body, None);
    }

    /// Point-to-point send expecting a reply, resolved as a future.
    pub fn send_async(&self, address: &str, body: Value) -> Reply {
        let (slot, reply) = ReplySlot::new();
        let handler: BusHandler = Arc::new(move |message: &BusMessage| {
            slot.complete(message.clone());
        });
        self.send_inner(address, body, Some(handler));
        reply
    }

    /// Blocking request-reply with a deadline.
    pub fn send_sync(
        &self,
        address: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        self.send_async(address, body).wait(timeout)
    }

    /// Publish a reply to a message carrying a reply address.
    pub fn reply_to(&self, original: &BusMessage, body: Value) {
        if let Some(reply_address) = &original.reply_to {
            self.publish(reply_address, body);
        } else {
            log::debug!("[Bus] reply to {} dropped: no reply address", original.address);
        }
    }

    fn send_inner(&self, address: &str, body: Value, reply_handler: Option<BusHandler>) {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        let mut message = BusMessage::new(address, body, Scope::Local);

        let target = {
            let mut state = self.lock_state();

            if let Some(handler) = reply_handler {
                let reply_id = state.next_reply_id;
                state.next_reply_id += 1;
                let reply_address = format!("takagi.reply.{}", reply_id);
                message.reply_to = Some(reply_address.clone());
                let expires = Instant::now() + BUS_REPLY_TTL;
                let id = state.next_handler_id;
                state.next_handler_id += 1;
                state.ids.insert(id, reply_address.clone());
                state.handlers.entry(reply_address).or_default().push(HandlerEntry {
                    id,
                    callback: handler,
                    local_only: true,
                    expires: Some(expires),
                });
            }

            let len = state.handlers.get(address).map_or(0, Vec::len);
            if len == 0 {
                None
            } else {
                let cursor = state.cursors.entry(address.to_string()).or_insert(0);
                let index = *cursor % len;
                *cursor = (index + 1) % len;
                let entry = &state.handlers[address][index];
                Some((entry.id, Arc::clone(&entry.callback)))
            }
        };

        match target {
            Some((id, callback)) => {
                if self.executor.submit(id, Box::new(move || callback(&message))) {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                log::debug!("[Bus] send to {} dropped: no consumer", address);
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Replay and maintenance
    // ------------------------------------------------------------------

    /// Buffered messages for `address` since `since` (all when `None`).
    /// Empty when buffering is disabled.
    pub fn replay(&self, address: &str, since: Option<Instant>) -> Vec<BusMessage> {
        let Some(buffer) = &self.buffer else {
            return Vec::new();
        };
        let mut buffer = match buffer.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        buffer.replay(address, since, Instant::now())
    }

    /// One maintenance pass: buffer TTL eviction and reply-consumer GC.
    pub fn sweep(&self, now: Instant) {
        if let Some(buffer) = &self.buffer {
            let mut buffer = match buffer.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            let evicted = buffer.evict_expired(now);
            if evicted > 0 {
                log::debug!("[Bus] evicted {} expired buffered messages", evicted);
            }
        }

        let mut state = self.lock_state();
        let expired: Vec<u64> = state
            .handlers
            .values()
            .flatten()
            .filter(|entry| entry.expires.is_some_and(|at| at <= now))
            .map(|entry| entry.id)
            .collect();
        for id in expired {
            if let Some(address) = remove_handler(&mut state, id) {
                self.metrics.replies_expired.fetch_add(1, Ordering::Relaxed);
                log::debug!("[Bus] reply consumer on {} expired unused", address);
            }
        }
    }

    /// Start the background maintenance tick.
    pub fn start_maintenance(bus: &Arc<EventBus>) {
        if bus.maintenance_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<EventBus> = Arc::downgrade(bus);
        let running = Arc::clone(&bus.maintenance_running);
        let builder = thread::Builder::new().name("takagi-bus-maint".to_string());
        let handle = builder.spawn(move || {
            while running.load(Ordering::SeqCst) {
                // Sleep in short slices so shutdown stays prompt.
                let mut slept = Duration::ZERO;
                while slept < BUS_MAINTENANCE_INTERVAL && running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                    slept += Duration::from_millis(100);
                }
                let Some(bus) = weak.upgrade() else { break };
                bus.sweep(Instant::now());
            }
        });
        match handle {
            Ok(handle) => {
                let mut slot = match bus.maintenance.lock() {
                    Ok(guard) => guard,
                    Err(e) => e.into_inner(),
                };
                *slot = Some(handle);
            }
            Err(e) => {
                bus.maintenance_running.store(false, Ordering::SeqCst);
                log::error!("[Bus] failed to spawn maintenance thread: {}", e);
            }
        }
    }

    /// Stop background work and drain the executor.
    pub fn shutdown(&self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
        let handle = {
            let mut slot = match self.maintenance.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::debug!("[Bus] maintenance thread exited via panic");
            }
        }
        self.executor.shutdown();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_handler(state: &mut BusState, id: u64) -> Option<String> {
    let address = state.ids.remove(&id)?;
    let now_empty = match state.handlers.get_mut(&address) {
        Some(list) => {
            list.retain(|entry| entry.id != id);
            list.is_empty()
        }
        None => false,
    };
    if now_empty {
        state.handlers.remove(&address);
        state.cursors.remove(&address);
    }
    Some(address)
}

fn address_key(address: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    address.hash(&mut hasher);
    hasher.finish()
}

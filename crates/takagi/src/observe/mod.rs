// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Observe subsystem (RFC 7641).
//!
//! Server-side subscription registry with notification fan-out. `notify`
//! snapshots the delivery work under the mutex and performs the actual
//! sends outside it, so a slow subscriber never blocks registration.
//! Sequence numbers are per-subscription, strictly monotonic, and wrap at
//! 24 bits on the wire.
//!
//! Delta filtering: a subscription with a `delta` threshold accumulates
//! the absolute change across skipped notifications and delivers once the
//! drift since its last delivery reaches the threshold. A single jump of
//! at least `delta` therefore always delivers, and a slow drift cannot
//! stay invisible forever.
//!
//! Stale subscriptions (remote observers with no delivery inside the
//! max-age window) are reclaimed by a background sweep.

use crate::bus::hooks::EventSink;
use crate::config::{OBSERVE_DEFAULT_MAX_AGE, OBSERVE_SWEEP_INTERVAL};
use crate::message::{Message, MessageType};
use crate::protocol::constants as c;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Local observer callback, invoked with each delivered value.
pub type ObserveCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Transport hook used to push notifications to remote observers.
pub trait NotifySender: Send + Sync {
    /// Send an encoded notification to the observer's address.
    fn send(&self, peer: SocketAddr, message: &Message);
}

/// One observer of one path.
pub struct Subscription {
    /// Token the observer registered with (response correlation key).
    pub token: Vec<u8>,
    /// Remote observer address; `None` for local callbacks.
    pub peer: Option<SocketAddr>,
    /// Local delivery callback; `None` for remote observers.
    pub callback: Option<ObserveCallback>,
    /// Minimum accumulated change required between deliveries.
    pub delta: Option<f64>,
    created_at: Instant,
    last_notified_at: Option<Instant>,
    last_value: Option<Value>,
    last_sequence: u32,
    drift: f64,
    prev_seen: Option<f64>,
}

impl Subscription {
    /// Subscription for a remote observer.
    pub fn remote(peer: SocketAddr, token: Vec<u8>) -> Self {
        Self {
            token,
            peer: Some(peer),
            callback: None,
            delta: None,
            created_at: Instant::now(),
            last_notified_at: None,
            last_value: None,
            last_sequence: 0,
            drift: 0.0,
            prev_seen: None,
        }
    }

    /// Subscription delivering to a local callback.
    pub fn local(token: Vec<u8>, callback: ObserveCallback) -> Self {
        Self {
            token,
            peer: None,
            callback: Some(callback),
            delta: None,
            created_at: Instant::now(),
            last_notified_at: None,
            last_value: None,
            last_sequence: 0,
            drift: 0.0,
            prev_seen: None,
        }
    }

    /// Set the delta threshold.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Sequence of the most recent delivery (0 before the first).
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Value of the most recent delivery.
    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// Decide whether `value` must be delivered, updating filter state.
    fn should_deliver(&mut self, value: &Value) -> bool {
        let Some(delta) = self.delta else {
            return true;
        };
        if self.last_value.is_none() {
            return true;
        }
        let (Some(new), Some(prev)) = (value.as_f64(), self.prev_seen) else {
            // Non-numeric values bypass the numeric filter.
            return true;
        };
        self.drift += (new - prev).abs();
        self.prev_seen = Some(new);
        self.drift >= delta
    }

    fn mark_delivered(&mut self, value: &Value, now: Instant) -> u32 {
        self.last_sequence += 1;
        self.last_value = Some(value.clone());
        self.last_notified_at = Some(now);
        self.drift = 0.0;
        self.prev_seen = value.as_f64();
        self.last_sequence
    }

    fn is_stale(&self, max_age: Duration, now: Instant) -> bool {
        if self.callback.is_some() {
            return false;
        }
        let reference = self.last_notified_at.unwrap_or(self.created_at);
        now.duration_since(reference) > max_age
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("delta", &self.delta)
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

enum Delivery {
    Local {
        callback: ObserveCallback,
        value: Value,
    },
    Remote {
        peer: SocketAddr,
        token: Vec<u8>,
        sequence: u32,
        value: Value,
    },
}

/// Per-path subscription lists with notification fan-out.
pub struct ObserveRegistry {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    latest: Mutex<HashMap<String, Value>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    sender: Mutex<Option<Arc<dyn NotifySender>>>,
    notification_id: AtomicU32,
    sweeper_running: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ObserveRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            sender: Mutex::new(None),
            notification_id: AtomicU32::new(1),
            sweeper_running: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        }
    }

    /// Attach the hook sink.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        *lock_recovering(&self.sink, "sink") = Some(sink);
    }

    /// Attach the transport sender for remote notifications.
    pub fn attach_sender(&self, sender: Arc<dyn NotifySender>) {
        *lock_recovering(&self.sender, "sender") = Some(sender);
    }

    fn lock_subs(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        lock_recovering(&self.subscriptions, "subscriptions")
    }

    fn emit(&self, event: &str, payload: Value) {
        let sink = lock_recovering(&self.sink, "sink").clone();
        if let Some(sink) = sink {
            sink.emit(event, payload);
        }
    }

    /// Register a subscription; returns its current sequence number (the
    /// value carried by the initial Observe response).
    pub fn subscribe(&self, path: &str, mut subscription: Subscription) -> u32 {
        subscription.created_at = Instant::now();
        let token = subscription.token.clone();
        let sequence = subscription.last_sequence;
        self.lock_subs()
            .entry(path.to_string())
            .or_default()
            .push(subscription);
        log::debug!("[Observe] subscribed path={} token={:02x?}", path, token);
        self.emit(
            "observe_subscribed",
            json!({ "path": path, "token": hex(&token) }),
        );
        sequence
    }

    /// Remove the first subscription on `path` with a matching token.
    pub fn unsubscribe(&self, path: &str, token: &[u8]) -> bool {
        let removed = {
            let mut subs = self.lock_subs();
            let Some(list) = subs.get_mut(path) else {
                return false;
            };
            let found = list.iter().position(|s| s.token == token);
            if let Some(index) = found {
                list.remove(index);
                if list.is_empty() {
                    subs.remove(path);
                }
                true
            } else {
                false
            }
        };
        if removed {
            log::debug!("[Observe] unsubscribed path={} token={:02x?}", path, token);
            self.emit(
                "observe_unsubscribed",
                json!({ "path": path, "token": hex(token) }),
            );
        }
        removed
    }

    /// Remove every subscription held by `peer` (RST receipt, connection
    /// teardown). Returns the number removed.
    pub fn remove_peer(&self, peer: SocketAddr) -> usize {
        let mut removed = 0;
        let mut subs = self.lock_subs();
        subs.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.peer != Some(peer));
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            log::debug!("[Observe] removed {} subscriptions for {}", removed, peer);
        }
        removed
    }

    /// Number of subscriptions on `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.lock_subs().get(path).map_or(0, Vec::len)
    }

    /// Last value notified on `path` (serves the initial Observe GET).
    pub fn last_value(&self, path: &str) -> Option<Value> {
        lock_recovering(&self.latest, "latest").get(path).cloned()
    }

    /// Sequence of the subscription on `path` with the given token.
    pub fn sequence_for(&self, path: &str, token: &[u8]) -> Option<u32> {
        self.lock_subs()
            .get(path)?
            .iter()
            .find(|s| s.token == token)
            .map(Subscription::last_sequence)
    }

    /// Fan a new value out to the path's subscribers. Returns the number
    /// of deliveries performed.
    pub fn notify(&self, path: &str, value: &Value) -> usize {
        self.emit("observe_notify_start", json!({ "path": path }));
        lock_recovering(&self.latest, "latest").insert(path.to_string(), value.clone());

        let now = Instant::now();
        // Decide and stamp under the lock, deliver outside it.
        let deliveries: Vec<Delivery> = {
            let mut subs = self.lock_subs();
            let Some(list) = subs.get_mut(path) else {
                self.emit("observe_notify_end", json!({ "path": path, "delivered": 0 }));
                return 0;
            };
            list.iter_mut()
                .filter_map(|subscription| {
                    if !subscription.should_deliver(value) {
                        return None;
                    }
                    let sequence = subscription.mark_delivered(value, now);
                    match (&subscription.callback, subscription.peer) {
                        (Some(callback), _) => Some(Delivery::Local {
                            callback: Arc::clone(callback),
                            value: value.clone(),
                        }),
                        (None, Some(peer)) => Some(Delivery::Remote {
                            peer,
                            token: subscription.token.clone(),
                            sequence,
                            value: value.clone(),
                        }),
                        (None, None) => None,
                    }
                })
                .collect()
        };

        let delivered = deliveries.len();
        for delivery in deliveries {
            match delivery {
                Delivery::Local { callback, value } => callback(&value),
                Delivery::Remote {
                    peer,
                    token,
                    sequence,
                    value,
                } => self.push_remote(peer, token, sequence, &value),
            }
        }

        self.emit(
            "observe_notify_end",
            json!({ "path": path, "delivered": delivered }),
        );
        delivered
    }

    fn push_remote(&self, peer: SocketAddr, token: Vec<u8>, sequence: u32, value: &Value) {
        let sender = lock_recovering(&self.sender, "sender").clone();
        let Some(sender) = sender else {
            log::debug!("[Observe] no transport sender; dropping notification to {}", peer);
            return;
        };

        let message_id = (self.notification_id.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16;
        let mut message = Message::udp(MessageType::Non, c::CODE_CONTENT, message_id, token);
        message
            .options
            .set_uint(c::OPT_OBSERVE, sequence % crate::config::OBSERVE_SEQUENCE_MODULUS);
        message
            .options
            .set_uint(c::OPT_CONTENT_FORMAT, u32::from(c::FORMAT_JSON));
        match serde_json::to_vec(value) {
            Ok(bytes) => message.payload = bytes,
            Err(e) => {
                log::error!("[Observe] notification encode failed: {}", e);
                return;
            }
        }
        sender.send(peer, &message);
    }

    /// Remove remote subscriptions with no delivery inside `max_age`.
    /// Returns the number removed.
    pub fn cleanup_stale_observers(&self, max_age: Duration, now: Instant) -> usize {
        let mut removed = 0;
        {
            let mut subs = self.lock_subs();
            subs.retain(|path, list| {
                let before = list.len();
                list.retain(|s| !s.is_stale(max_age, now));
                let dropped = before - list.len();
                if dropped > 0 {
                    log::debug!("[Observe] reclaimed {} stale observers on {}", dropped, path);
                }
                removed += dropped;
                !list.is_empty()
            });
        }
        removed
    }

    /// Drop every subscription (server shutdown).
    pub fn stop_all(&self) {
        let count: usize = {
            let mut subs = self.lock_subs();
            let count = subs.values().map(Vec::len).sum();
            subs.clear();
            count
        };
        if count > 0 {
            log::info!("[Observe] dropped {} subscriptions at shutdown", count);
        }
        self.stop_sweeper();
    }

    /// Start the periodic stale-observer sweep.
    pub fn start_sweeper(registry: &Arc<ObserveRegistry>) {
        Self::start_sweeper_with(registry, OBSERVE_SWEEP_INTERVAL, OBSERVE_DEFAULT_MAX_AGE);
    }

    /// Start the sweep with explicit interval and max-age.
    pub fn start_sweeper_with(
        registry: &Arc<ObserveRegistry>,
        interval: Duration,
        max_age: Duration,
    ) {
        if registry.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<ObserveRegistry> = Arc::downgrade(registry);
        let running = Arc::clone(&registry.sweeper_running);
        let builder = thread::Builder::new().name("takagi-observe-sweep".to_string());
        let handle = builder.spawn(move || {
            while running.load(Ordering::SeqCst) {
                let mut slept = Duration::ZERO;
                while slept < interval && running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(100));
                    slept += Duration::from_millis(100);
                }
                let Some(registry) = weak.upgrade() else { break };
                let removed = registry.cleanup_stale_observers(max_age, Instant::now());
                if removed > 0 {
                    log::info!("[Observe] sweep reclaimed {} stale observers", removed);
                }
            }
        });
        match handle {
            Ok(handle) => {
                *lock_recovering(&registry.sweeper, "sweeper") = Some(handle);
            }
            Err(e) => {
                registry.sweeper_running.store(false, Ordering::SeqCst);
                log::error!("[Observe] failed to spawn sweeper: {}", e);
            }
        }
    }

    fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
        let handle = lock_recovering(&self.sweeper, "sweeper").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::debug!("[Observe] sweeper exited via panic");
            }
        }
    }
}

impl Default for ObserveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObserveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.lock_subs().values().map(Vec::len).sum();
        f.debug_struct("ObserveRegistry")
            .field("subscriptions", &total)
            .finish()
    }
}

fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[Observe] {} lock poisoned, recovering", what);
            e.into_inner()
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Takagi Global Configuration - Single Source of Truth
//!
//! This module centralizes ALL CoAP protocol constants and runtime
//! configuration. **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (RFC 7252/8323 numbers, ports, limits)
//! - **Level 2 (Dynamic)**: `RuntimeConfig` for runtime config (ports, worker counts, key/value overrides)
//!
//! # Performance
//!
//! - **Lock-free**: `DashMap` for the key/value store (no RwLock contention)
//! - **Atomic swap**: `ArcSwap` for the network settings snapshot (no lock)
//! - **O(1)**: All get/set operations are constant time

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

// =======================================================================
// CoAP port assignments (RFC 7252 Sec.12.6)
// IANA registered: 5683 (coap), 5684 (coaps)
// =======================================================================

/// Default CoAP port for UDP and TCP transports (RFC 7252 Sec.12.6).
///
/// All servers bind this port unless overridden.
/// **NEVER hardcode 5683 elsewhere!**
pub const COAP_DEFAULT_PORT: u16 = 5683;

/// CoAPS (DTLS) port, reserved but not implemented (RFC 7252 Sec.12.6).
pub const COAPS_DEFAULT_PORT: u16 = 5684;

// =======================================================================
// Wire-format limits (RFC 7252 Sec.3, RFC 8323 Sec.3)
// =======================================================================

/// Maximum token length in bytes (TKL 0..=8, RFC 7252 Sec.3).
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Payload marker byte separating options from payload (RFC 7252 Sec.3).
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// CoAP wire protocol version (RFC 7252 Sec.3). The only defined value.
pub const COAP_VERSION: u8 = 1;

/// Largest option delta / length expressible with the two-byte nibble
/// extension: 269 + 65535 (RFC 7252 Sec.3.1).
pub const MAX_OPTION_EXTENSION: u32 = 65804;

/// Max-Message-Size advertised in the server CSM (RFC 8323 Sec.5.3.1.1).
pub const CSM_MAX_MESSAGE_SIZE: u32 = 8_388_864;

/// Observe option sequence numbers wrap at 24 bits (RFC 7641 Sec.4.4).
pub const OBSERVE_SEQUENCE_MODULUS: u32 = 1 << 24;

// =======================================================================
// Server defaults
// =======================================================================

/// Default number of UDP worker processes (1 = no fork, threads only).
pub const DEFAULT_WORKER_PROCESSES: usize = 1;

/// Default number of UDP worker threads per process.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Largest datagram accepted on the UDP socket.
pub const UDP_RECV_BUFFER_SIZE: usize = 65535;

/// Entries kept in the per-process UDP message-id deduplication cache.
pub const UDP_DEDUP_CACHE_SIZE: usize = 1024;

/// Grace period given to UDP worker processes between SIGTERM and SIGKILL.
pub const WORKER_TERM_GRACE: Duration = Duration::from_secs(2);

/// Deadline for joining TCP connection threads at shutdown.
pub const TCP_JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Poll timeout of the TCP accept loop (bounds shutdown latency).
pub const TCP_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// =======================================================================
// Observe defaults (RFC 7641)
// =======================================================================

/// Subscriptions with no activity for this long are reclaimed.
pub const OBSERVE_DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

/// Interval between stale-observer sweeps.
pub const OBSERVE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =======================================================================
// Event bus defaults
// =======================================================================

/// Default per-address capacity of the optional message buffer.
pub const BUS_BUFFER_CAPACITY: usize = 100;

/// Default TTL of buffered messages.
pub const BUS_BUFFER_TTL: Duration = Duration::from_secs(300);

/// Reply consumers registered by `send` auto-unregister after this long.
pub const BUS_REPLY_TTL: Duration = Duration::from_secs(30);

/// Worker threads in the event-bus executor pool.
pub const BUS_EXECUTOR_THREADS: usize = 4;

/// Tick of the bus maintenance task (buffer TTL eviction, reply GC).
pub const BUS_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

// =======================================================================
// Runtime configuration
// =======================================================================

/// Network settings snapshot, swapped atomically on reconfiguration.
#[derive(Debug, Clone)]
pub struct NetSettings {
    /// UDP bind port.
    pub udp_port: u16,
    /// TCP bind port.
    pub tcp_port: u16,
    /// UDP worker processes (unix only; 1 disables forking).
    pub worker_processes: usize,
    /// UDP worker threads per process.
    pub worker_threads: usize,
    /// Enable SO_REUSEPORT on the UDP socket (multi-process mode).
    pub reuse_port: bool,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            udp_port: COAP_DEFAULT_PORT,
            tcp_port: COAP_DEFAULT_PORT,
            worker_processes: DEFAULT_WORKER_PROCESSES,
            worker_threads: DEFAULT_WORKER_THREADS,
            reuse_port: false,
        }
    }
}

impl NetSettings {
    /// Build settings from environment overrides.
    ///
    /// Recognized variables: `TAKAGI_PORT`, `TAKAGI_TCP_PORT`,
    /// `TAKAGI_WORKER_PROCESSES`, `TAKAGI_WORKER_THREADS`,
    /// `TAKAGI_REUSEPORT` (set to `1` to enable).
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(port) = env_parse::<u16>("TAKAGI_PORT") {
            settings.udp_port = port;
            settings.tcp_port = port;
        }
        if let Some(port) = env_parse::<u16>("TAKAGI_TCP_PORT") {
            settings.tcp_port = port;
        }
        if let Some(n) = env_parse::<usize>("TAKAGI_WORKER_PROCESSES") {
            settings.worker_processes = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("TAKAGI_WORKER_THREADS") {
            settings.worker_threads = n.max(1);
        }
        settings.reuse_port = std::env::var("TAKAGI_REUSEPORT")
            .map(|v| v == "1")
            .unwrap_or(false);
        settings
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("[Config] ignoring unparseable {}={}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}

/// Runtime configuration store.
///
/// Key/value overrides live in a `DashMap` (lock-free reads and writes);
/// the structured network settings are an `ArcSwap` snapshot so the hot
/// server paths never take a lock to read them.
pub struct RuntimeConfig {
    settings: ArcSwap<NetSettings>,
    store: DashMap<Arc<str>, Arc<str>>,
}

impl RuntimeConfig {
    /// Create a config with built-in defaults.
    pub fn new() -> Self {
        Self {
            settings: ArcSwap::from_pointee(NetSettings::default()),
            store: DashMap::new(),
        }
    }

    /// Create a config seeded from environment overrides.
    pub fn from_env() -> Self {
        Self {
            settings: ArcSwap::from_pointee(NetSettings::from_env()),
            store: DashMap::new(),
        }
    }

    /// Current network settings snapshot.
    pub fn net(&self) -> Arc<NetSettings> {
        self.settings.load_full()
    }

    /// Replace the network settings snapshot.
    pub fn set_net(&self, settings: NetSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Set a free-form key/value override.
    pub fn set(&self, key: &str, value: &str) {
        self.store.insert(Arc::from(key), Arc::from(value));
    }

    /// Look up a free-form override.
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.store.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// All overrides whose key starts with `prefix`, in unspecified order.
    pub fn search_prefix(&self, prefix: &str) -> Vec<(Arc<str>, Arc<str>)> {
        self.store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (Arc::clone(entry.key()), Arc::clone(entry.value())))
            .collect()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

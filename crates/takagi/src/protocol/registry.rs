// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Runtime protocol-constant registry
//!
//! Each registry is a mutex-protected table mapping a numeric protocol value
//! to its entry (name, optional symbol, optional RFC reference), with reverse
//! lookups from name and symbol. Registration is live: codec and negotiation
//! decisions honor entries added after startup, which is how plugins extend
//! the protocol surface.
//!
//! The value is the identity. Registering the exact same entry twice is a
//! no-op; registering the same value with a different symbol is a conflict.

use crate::bus::hooks::EventSink;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// One registered protocol constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Numeric protocol value (the identity).
    pub value: u16,
    /// Human-readable name (e.g. "GET", "2.05 Content").
    pub name: String,
    /// Short lookup symbol (e.g. "get", "content").
    pub symbol: Option<String>,
    /// RFC reference (e.g. "RFC 7252").
    pub rfc: Option<String>,
}

/// Registration failure.
#[derive(Debug)]
pub enum RegistryError {
    /// Same value registered with a different symbol.
    Conflict {
        /// Registry kind ("method", "response", ...).
        registry: &'static str,
        /// The contested value.
        value: u16,
        /// Symbol already registered for the value.
        existing: String,
        /// Symbol the caller tried to register.
        proposed: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Conflict {
                registry,
                value,
                existing,
                proposed,
            } => write!(
                f,
                "{} registry conflict for value {}: registered as '{}', proposed '{}'",
                registry, value, existing, proposed
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
struct Tables {
    by_value: HashMap<u16, RegistryEntry>,
    by_name: HashMap<String, u16>,
    by_symbol: HashMap<String, u16>,
}

/// Thread-safe runtime table of protocol constants.
pub struct Registry {
    kind: &'static str,
    tables: Mutex<Tables>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
}

impl Registry {
    /// Create an empty registry of the given kind ("method", "option", ...).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tables: Mutex::new(Tables::default()),
            sink: Mutex::new(None),
        }
    }

    /// Registry kind label used in logs and hook payloads.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Attach the hook sink that receives `coap_registry_registered` events.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        *self.lock_sink() = Some(sink);
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Registry] {} tables lock poisoned, recovering", self.kind);
                e.into_inner()
            }
        }
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Arc<dyn EventSink>>> {
        match self.sink.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Registry] {} sink lock poisoned, recovering", self.kind);
                e.into_inner()
            }
        }
    }

    /// Register a protocol constant.
    ///
    /// Idempotent when the exact entry is already present. Fails with
    /// [`RegistryError::Conflict`] when the value is registered under a
    /// different symbol.
    pub fn register(
        &self,
        value: u16,
        name: &str,
        symbol: Option<&str>,
        rfc: Option<&str>,
    ) -> Result<(), RegistryError> {
        {
            let mut tables = self.lock_tables();
            if let Some(existing) = tables.by_value.get(&value) {
                if existing.symbol.as_deref() == symbol {
                    // Exact duplicate: keep the first registration.
                    return Ok(());
                }
                return Err(RegistryError::Conflict {
                    registry: self.kind,
                    value,
                    existing: existing.symbol.clone().unwrap_or_default(),
                    proposed: symbol.unwrap_or_default().to_string(),
                });
            }

            let entry = RegistryEntry {
                value,
                name: name.to_string(),
                symbol: symbol.map(str::to_string),
                rfc: rfc.map(str::to_string),
            };
            tables.by_name.insert(entry.name.clone(), value);
            if let Some(sym) = &entry.symbol {
                tables.by_symbol.insert(sym.clone(), value);
            }
            tables.by_value.insert(value, entry);
        }

        log::trace!("[Registry] {} registered {} = {}", self.kind, value, name);
        let sink = self.lock_sink().clone();
        if let Some(sink) = sink {
            sink.emit(
                "coap_registry_registered",
                json!({ "registry": self.kind, "value": value, "name": name }),
            );
        }
        Ok(())
    }

    /// Name for a value, if registered.
    pub fn name_for(&self, value: u16) -> Option<String> {
        self.lock_tables()
            .by_value
            .get(&value)
            .map(|entry| entry.name.clone())
    }

    /// Value for a name or symbol.
    pub fn value_for(&self, name_or_symbol: &str) -> Option<u16> {
        let tables = self.lock_tables();
        tables
            .by_name
            .get(name_or_symbol)
            .or_else(|| tables.by_symbol.get(name_or_symbol))
            .copied()
    }

    /// Symbol for a value, if one was registered.
    pub fn symbol_for(&self, value: u16) -> Option<String> {
        self.lock_tables()
            .by_value
            .get(&value)
            .and_then(|entry| entry.symbol.clone())
    }

    /// RFC reference for a value, if one was registered.
    pub fn rfc_for(&self, value: u16) -> Option<String> {
        self.lock_tables()
            .by_value
            .get(&value)
            .and_then(|entry| entry.rfc.clone())
    }

    /// True when the value is registered.
    pub fn contains(&self, value: u16) -> bool {
        self.lock_tables().by_value.contains_key(&value)
    }

    /// All registered values, ascending.
    pub fn values(&self) -> Vec<u16> {
        let mut values: Vec<u16> = self.lock_tables().by_value.keys().copied().collect();
        values.sort_unstable();
        values
    }

    /// Snapshot of all entries, ascending by value.
    pub fn all(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> =
            self.lock_tables().by_value.values().cloned().collect();
        entries.sort_unstable_by_key(|entry| entry.value);
        entries
    }

    /// Iterate a snapshot of entries without holding the lock during `f`.
    pub fn for_each_value<F: FnMut(&RegistryEntry)>(&self, mut f: F) {
        for entry in self.all() {
            f(&entry);
        }
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.lock_tables().by_value.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

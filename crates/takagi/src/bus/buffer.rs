// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Optional bounded message buffering.
//!
//! One ring per address, bounded by entry count and by TTL. Writes happen
//! synchronously on publish (before local delivery) so a replay issued
//! right after a publish always sees the message. Expired entries are
//! dropped lazily on access and by the bus maintenance tick.

use super::BusMessage;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Per-address bounded ring of recent messages.
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    ttl: Duration,
    rings: HashMap<String, VecDeque<(BusMessage, Instant)>>,
}

impl MessageBuffer {
    /// Create a buffer bounding each address to `capacity` entries and
    /// each entry to `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            rings: HashMap::new(),
        }
    }

    /// Store a message, evicting the oldest entry when the ring is full.
    pub fn store(&mut self, message: &BusMessage, now: Instant) {
        let ring = self.rings.entry(message.address.clone()).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back((message.clone(), now));
    }

    /// Messages for `address` stored at or after `since`, oldest first.
    /// Entries past their TTL are excluded (and dropped).
    pub fn replay(&mut self, address: &str, since: Option<Instant>, now: Instant) -> Vec<BusMessage> {
        self.evict_ring(address, now);
        let Some(ring) = self.rings.get(address) else {
            return Vec::new();
        };
        ring.iter()
            .filter(|(_, at)| since.map_or(true, |s| *at >= s))
            .map(|(message, _)| message.clone())
            .collect()
    }

    /// Drop expired entries across all rings; returns entries removed.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.rings.retain(|_, ring| {
            let before = ring.len();
            while let Some((_, at)) = ring.front() {
                if now.duration_since(*at) > self.ttl {
                    ring.pop_front();
                } else {
                    break;
                }
            }
            removed += before - ring.len();
            !ring.is_empty()
        });
        removed
    }

    fn evict_ring(&mut self, address: &str, now: Instant) {
        if let Some(ring) = self.rings.get_mut(address) {
            while let Some((_, at)) = ring.front() {
                if now.duration_since(*at) > self.ttl {
                    ring.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Total buffered entries (all addresses).
    pub fn len(&self) -> usize {
        self.rings.values().map(VecDeque::len).sum()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Scope;
    use serde_json::json;

    fn msg(address: &str, n: i64) -> BusMessage {
        BusMessage::new(address, json!({ "n": n }), Scope::Local)
    }

    #[test]
    fn test_capacity_bound_drops_oldest() {
        let mut buffer = MessageBuffer::new(3, Duration::from_secs(300));
        let now = Instant::now();
        for n in 0..5 {
            buffer.store(&msg("q", n), now);
        }
        let replayed = buffer.replay("q", None, now);
        let ns: Vec<i64> = replayed.iter().map(|m| m.body["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);
    }

    #[test]
    fn test_replay_since_filters() {
        let mut buffer = MessageBuffer::new(10, Duration::from_secs(300));
        let early = Instant::now();
        buffer.store(&msg("q", 1), early);
        let cut = early + Duration::from_millis(10);
        buffer.store(&msg("q", 2), cut + Duration::from_millis(10));

        let replayed = buffer.replay("q", Some(cut), cut + Duration::from_millis(20));
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].body["n"], 2);
    }

    #[test]
    fn test_ttl_eviction() {
        let mut buffer = MessageBuffer::new(10, Duration::from_secs(1));
        let start = Instant::now();
        buffer.store(&msg("q", 1), start);
        buffer.store(&msg("r", 2), start);

        assert_eq!(buffer.evict_expired(start + Duration::from_secs(2)), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_addresses_are_isolated() {
        let mut buffer = MessageBuffer::new(10, Duration::from_secs(300));
        let now = Instant::now();
        buffer.store(&msg("a", 1), now);
        buffer.store(&msg("b", 2), now);
        assert_eq!(buffer.replay("a", None, now).len(), 1);
        assert_eq!(buffer.replay("missing", None, now).len(), 0);
    }
}

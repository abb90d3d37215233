// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Reply futures for request-reply over the bus.
//!
//! A [`ReplySlot`] is completed at most once by the reply consumer; the
//! [`Reply`] handle blocks on a condvar until completion or deadline.
//! Condvar wakeups coalesce naturally, so spurious wakeups just re-check
//! the slot.

use super::{BusError, BusMessage};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct SlotState {
    value: Option<BusMessage>,
    completed: bool,
}

/// Shared completion slot.
pub struct ReplySlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ReplySlot {
    /// New empty slot plus its waiting handle.
    pub fn new() -> (Arc<ReplySlot>, Reply) {
        let slot = Arc::new(ReplySlot {
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
        });
        let handle = Reply {
            slot: Arc::clone(&slot),
        };
        (slot, handle)
    }

    /// Complete the slot. Later completions are ignored.
    pub fn complete(&self, message: BusMessage) {
        let mut state = self.state.lock();
        if !state.completed {
            state.value = Some(message);
            state.completed = true;
            self.ready.notify_all();
        }
    }
}

/// Waiting side of a pending reply.
pub struct Reply {
    slot: Arc<ReplySlot>,
}

impl Reply {
    /// Block until the reply arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<BusMessage, BusError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while !state.completed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Timeout);
            }
            if self.slot.ready.wait_for(&mut state, remaining).timed_out() && !state.completed {
                return Err(BusError::Timeout);
            }
        }
        state.value.take().ok_or(BusError::Timeout)
    }

    /// Non-blocking check; returns the reply if it has arrived.
    pub fn try_take(&self) -> Option<BusMessage> {
        let mut state = self.slot.state.lock();
        if state.completed {
            state.value.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Scope;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let (_slot, reply) = ReplySlot::new();
        let started = Instant::now();
        let result = reply.wait(Duration::from_millis(100));
        assert!(matches!(result, Err(BusError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let (slot, reply) = ReplySlot::new();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            slot.complete(BusMessage::new("x.reply", json!({"ok": true}), Scope::Local));
        });
        let message = reply.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(message.body["ok"], true);
        producer.join().unwrap();
    }

    #[test]
    fn test_second_completion_ignored() {
        let (slot, reply) = ReplySlot::new();
        slot.complete(BusMessage::new("r", json!(1), Scope::Local));
        slot.complete(BusMessage::new("r", json!(2), Scope::Local));
        assert_eq!(reply.wait(Duration::from_millis(10)).unwrap().body, json!(1));
    }

    #[test]
    fn test_try_take() {
        let (slot, reply) = ReplySlot::new();
        assert!(reply.try_take().is_none());
        slot.complete(BusMessage::new("r", json!(1), Scope::Local));
        assert!(reply.try_take().is_some());
        assert!(reply.try_take().is_none());
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Sharded executor for handler invocations.
//!
//! Delivery jobs are routed to a worker by handler id, so one handler
//! always runs on the same worker and observes messages in publish order,
//! while distinct handlers run in parallel. Handler panics are caught and
//! logged; they never reach the publisher.

use crossbeam::channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads with per-key FIFO ordering.
pub struct Executor {
    senders: Mutex<Option<Vec<Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            senders.push(tx);
            let builder = thread::Builder::new().name(format!("takagi-bus-{}", index));
            match builder.spawn(move || {
                while let Ok(job) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("[Bus] handler panicked; continuing");
                    }
                }
            }) {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("[Bus] failed to spawn executor worker: {}", e),
            }
        }

        Self {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job on the worker owning `key`. Jobs with the same key run
    /// in submission order. Returns false after shutdown.
    pub fn submit(&self, key: u64, job: Job) -> bool {
        let guard = match self.senders.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Bus] executor senders lock poisoned, recovering");
                e.into_inner()
            }
        };
        let Some(senders) = guard.as_ref() else {
            return false;
        };
        if senders.is_empty() {
            return false;
        }
        let index = (key % senders.len() as u64) as usize;
        senders[index].send(job).is_ok()
    }

    /// Drop the queues and join workers. Pending jobs drain first.
    pub fn shutdown(&self) {
        {
            let mut guard = match self.senders.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            guard.take();
        }
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if handle.join().is_err() {
                log::debug!("[Bus] executor worker exited via panic");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let executor = Executor::new(2);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(executor.submit(1, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_same_key_preserves_order() {
        let executor = Executor::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..100u64 {
            let seen = Arc::clone(&seen);
            executor.submit(7, Box::new(move || {
                seen.lock().unwrap().push(n);
            }));
        }
        executor.shutdown();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn test_panic_is_contained() {
        let executor = Executor::new(1);
        let counter = Arc::new(AtomicU64::new(0));
        executor.submit(0, Box::new(|| panic!("boom")));
        let c = Arc::clone(&counter);
        executor.submit(0, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        // Give the worker a beat, then drain.
        std::thread::sleep(Duration::from_millis(20));
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let executor = Executor::new(1);
        executor.shutdown();
        assert!(!executor.submit(0, Box::new(|| {})));
    }
}

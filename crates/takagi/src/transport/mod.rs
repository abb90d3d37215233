// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Transport servers: UDP worker-pool and TCP connection-per-thread.
//!
//! Both servers share a cooperative [`Shutdown`] flag polled by their
//! loops, and hand parsed requests to the application through the
//! [`RequestPipeline`] seam (middleware chain -> router -> response).
//! SIGINT flips a process-wide flag that the application run loop folds
//! into the shared shutdown flag.

pub mod tcp;
pub mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;

use crate::message::{Message, Request};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The application-side request entry point shared by both transports.
pub trait RequestPipeline: Send + Sync {
    /// Handle a parsed request and produce the response message.
    fn handle(&self, request: Request) -> Message;

    /// The peer reset (RST on UDP) or disappeared (TCP teardown); drop
    /// any observe subscriptions it held.
    fn reset(&self, peer: SocketAddr);
}

/// Cooperative shutdown flag shared by server loops.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    /// New, un-triggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once shutdown was requested.
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SIGINT hook
// ============================================================================

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    // Only async-signal-safe work here: flip the flag.
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler that flips the process-wide shutdown flag.
#[cfg(unix)]
pub fn install_sigint_handler() {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    let previous = unsafe { libc::signal(libc::SIGINT, handler as usize) };
    if previous == libc::SIG_ERR {
        log::warn!("[Transport] failed to install SIGINT handler");
    }
}

/// No-op outside unix; shutdown stays explicit.
#[cfg(not(unix))]
pub fn install_sigint_handler() {}

/// Route SIGTERM to the same flag (forked UDP workers are stopped with
/// SIGTERM by the parent).
#[cfg(unix)]
pub(crate) fn install_sigterm_handler() {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    let previous = unsafe { libc::signal(libc::SIGTERM, handler as usize) };
    if previous == libc::SIG_ERR {
        log::warn!("[Transport] failed to install SIGTERM handler");
    }
}

/// True once SIGINT was delivered.
pub fn sigint_received() -> bool {
    SIGINT_RECEIVED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_is_shared_across_clones() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        assert!(!observer.requested());
        shutdown.request();
        assert!(observer.requested());
    }
}

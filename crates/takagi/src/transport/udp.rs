// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! UDP transport server (RFC 7252).
//!
//! One datagram socket shared by a pool of worker threads, optionally
//! spread across forked worker processes (unix). Each worker loops:
//! receive, decode, dispatch through the pipeline, encode, send back to
//! the origin. Per-datagram failures are logged and never abort the
//! worker.
//!
//! Confirmable requests get piggybacked ACK responses; non-confirmable
//! requests get NON responses. Malformed datagrams are answered with RST
//! when a message-id can still be recovered. A small LRU keyed by
//! (peer, message-id) absorbs duplicate datagrams.

use super::{RequestPipeline, Shutdown};
use crate::codec;
use crate::config::{UDP_DEDUP_CACHE_SIZE, UDP_RECV_BUFFER_SIZE, WORKER_TERM_GRACE};
use crate::message::{Message, MessageType, Request, Response};
use crate::observe::NotifySender;
use crate::protocol::constants as c;
use lru::LruCache;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// UDP server settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Bind address.
    pub bind: SocketAddr,
    /// Worker processes (unix only; 1 disables forking).
    pub processes: usize,
    /// Worker threads per process.
    pub threads: usize,
    /// Enable SO_REUSEPORT (multi-process deployments).
    pub reuse_port: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::config::COAP_DEFAULT_PORT)),
            processes: crate::config::DEFAULT_WORKER_PROCESSES,
            threads: crate::config::DEFAULT_WORKER_THREADS,
            reuse_port: false,
        }
    }
}

/// Datagram counters (relaxed; observability only).
#[derive(Debug, Default)]
pub struct UdpMetrics {
    received: AtomicU64,
    responded: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    send_errors: AtomicU64,
}

impl UdpMetrics {
    /// Datagrams received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Responses sent.
    pub fn responded(&self) -> u64 {
        self.responded.load(Ordering::Relaxed)
    }

    /// Datagrams the codec rejected.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Duplicate datagrams absorbed by the dedup cache.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Send failures.
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Transport handle the observe registry uses to push notifications.
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    metrics: Arc<UdpMetrics>,
}

impl NotifySender for UdpSender {
    fn send(&self, peer: SocketAddr, message: &Message) {
        match codec::udp::encode(message) {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, peer) {
                    self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[Udp] notification send to {} failed: {}", peer, e);
                }
            }
            Err(e) => log::error!("[Udp] notification encode failed: {}", e),
        }
    }
}

/// The UDP server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: UdpConfig,
    pipeline: Arc<dyn RequestPipeline>,
    shutdown: Shutdown,
    metrics: Arc<UdpMetrics>,
    dedup: Arc<Mutex<LruCache<(SocketAddr, u16), ()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(unix)]
    children: Mutex<Vec<libc::pid_t>>,
}

impl UdpServer {
    /// Bind the socket; workers start with [`UdpServer::start`].
    pub fn bind(
        config: UdpConfig,
        pipeline: Arc<dyn RequestPipeline>,
        shutdown: Shutdown,
    ) -> io::Result<Self> {
        let domain = if config.bind.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;
        #[cfg(unix)]
        if config.reuse_port {
            socket2.set_reuse_port(true)?;
            log::info!("[Udp] SO_REUSEPORT enabled (multi-process mode)");
        }
        socket2.bind(&config.bind.into())?;

        let socket: UdpSocket = socket2.into();
        // Workers poll the shutdown flag between reads.
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let local_addr = socket.local_addr()?;
        log::info!(
            "[Udp] bound {} processes={} threads={}",
            local_addr,
            config.processes,
            config.threads
        );

        let capacity = NonZeroUsize::new(UDP_DEDUP_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            pipeline,
            shutdown,
            metrics: Arc::new(UdpMetrics::default()),
            dedup: Arc::new(Mutex::new(LruCache::new(capacity))),
            workers: Mutex::new(Vec::new()),
            #[cfg(unix)]
            children: Mutex::new(Vec::new()),
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagram counters.
    pub fn metrics(&self) -> &Arc<UdpMetrics> {
        &self.metrics
    }

    /// Notification sender backed by this server's socket.
    pub fn sender(&self) -> Arc<UdpSender> {
        Arc::new(UdpSender {
            socket: Arc::clone(&self.socket),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Start the worker pool (forking first when configured).
    pub fn start(&self) {
        #[cfg(unix)]
        if self.config.processes > 1 {
            self.fork_workers();
        }
        self.spawn_worker_threads();
    }

    fn spawn_worker_threads(&self) {
        let mut workers = lock_recovering(&self.workers);
        for index in 0..self.config.threads.max(1) {
            let socket = Arc::clone(&self.socket);
            let pipeline = Arc::clone(&self.pipeline);
            let shutdown = self.shutdown.clone();
            let metrics = Arc::clone(&self.metrics);
            let dedup = Arc::clone(&self.dedup);
            let builder = thread::Builder::new().name(format!("takagi-udp-{}", index));
            match builder.spawn(move || {
                worker_loop(&socket, &pipeline, &shutdown, &metrics, &dedup);
            }) {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("[Udp] failed to spawn worker {}: {}", index, e),
            }
        }
    }

    // Fork happens before this process spawns its own dispatch threads;
    // each child re-creates its thread pool from scratch.
    #[cfg(unix)]
    fn fork_workers(&self) {
        let mut children = lock_recovering(&self.children);
        for _ in 1..self.config.processes {
            match unsafe { libc::fork() } {
                0 => {
                    // Child: serve until SIGTERM, then exit.
                    super::install_sigterm_handler();
                    self.spawn_worker_threads();
                    self.join_workers();
                    unsafe { libc::_exit(0) };
                }
                -1 => log::error!("[Udp] fork failed: {}", io::Error::last_os_error()),
                pid => {
                    log::info!("[Udp] worker process {} started", pid);
                    children.push(pid);
                }
            }
        }
    }

    fn join_workers(&self) {
        let workers = {
            let mut guard = lock_recovering(&self.workers);
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if handle.join().is_err() {
                log::debug!("[Udp] worker exited via panic");
            }
        }
    }

    /// Stop workers; TERM forked children with a grace window, then KILL.
    pub fn shutdown(&self) {
        self.shutdown.request();

        #[cfg(unix)]
        {
            let children = {
                let mut guard = lock_recovering(&self.children);
                std::mem::take(&mut *guard)
            };
            for pid in &children {
                unsafe { libc::kill(*pid, libc::SIGTERM) };
            }
            let deadline = Instant::now() + WORKER_TERM_GRACE;
            for pid in children {
                let mut status = 0;
                loop {
                    let done = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if done == pid || done == -1 {
                        break;
                    }
                    if Instant::now() >= deadline {
                        log::warn!("[Udp] worker process {} ignored SIGTERM, killing", pid);
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                        unsafe { libc::waitpid(pid, &mut status, 0) };
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }

        self.join_workers();
        log::info!("[Udp] server on {} stopped", self.local_addr);
    }
}

fn worker_loop(
    socket: &Arc<UdpSocket>,
    pipeline: &Arc<dyn RequestPipeline>,
    shutdown: &Shutdown,
    metrics: &Arc<UdpMetrics>,
    dedup: &Arc<Mutex<LruCache<(SocketAddr, u16), ()>>>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];

    while !(shutdown.requested() || super::sigint_received()) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                // Per-datagram failure; the worker keeps serving.
                log::warn!("[Udp] recv failed: {}", e);
                continue;
            }
        };
        metrics.received.fetch_add(1, Ordering::Relaxed);
        handle_datagram(&buf[..len], peer, socket, pipeline, metrics, dedup);
    }
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    pipeline: &Arc<dyn RequestPipeline>,
    metrics: &Arc<UdpMetrics>,
    dedup: &Arc<Mutex<LruCache<(SocketAddr, u16), ()>>>,
) {
    let message = match codec::udp::decode(datagram) {
        Ok(message) => message,
        Err(e) => {
            metrics.malformed.fetch_add(1, Ordering::Relaxed);
            log::warn!("[Udp] malformed datagram from {}: {}", peer, e);
            if let Some(message_id) = recover_message_id(datagram) {
                send_message(socket, peer, &Response::reset(message_id).into_message(), metrics);
            }
            return;
        }
    };

    match message.mtype {
        Some(MessageType::Rst) => {
            pipeline.reset(peer);
            return;
        }
        Some(MessageType::Ack) => return,
        _ => {}
    }

    if !c::is_request(message.code) {
        // Response or signaling codes have no business on a server socket.
        if let Some(message_id) = message.message_id {
            send_message(socket, peer, &Response::reset(message_id).into_message(), metrics);
        }
        return;
    }

    if let Some(message_id) = message.message_id {
        let duplicate = lock_recovering(dedup).put((peer, message_id), ()).is_some();
        if duplicate {
            metrics.duplicates.fetch_add(1, Ordering::Relaxed);
            log::debug!("[Udp] duplicate message-id {} from {}", message_id, peer);
            return;
        }
    }

    let response = pipeline.handle(Request::new(message, peer));
    send_message(socket, peer, &response, metrics);
}

// The RST must echo the message-id, which survives most decode failures:
// everything after the fixed header can be broken while bytes 2..4 are
// intact.
fn recover_message_id(datagram: &[u8]) -> Option<u16> {
    datagram
        .get(2..4)
        .map(|raw| u16::from_be_bytes([raw[0], raw[1]]))
}

fn send_message(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    message: &Message,
    metrics: &Arc<UdpMetrics>,
) {
    match codec::udp::encode(message) {
        Ok(wire) => match socket.send_to(&wire, peer) {
            Ok(_) => {
                metrics.responded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Udp] send to {} failed: {}", peer, e);
            }
        },
        Err(e) => log::error!("[Udp] response encode failed: {}", e),
    }
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[Udp] lock poisoned, recovering");
            e.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PongPipeline;

    impl RequestPipeline for PongPipeline {
        fn handle(&self, request: Request) -> Message {
            let mut response = Response::for_request(&request, c::CODE_CONTENT);
            response.set_content_format(c::FORMAT_JSON);
            response.set_payload(serde_json::to_vec(&json!({"message": "Pong"})).unwrap());
            response.into_message()
        }

        fn reset(&self, _peer: SocketAddr) {}
    }

    fn test_server() -> UdpServer {
        let config = UdpConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            processes: 1,
            threads: 2,
            reuse_port: false,
        };
        UdpServer::bind(config, Arc::new(PongPipeline), Shutdown::new()).unwrap()
    }

    fn request_wire(mtype: MessageType, message_id: u16) -> Vec<u8> {
        let mut msg = Message::udp(mtype, c::METHOD_GET, message_id, vec![0xAB]);
        msg.set_path("/ping");
        codec::udp::encode(&msg).unwrap()
    }

    #[test]
    fn test_con_request_gets_ack_response() {
        let server = test_server();
        server.start();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
            .send_to(&request_wire(MessageType::Con, 0x0101), server.local_addr())
            .unwrap();

        let mut buf = [0u8; 1500];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let response = codec::udp::decode(&buf[..len]).unwrap();

        assert_eq!(response.mtype, Some(MessageType::Ack));
        assert_eq!(response.message_id, Some(0x0101));
        assert_eq!(response.token, vec![0xAB]);
        assert_eq!(response.code, c::CODE_CONTENT);
        assert_eq!(response.payload, br#"{"message":"Pong"}"#);

        server.shutdown();
    }

    #[test]
    fn test_malformed_datagram_gets_rst() {
        let server = test_server();
        server.start();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        // Version bits 2, message-id 0x0202.
        client
            .send_to(&[0x80, 0x01, 0x02, 0x02], server.local_addr())
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let response = codec::udp::decode(&buf[..len]).unwrap();
        assert_eq!(response.mtype, Some(MessageType::Rst));
        assert_eq!(response.message_id, Some(0x0202));

        server.shutdown();
    }

    #[test]
    fn test_duplicate_message_id_is_absorbed() {
        let server = test_server();
        server.start();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let wire = request_wire(MessageType::Con, 0x7777);
        client.send_to(&wire, server.local_addr()).unwrap();

        let mut buf = [0u8; 1500];
        let _ = client.recv_from(&mut buf).unwrap();

        client.send_to(&wire, server.local_addr()).unwrap();
        assert!(client.recv_from(&mut buf).is_err());
        assert_eq!(server.metrics().duplicates(), 1);

        server.shutdown();
    }
}

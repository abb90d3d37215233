// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! TCP transport server (RFC 8323).
//!
//! A mio-polled accept loop (woken for shutdown via a `Waker`) spawns one
//! thread per connection. Each connection runs the RFC 8323 Sec.5.3
//! exchange: the client's first frame must be a CSM, answered with the
//! server CSM advertising Max-Message-Size and Block-Wise-Transfer.
//! After that, PING is answered with PONG (token echoed), RELEASE and
//! ABORT close the connection, and request codes are routed like UDP
//! requests but without type or message-id.
//!
//! Frame-level decode failures abort the one connection (ABORT frame,
//! then close); they never touch the accept loop.

use super::{RequestPipeline, Shutdown};
use crate::codec::{self, tcp::FrameError, FrameReader};
use crate::config::{
    CSM_MAX_MESSAGE_SIZE, TCP_JOIN_DEADLINE, TCP_POLL_TIMEOUT,
};
use crate::message::{Message, Request};
use crate::protocol::constants as c;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Token for the TCP listener.
const LISTENER_TOKEN: Token = Token(0);

/// Token for the shutdown waker.
const WAKER_TOKEN: Token = Token(1);

/// Idle sleep between reads on a quiet connection.
const CONNECTION_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Connection counters (relaxed; observability only).
#[derive(Debug, Default)]
pub struct TcpMetrics {
    accepted: AtomicU64,
    requests_routed: AtomicU64,
    signaling_frames: AtomicU64,
    aborts_sent: AtomicU64,
}

impl TcpMetrics {
    /// Connections accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Request frames routed through the pipeline.
    pub fn requests_routed(&self) -> u64 {
        self.requests_routed.load(Ordering::Relaxed)
    }

    /// Signaling frames handled (CSM/PING/PONG/RELEASE/ABORT).
    pub fn signaling_frames(&self) -> u64 {
        self.signaling_frames.load(Ordering::Relaxed)
    }

    /// ABORT frames sent before closing broken connections.
    pub fn aborts_sent(&self) -> u64 {
        self.aborts_sent.load(Ordering::Relaxed)
    }
}

/// The TCP server.
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    waker: Arc<Waker>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    metrics: Arc<TcpMetrics>,
}

impl TcpServer {
    /// Bind the listener and start the accept loop.
    pub fn bind(
        bind: SocketAddr,
        pipeline: Arc<dyn RequestPipeline>,
        shutdown: Shutdown,
    ) -> io::Result<Self> {
        let mut listener = TcpListener::bind(bind)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(TcpMetrics::default());

        let accept_shutdown = shutdown.clone();
        let accept_connections = Arc::clone(&connections);
        let accept_metrics = Arc::clone(&metrics);
        let builder = thread::Builder::new().name("takagi-tcp-accept".to_string());
        let handle = builder.spawn(move || {
            accept_loop(
                poll,
                listener,
                &pipeline,
                &accept_shutdown,
                &accept_connections,
                &accept_metrics,
            );
        })?;

        log::info!("[Tcp] bound {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            waker,
            accept_thread: Mutex::new(Some(handle)),
            connections,
            metrics,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection counters.
    pub fn metrics(&self) -> &Arc<TcpMetrics> {
        &self.metrics
    }

    /// Close the listener and join connection threads within the
    /// shutdown deadline.
    pub fn shutdown(&self) {
        self.shutdown.request();
        if let Err(e) = self.waker.wake() {
            log::debug!("[Tcp] waker failed at shutdown: {}", e);
        }

        let accept = {
            let mut slot = lock_recovering(&self.accept_thread);
            slot.take()
        };
        if let Some(handle) = accept {
            if handle.join().is_err() {
                log::debug!("[Tcp] accept loop exited via panic");
            }
        }

        let handles = {
            let mut guard = lock_recovering(&self.connections);
            std::mem::take(&mut *guard)
        };
        let deadline = Instant::now() + TCP_JOIN_DEADLINE;
        let mut abandoned = 0usize;
        for handle in handles {
            if Instant::now() >= deadline {
                abandoned += 1;
                drop(handle);
                continue;
            }
            if handle.join().is_err() {
                log::debug!("[Tcp] connection thread exited via panic");
            }
        }
        if abandoned > 0 {
            log::warn!("[Tcp] {} connection threads outlived the shutdown deadline", abandoned);
        }
        log::info!("[Tcp] server on {} stopped", self.local_addr);
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    pipeline: &Arc<dyn RequestPipeline>,
    shutdown: &Shutdown,
    connections: &Arc<Mutex<Vec<JoinHandle<()>>>>,
    metrics: &Arc<TcpMetrics>,
) {
    let mut events = Events::with_capacity(64);
    let mut connection_index: u64 = 0;

    while !(shutdown.requested() || super::sigint_received()) {
        if let Err(e) = poll.poll(&mut events, Some(TCP_POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[Tcp] poll failed: {}", e);
            break;
        }

        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                // Waker event: the loop condition is re-checked above.
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        metrics.accepted.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[Tcp] connection {} accepted from {}", connection_index, peer);
                        let pipeline = Arc::clone(pipeline);
                        let shutdown = shutdown.clone();
                        let metrics = Arc::clone(metrics);
                        let builder = thread::Builder::new()
                            .name(format!("takagi-tcp-conn-{}", connection_index));
                        connection_index += 1;
                        match builder.spawn(move || {
                            connection_loop(stream, peer, &pipeline, &shutdown, &metrics);
                        }) {
                            Ok(handle) => lock_recovering(connections).push(handle),
                            Err(e) => log::error!("[Tcp] failed to spawn connection thread: {}", e),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("[Tcp] accept failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

fn connection_loop(
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: &Arc<dyn RequestPipeline>,
    shutdown: &Shutdown,
    metrics: &Arc<TcpMetrics>,
) {
    let mut reader = FrameReader::with_default_max();
    let mut csm_seen = false;

    while !(shutdown.requested() || super::sigint_received()) {
        match reader.poll(&mut stream) {
            Ok(Some(message)) => {
                match handle_frame(&mut stream, peer, message, &mut csm_seen, pipeline, metrics) {
                    Flow::Continue => {}
                    Flow::Close => break,
                }
            }
            Ok(None) => thread::sleep(CONNECTION_IDLE_SLEEP),
            Err(FrameError::Closed) => {
                log::debug!("[Tcp] {} closed the connection", peer);
                break;
            }
            Err(e) => {
                log::warn!("[Tcp] connection to {} failed: {}", peer, e);
                send_abort(&mut stream, metrics);
                break;
            }
        }
    }

    pipeline.reset(peer);
    log::debug!("[Tcp] connection to {} finished", peer);
}

enum Flow {
    Continue,
    Close,
}

fn handle_frame(
    stream: &mut TcpStream,
    peer: SocketAddr,
    message: Message,
    csm_seen: &mut bool,
    pipeline: &Arc<dyn RequestPipeline>,
    metrics: &Arc<TcpMetrics>,
) -> Flow {
    if !*csm_seen {
        if message.code != c::SIGNAL_CSM {
            log::warn!("[Tcp] {} sent {:#04x} before CSM", peer, message.code);
            send_abort(stream, metrics);
            return Flow::Close;
        }
        *csm_seen = true;
        metrics.signaling_frames.fetch_add(1, Ordering::Relaxed);
        log::debug!("[Tcp] {} completed CSM handshake", peer);
        return match write_frame(stream, &server_csm()) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::warn!("[Tcp] CSM reply to {} failed: {}", peer, e);
                Flow::Close
            }
        };
    }

    match message.code {
        c::SIGNAL_CSM => {
            // Peer may refresh its capabilities at any time.
            metrics.signaling_frames.fetch_add(1, Ordering::Relaxed);
            Flow::Continue
        }
        c::SIGNAL_PING => {
            metrics.signaling_frames.fetch_add(1, Ordering::Relaxed);
            let pong = Message::tcp(c::SIGNAL_PONG, message.token.clone());
            match write_frame(stream, &pong) {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    log::warn!("[Tcp] PONG to {} failed: {}", peer, e);
                    Flow::Close
                }
            }
        }
        c::SIGNAL_PONG => {
            metrics.signaling_frames.fetch_add(1, Ordering::Relaxed);
            Flow::Continue
        }
        c::SIGNAL_RELEASE | c::SIGNAL_ABORT => {
            metrics.signaling_frames.fetch_add(1, Ordering::Relaxed);
            log::debug!("[Tcp] {} released the connection", peer);
            Flow::Close
        }
        code if c::is_request(code) => {
            metrics.requests_routed.fetch_add(1, Ordering::Relaxed);
            let response = pipeline.handle(Request::new(message, peer));
            match write_frame(stream, &response) {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    log::warn!("[Tcp] response to {} failed: {}", peer, e);
                    Flow::Close
                }
            }
        }
        code => {
            log::debug!("[Tcp] ignoring frame with code {:#04x} from {}", code, peer);
            Flow::Continue
        }
    }
}

/// Server CSM advertising Max-Message-Size and Block-Wise-Transfer
/// (zero-length uint, RFC 8323 Sec.5.3.1.2).
fn server_csm() -> Message {
    let mut csm = Message::tcp(c::SIGNAL_CSM, Vec::new());
    csm.options
        .insert_uint(c::CSM_OPT_MAX_MESSAGE_SIZE, CSM_MAX_MESSAGE_SIZE);
    csm.options.insert(c::CSM_OPT_BLOCK_WISE_TRANSFER, Vec::new());
    csm
}

fn send_abort(stream: &mut TcpStream, metrics: &Arc<TcpMetrics>) {
    let abort = Message::tcp(c::SIGNAL_ABORT, Vec::new());
    if write_frame(stream, &abort).is_ok() {
        metrics.aborts_sent.fetch_add(1, Ordering::Relaxed);
    }
}

fn write_frame(stream: &mut TcpStream, message: &Message) -> io::Result<()> {
    let wire = codec::tcp::encode(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    write_all_retrying(stream, &wire)
}

// Non-blocking stream: spin on WouldBlock with a short sleep instead of
// registering write interest, responses are small.
fn write_all_retrying(stream: &mut TcpStream, mut wire: &[u8]) -> io::Result<()> {
    while !wire.is_empty() {
        match stream.write(wire) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading")),
            Ok(n) => wire = &wire[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[Tcp] lock poisoned, recovering");
            e.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;
    use serde_json::json;
    use std::io::Read;

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

    fn client_csm() -> Message {
        Message::tcp(c::SIGNAL_CSM, Vec::new())
    }

    // Blocking client-side frame read with a timeout already set on the
    // stream.
    fn read_frame(reader: &mut FrameReader, stream: &mut std::net::TcpStream) -> Message {
        loop {
            match reader.poll(stream) {
                Ok(Some(message)) => return message,
                Ok(None) => continue,
                Err(e) => panic!("client read failed: {}", e),
            }
        }
    }

    fn connect(server: &TcpServer) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    #[test]
    fn test_csm_handshake_and_request_roundtrip() {
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PongPipeline),
            Shutdown::new(),
        )
        .unwrap();

        let mut stream = connect(&server);
        let mut reader = FrameReader::with_default_max();

        // Client CSM first, then the server CSM must be the first server
        // frame on the wire.
        stream
            .write_all(&codec::tcp::encode(&client_csm()).unwrap())
            .unwrap();
        let csm = read_frame(&mut reader, &mut stream);
        assert_eq!(csm.code, c::SIGNAL_CSM);
        assert_eq!(
            csm.options.first(c::CSM_OPT_MAX_MESSAGE_SIZE),
            Some(&[0x80, 0x01, 0x00][..])
        );
        assert_eq!(csm.options.first(c::CSM_OPT_BLOCK_WISE_TRANSFER), Some(&[][..]));

        // GET /ping routes like UDP but without type or message-id.
        let mut request = Message::tcp(c::METHOD_GET, vec![0x42]);
        request.set_path("/ping");
        stream
            .write_all(&codec::tcp::encode(&request).unwrap())
            .unwrap();
        let response = read_frame(&mut reader, &mut stream);
        assert_eq!(response.code, c::CODE_CONTENT);
        assert_eq!(response.token, vec![0x42]);
        assert!(response.mtype.is_none());
        assert_eq!(response.payload, br#"{"message":"Pong"}"#);

        // RELEASE closes the connection.
        let release = Message::tcp(c::SIGNAL_RELEASE, Vec::new());
        stream
            .write_all(&codec::tcp::encode(&release).unwrap())
            .unwrap();
        let mut probe = [0u8; 1];
        let closed = matches!(stream.read(&mut probe), Ok(0));
        assert!(closed, "connection should close after RELEASE");

        server.shutdown();
    }

    #[test]
    fn test_ping_pong_echoes_token() {
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PongPipeline),
            Shutdown::new(),
        )
        .unwrap();

        let mut stream = connect(&server);
        let mut reader = FrameReader::with_default_max();
        stream
            .write_all(&codec::tcp::encode(&client_csm()).unwrap())
            .unwrap();
        let _server_csm = read_frame(&mut reader, &mut stream);

        let ping = Message::tcp(c::SIGNAL_PING, vec![0xAA, 0xBB]);
        stream
            .write_all(&codec::tcp::encode(&ping).unwrap())
            .unwrap();
        let pong = read_frame(&mut reader, &mut stream);
        assert_eq!(pong.code, c::SIGNAL_PONG);
        assert_eq!(pong.token, vec![0xAA, 0xBB]);

        server.shutdown();
    }

    #[test]
    fn test_request_before_csm_aborts() {
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PongPipeline),
            Shutdown::new(),
        )
        .unwrap();

        let mut stream = connect(&server);
        let mut reader = FrameReader::with_default_max();
        let mut request = Message::tcp(c::METHOD_GET, vec![0x01]);
        request.set_path("/ping");
        stream
            .write_all(&codec::tcp::encode(&request).unwrap())
            .unwrap();

        let abort = read_frame(&mut reader, &mut stream);
        assert_eq!(abort.code, c::SIGNAL_ABORT);

        server.shutdown();
    }
}

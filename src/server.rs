// Request dispatcher.
//
// The dispatcher owns the well-known endpoint and only hands work off. Over datagrams every
// accepted request gets a freshly bound session socket (whose port becomes the server's half of
// the TID) and runs on its own task. Over streams every accepted connection is a session that
// serves requests one after another. A semaphore bounds how many sessions run at once; once it is
// exhausted the dispatcher stops receiving, so new requests queue in the OS socket buffers.
//
// Stopping flips a watch channel that every session's transfer engine listens to, so blocked
// receives return straight away. Sessions get a short grace period to clean up and are aborted
// after that.

use crate::config::{Framing, ServerConfig};
use crate::processor::TransferSummary;
use crate::srv_conn::{self, ServerRequestHandler, SessionError};
use crate::tftp::{self, Direction, ErrorCode, Packet, Request, TransferError};
use crate::transfer::TransferEngine;
use crate::transport::{self, DatagramTransport, StreamTransport, Transport};
use anyhow::{Context, Result};
use async_io::Async;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// How long sessions get to wind down after a stop before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

///////////////////////////////////////////////////////////////
// Session registry

/// What the server knows about one running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub direction: Direction,
    pub filename: String,
}

#[derive(Debug, Default)]
struct Sessions {
    next_id: u64,
    active: HashMap<u64, SessionInfo>,
}

/// Bookkeeping of running sessions. Holds no transfer state.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    /// Records a session until the returned guard is dropped.
    pub fn register(&self, peer: SocketAddr, request: &Request) -> SessionGuard {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.next_id += 1;
        let id = sessions.next_id;
        sessions.active.insert(
            id,
            SessionInfo {
                id,
                peer,
                direction: request.direction,
                filename: request.filename.clone(),
            },
        );
        SessionGuard { registry: self.clone(), id }
    }

    /// Whether `peer` already has a session for this transfer.
    pub fn is_active(&self, peer: SocketAddr, request: &Request) -> bool {
        let sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.active.values().any(|s| {
            s.peer == peer && s.direction == request.direction && s.filename == request.filename
        })
    }

    /// The running sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<SessionInfo> = sessions.active.values().cloned().collect();
        active.sort_by_key(|s| s.id);
        active
    }

    fn remove(&self, id: u64) {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.active.remove(&id);
    }
}

/// Keeps a session listed in its registry while alive.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    id: u64,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

///////////////////////////////////////////////////////////////
// Server

enum Listener {
    Datagram(Async<UdpSocket>),
    Stream(TcpListener),
}

/// A server bound to its well-known endpoint, not yet dispatching.
pub struct Server {
    config: ServerConfig,
    listener: Listener,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Server> {
        config.validate().context("Invalid server configuration")?;
        let listener = match config.framing {
            Framing::Datagram => Listener::Datagram(
                Async::<UdpSocket>::bind(config.bind)
                    .with_context(|| format!("Couldn't bind UDP socket on {}", config.bind))?,
            ),
            Framing::Stream => Listener::Stream(
                TcpListener::bind(config.bind)
                    .await
                    .with_context(|| format!("Couldn't bind TCP listener on {}", config.bind))?,
            ),
        };
        Ok(Server { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.listener {
            Listener::Datagram(sock) => sock.get_ref().local_addr()?,
            Listener::Stream(listener) => listener.local_addr()?,
        };
        Ok(addr)
    }

    /// Starts dispatching on a background task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = SessionRegistry::default();

        log::info!(
            "TFTP server listening on {local_addr} ({:?}), serving {}",
            self.config.framing,
            self.config.base_dir.display()
        );

        let dispatcher = Dispatcher {
            permits: Arc::new(Semaphore::new(self.config.max_sessions)),
            config: self.config,
            registry: registry.clone(),
            shutdown: shutdown_rx,
            sessions: JoinSet::new(),
        };
        let task = match self.listener {
            Listener::Datagram(sock) => tokio::spawn(dispatcher.run_datagram(sock)),
            Listener::Stream(listener) => tokio::spawn(dispatcher.run_stream(listener)),
        };

        Ok(ServerHandle { local_addr, shutdown, registry, task })
    }
}

/// Control over a running server. Dropping it stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    registry: SessionRegistry,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// Stops accepting, cancels every session, and returns once all of them are gone.
    pub async fn stop(self) -> Result<()> {
        log::info!("Stopping TFTP server on {}", self.local_addr);
        let _ = self.shutdown.send(true);
        self.task.await.context("Dispatcher task failed")?
    }
}

///////////////////////////////////////////////////////////////
// Dispatcher

struct Dispatcher {
    config: ServerConfig,
    registry: SessionRegistry,
    shutdown: watch::Receiver<bool>,
    sessions: JoinSet<()>,
    permits: Arc<Semaphore>,
}

/// What woke the dispatcher up.
enum Event<T> {
    Incoming(T),
    SessionEnded(Result<(), JoinError>),
    Stop,
}

impl Dispatcher {
    fn engine(&self) -> TransferEngine {
        TransferEngine::new(self.config.transfer.clone()).with_shutdown(self.shutdown.clone())
    }

    /// Waits for a free session slot, reaping finished sessions meanwhile.
    async fn session_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        loop {
            let event = tokio::select! {
                permit = self.permits.clone().acquire_owned() => Event::Incoming(permit.ok()),
                Some(ended) = self.sessions.join_next() => Event::SessionEnded(ended),
                _ = stop_signalled(&mut self.shutdown) => Event::Stop,
            };
            match event {
                Event::Incoming(permit) => return permit,
                Event::SessionEnded(ended) => reap(ended),
                Event::Stop => return None,
            }
        }
    }

    async fn run_datagram(mut self, sock: Async<UdpSocket>) -> Result<()> {
        let mut buf = vec![0_u8; tftp::MAX_DATAGRAM_SIZE];
        'dispatch: while let Some(permit) = self.session_slot().await {
            let (len, src) = loop {
                let event = tokio::select! {
                    received = sock.recv_from(&mut buf) => Event::Incoming(received),
                    Some(ended) = self.sessions.join_next() => Event::SessionEnded(ended),
                    _ = stop_signalled(&mut self.shutdown) => Event::Stop,
                };
                match event {
                    Event::Incoming(received) => break received.context("Well-known socket failed")?,
                    Event::SessionEnded(ended) => reap(ended),
                    Event::Stop => break 'dispatch,
                }
            };

            let request = match Packet::parse_from_buf(&buf[..len]) {
                Ok(Packet::Request(request)) => request,
                Ok(other) => {
                    log::warn!("Ignoring {:?} packet from {src} on the well-known port", other.opcode());
                    reply(&sock, src, Packet::Error {
                        code: ErrorCode::IllegalOperation,
                        message: "Unexpected packet type".to_string(),
                    })
                    .await;
                    continue;
                }
                Err(e) => {
                    log::warn!("Bad packet from {src}: {e}");
                    reply(&sock, src, Packet::Error {
                        code: ErrorCode::IllegalOperation,
                        message: format!("Error parsing incoming packet: {e}"),
                    })
                    .await;
                    continue;
                }
            };
            // A retransmitted request is answered by the session it already started.
            if self.registry.is_active(src, &request) {
                log::debug!("Ignoring repeated {:?} request from {src} for '{}'", request.direction, request.filename);
                continue;
            }
            log::info!("{src} requests {:?} of '{}' ({})", request.direction, request.filename, request.mode);

            if let Err(e) = srv_conn::validate_request(&request) {
                log::warn!("Refusing request from {src}: {e}");
                if let Some(packet) = e.reply() {
                    reply(&sock, src, packet).await;
                }
                continue;
            }

            let session_sock = match transport::bind_session_socket(
                self.config.bind.ip(),
                self.config.port_range.as_ref(),
            ) {
                Ok(sock) => sock,
                Err(e) => {
                    log::error!("Couldn't bind a session socket for {src}: {e}");
                    reply(&sock, src, Packet::Error {
                        code: ErrorCode::Undefined,
                        message: "Server couldn't open a transfer endpoint".to_string(),
                    })
                    .await;
                    continue;
                }
            };

            let transport = DatagramTransport::with_peer(session_sock, src);
            let guard = self.registry.register(src, &request);
            let handler = ServerRequestHandler::new(transport, request, &self.config.base_dir, self.engine());
            self.sessions.spawn(async move {
                let _permit = permit;
                log_outcome(guard.id(), src, handler.handle().await);
                drop(guard);
            });
        }

        self.drain().await;
        Ok(())
    }

    async fn run_stream(mut self, listener: TcpListener) -> Result<()> {
        'dispatch: while let Some(permit) = self.session_slot().await {
            let (stream, peer) = loop {
                let event = tokio::select! {
                    accepted = listener.accept() => Event::Incoming(accepted),
                    Some(ended) = self.sessions.join_next() => Event::SessionEnded(ended),
                    _ = stop_signalled(&mut self.shutdown) => Event::Stop,
                };
                match event {
                    Event::Incoming(Ok(accepted)) => break accepted,
                    // A connection that failed before being accepted only concerns that client.
                    Event::Incoming(Err(e)) => log::warn!("Couldn't accept connection: {e}"),
                    Event::SessionEnded(ended) => reap(ended),
                    Event::Stop => break 'dispatch,
                }
            };
            log::info!("Accepted connection from {peer}");

            let connection = Connection {
                base_dir: self.config.base_dir.clone(),
                idle_timeout: self.config.idle_timeout,
                engine: self.engine(),
                registry: self.registry.clone(),
                shutdown: self.shutdown.clone(),
            };
            self.sessions.spawn(async move {
                let _permit = permit;
                connection.serve(stream, peer).await;
            });
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        log::info!("Waiting for {} session(s) to stop", self.sessions.len());
        let sessions = &mut self.sessions;
        let finished = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(ended) = sessions.join_next().await {
                reap(ended);
            }
        })
        .await;
        if finished.is_err() {
            log::warn!("Aborting {} session(s) that didn't stop in time", self.sessions.len());
            self.sessions.shutdown().await;
        }
    }
}

/// One stream connection, serving its requests one at a time.
struct Connection {
    base_dir: PathBuf,
    idle_timeout: Duration,
    engine: TransferEngine,
    registry: SessionRegistry,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr) {
        let mut transport = StreamTransport::new(stream);
        loop {
            let received = tokio::select! {
                received = transport.recv_with_timeout(self.idle_timeout) => received,
                _ = stop_signalled(&mut self.shutdown) => break,
            };

            let request = match received {
                Ok(Packet::Request(request)) => request,
                Ok(other) => {
                    log::warn!("Expected a request from {peer}, got {:?}", other.opcode());
                    let unexpected = Packet::Error {
                        code: ErrorCode::IllegalOperation,
                        message: "Unexpected packet type".to_string(),
                    };
                    if transport.send(&unexpected).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(TransferError::Disconnected) => {
                    log::info!("{peer} closed the connection");
                    break;
                }
                Err(TransferError::RecvTimeout) => {
                    log::info!("Closing idle connection from {peer}");
                    break;
                }
                Err(TransferError::MalformedPacket(msg)) => {
                    log::warn!("Bad frame from {peer}: {msg}");
                    let _ = transport
                        .send(&Packet::Error {
                            code: ErrorCode::IllegalOperation,
                            message: format!("Error parsing incoming packet: {msg}"),
                        })
                        .await;
                    break;
                }
                Err(e) => {
                    log::warn!("Connection from {peer} failed: {e}");
                    break;
                }
            };
            log::info!("{peer} requests {:?} of '{}' ({})", request.direction, request.filename, request.mode);

            let guard = self.registry.register(peer, &request);
            let handler = ServerRequestHandler::new(&mut transport, request, &self.base_dir, self.engine.clone());
            let outcome = handler.handle().await;
            let keep_going = matches!(outcome, Ok(_) | Err(SessionError::Rejected { .. }));
            log_outcome(guard.id(), peer, outcome);
            if !keep_going {
                break;
            }
        }
    }
}

/// Replies on the well-known socket. Sent as a courtesy, we don't care how it goes.
async fn reply(sock: &Async<UdpSocket>, dst: SocketAddr, packet: Packet) {
    if let Err(e) = sock.send_to(&packet.to_bytes(), dst).await {
        log::debug!("Couldn't reply to {dst}: {e}");
    }
}

/// Resolves once a stop is requested or the handle that could request one is gone.
async fn stop_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn reap(ended: Result<(), JoinError>) {
    if let Err(e) = ended {
        if e.is_panic() {
            log::error!("Session task panicked: {e}");
        }
    }
}

fn log_outcome(id: u64, peer: SocketAddr, outcome: Result<TransferSummary, SessionError>) {
    match outcome {
        Ok(summary) => log::info!(
            "Session {id} with {peer} finished: {} bytes in {} blocks",
            summary.bytes,
            summary.blocks
        ),
        Err(SessionError::Rejected { code, message }) => {
            log::info!("Session {id} with {peer} refused with {code}: {message}")
        }
        Err(SessionError::Transfer(TransferError::Cancelled)) => {
            log::info!("Session {id} with {peer} cancelled")
        }
        Err(e) => log::warn!("Session {id} with {peer} failed: {e}"),
    }
}

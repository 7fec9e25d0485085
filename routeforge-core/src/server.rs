//! The connection server.
//!
//! A [`Server`] owns a [`Router`] and a set of listen endpoints. Starting it binds
//! the endpoints and launches one accept thread named `"{application_name}-accept"`.
//! Every accepted connection is served on its own tokio task, so a slow handler
//! never holds up the accept loop.
//!
//! ```text
//! Stopped ──start──► Starting ──► Running ──stop──► Stopping ──► Stopped
//!                                    │
//!                                    └── accept failed more than max_accept_restarts times ──► Faulted
//! ```
//!
//! When accepting fails the loop logs the error, waits `restart_backoff × n`
//! (where `n` counts the failures so far) and tries again. Once more than
//! `max_accept_restarts` failures have happened the loop exits for good and the
//! server is left [`ServerState::Faulted`].
//!
//! # Examples
//!
//! ```no_run
//! use routeforge_core::prelude::*;
//!
//! async fn hello() -> &'static str {
//!     "hello"
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let router = Router::new().get("/", handler(hello));
//!     let server = Server::new(router, ServerConfig::default())?;
//!     server.listen("http://127.0.0.1:8080/")?;
//!     server.start().await?;
//!     server.join().await;
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::select_all;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::ServerConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::router::Router;
use crate::verb::Verb;
use crate::websocket::upgrade::Upgraded;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Not accepting; endpoints may be added.
    Stopped = 0,
    /// Binding listeners.
    Starting = 1,
    /// Accepting connections.
    Running = 2,
    /// Shutting the accept loop down.
    Stopping = 3,
    /// The accept loop gave up after too many failures.
    Faulted = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Faulted,
            _ => Self::Stopped,
        }
    }
}

/// A source of inbound connections.
///
/// [`TcpAcceptor`] is the production implementation; anything that yields byte
/// streams can drive a server through [`Server::start_with`].
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// The connection type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next connection.
    async fn accept(&mut self) -> io::Result<(Self::Stream, Option<SocketAddr>)>;

    /// Addresses this acceptor is bound to.
    fn local_addrs(&self) -> Vec<SocketAddr> {
        Vec::new()
    }
}

/// Accepts TCP connections from one or more listeners.
pub struct TcpAcceptor {
    listeners: Vec<TcpListener>,
}

impl TcpAcceptor {
    /// Binds a listener for every endpoint.
    pub async fn bind(endpoints: &[Endpoint]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let listener = TcpListener::bind(endpoint.bind_address()).await?;
            debug!("Bound {} to {}", endpoint, listener.local_addr()?);
            listeners.push(listener);
        }
        Ok(Self { listeners })
    }

    /// Wraps already bound listeners.
    pub fn from_listeners(listeners: Vec<TcpListener>) -> Self {
        Self { listeners }
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, Option<SocketAddr>)> {
        if self.listeners.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no listeners bound"));
        }
        let pending = self
            .listeners
            .iter()
            .map(|listener| Box::pin(listener.accept()));
        let (accepted, _, _) = select_all(pending).await;
        let (stream, peer) = accepted?;
        Ok((stream, Some(peer)))
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }
}

struct Inner {
    router: Router,
    config: ServerConfig,
    prefixes: Mutex<Vec<Endpoint>>,
    state: AtomicU8,
    restarts: AtomicU32,
    shutdown: Notify,
    connections: DashMap<u64, AbortHandle>,
    next_connection: AtomicU64,
    local_addrs: Mutex<Vec<SocketAddr>>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Serves a [`Router`] on a set of listen endpoints.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Creates a stopped server.
    ///
    /// The prefixes in `config` are registered as if passed to [`Server::listen`].
    pub fn new(router: Router, config: ServerConfig) -> Result<Self> {
        let prefixes = config
            .prefixes
            .iter()
            .map(|prefix| Endpoint::parse(prefix))
            .collect::<Result<Vec<_>>>()?;
        let router = router.with_websocket_config(config.websocket.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                router,
                config,
                prefixes: Mutex::new(prefixes),
                state: AtomicU8::new(ServerState::Stopped as u8),
                restarts: AtomicU32::new(0),
                shutdown: Notify::new(),
                connections: DashMap::new(),
                next_connection: AtomicU64::new(0),
                local_addrs: Mutex::new(Vec::new()),
                accept_thread: Mutex::new(None),
            }),
        })
    }

    /// Adds a listen endpoint. Only allowed while stopped.
    pub fn listen(&self, endpoint: &str) -> Result<()> {
        let state = self.state();
        if state != ServerState::Stopped {
            return Err(Error::InvalidState(format!(
                "cannot add a listen endpoint while {:?}",
                state
            )));
        }
        let endpoint = Endpoint::parse(endpoint)?;
        debug!("Listening prefix {}", endpoint);
        self.inner.prefixes.lock().push(endpoint);
        Ok(())
    }

    /// Registered listen endpoints.
    pub fn prefixes(&self) -> Vec<Endpoint> {
        self.inner.prefixes.lock().clone()
    }

    /// Binds every endpoint and starts accepting.
    pub async fn start(&self) -> Result<()> {
        self.begin_start()?;

        let endpoints = self.prefixes();
        if endpoints.is_empty() {
            self.inner.set_state(ServerState::Stopped);
            return Err(Error::config("no listen endpoints registered"));
        }

        match TcpAcceptor::bind(&endpoints).await {
            Ok(acceptor) => self.launch(acceptor),
            Err(e) => {
                self.inner.set_state(ServerState::Stopped);
                Err(e)
            }
        }
    }

    /// Starts accepting from a caller supplied acceptor.
    pub fn start_with<A: Acceptor>(&self, acceptor: A) -> Result<()> {
        self.begin_start()?;
        self.launch(acceptor)
    }

    fn begin_start(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| {
                Error::InvalidState(format!(
                    "cannot start while {:?}",
                    ServerState::from_u8(current)
                ))
            })
    }

    fn launch<A: Acceptor>(&self, acceptor: A) -> Result<()> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.inner.set_state(ServerState::Stopped);
                return Err(Error::InvalidState(format!("no tokio runtime: {}", e)));
            }
        };

        let addrs = acceptor.local_addrs();
        self.inner.restarts.store(0, Ordering::Release);
        // stop() may have run while binding
        if let Err(current) = self.inner.state.compare_exchange(
            ServerState::Starting as u8,
            ServerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            drop(acceptor);
            self.inner.set_state(ServerState::Stopped);
            return Err(Error::InvalidState(format!(
                "server was {:?} before it could start accepting",
                ServerState::from_u8(current)
            )));
        }
        *self.inner.local_addrs.lock() = addrs.clone();

        let name = format!("{}-accept", self.inner.config.application_name);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let inner = self.inner.clone();

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                runtime.block_on(accept_loop(inner, acceptor));
            });
        });

        match spawned {
            Ok(handle) => {
                *self.inner.accept_thread.lock() = Some(handle);
                info!("Server {} accepting on {:?}", name, addrs);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ServerState::Stopped);
                Err(Error::Io(e))
            }
        }
    }

    /// Stops accepting. Connections already being served run to completion.
    pub fn stop(&self) {
        let inner = &self.inner;
        loop {
            let current = inner.state();
            let next = match current {
                ServerState::Running | ServerState::Starting => ServerState::Stopping,
                ServerState::Faulted => ServerState::Stopped,
                ServerState::Stopping | ServerState::Stopped => return,
            };
            if inner
                .state
                .compare_exchange(current as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            match current {
                ServerState::Running => {
                    inner.shutdown.notify_one();
                    info!("Server stopping");
                }
                // no accept loop yet; launch sees Stopping and backs out
                ServerState::Starting => info!("Server stopping before it started accepting"),
                _ => {}
            }
            return;
        }
    }

    /// Stops accepting and aborts every connection still being served.
    pub fn abort(&self) {
        self.stop();
        let mut aborted = 0;
        for entry in self.inner.connections.iter() {
            if !entry.value().is_finished() {
                entry.value().abort();
                aborted += 1;
            }
        }
        self.inner.connections.clear();
        warn!("Server aborted {} in-flight connection(s)", aborted);
    }

    /// Waits for the accept thread to exit.
    pub async fn join(&self) {
        let handle = self.inner.accept_thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Accept thread panicked"),
            Err(e) => error!("Failed to join accept thread: {}", e),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// Accept failures since the server started.
    pub fn restart_count(&self) -> u32 {
        self.inner.restarts.load(Ordering::Acquire)
    }

    /// Addresses the server is bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.local_addrs.lock().clone()
    }

    /// The router requests are dispatched to.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.inner.prune_connections();
        self.inner.connections.len()
    }
}

impl Inner {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    fn prune_connections(&self) {
        self.connections.retain(|_, handle| !handle.is_finished());
    }

    fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.prune_connections();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let task = tokio::spawn(async move {
            inner.serve_connection(stream, peer).await;
        });
        self.connections.insert(id, task.abort_handle());
    }

    fn apply_default_headers(&self, response: &Response) {
        for (name, value) in &self.config.default_headers {
            if let Err(e) = response.append_header(name, value) {
                warn!(header = %name, "Cannot apply default header: {}", e);
            }
        }
    }

    fn error_response(&self, status: StatusCode) -> Response {
        let response = Response::error(status);
        self.apply_default_headers(&response);
        response
    }

    async fn serve_connection<S>(self: Arc<Self>, mut stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limits = self.config.limits();
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            let mut request = match codec::read_request(&mut stream, &mut buf, &limits).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(Error::Io(e)) => {
                    debug!("Connection from {:?} failed while reading: {}", peer, e);
                    break;
                }
                Err(e) => {
                    warn!("Rejecting malformed request from {:?}: {}", peer, e);
                    let (status, headers, body) = self.error_response(e.status_code()).parts();
                    if let Err(e) =
                        codec::write_response(&mut stream, status, &headers, &body, false, false)
                            .await
                    {
                        debug!("Cannot answer malformed request: {}", e);
                    }
                    break;
                }
            };
            request.set_remote_addr(peer);

            let started = Instant::now();
            let method = request.method().clone();
            let path = request.path().to_string();
            let head_only = request.verb() == Verb::Head;
            let mut keep_alive = request.keep_alive();

            let response = Response::new();
            self.apply_default_headers(&response);

            let outcome = AssertUnwindSafe(self.router.process(request, &response))
                .catch_unwind()
                .await;
            let response = match outcome {
                Ok(Ok(())) => response,
                Ok(Err(e)) => {
                    error!(method = %method, path = %path, "Request failed: {:?}", e);
                    keep_alive = false;
                    self.error_response(e.status_code())
                }
                Err(panic) => {
                    error!(
                        method = %method,
                        path = %path,
                        "Handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                    keep_alive = false;
                    self.error_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };

            let (status, headers, body) = response.parts();

            if let Some(upgrade) = response.take_upgrade() {
                if let Err(e) =
                    codec::write_response(&mut stream, status, &headers, &body, false, true).await
                {
                    warn!("Cannot complete WebSocket handshake with {:?}: {}", peer, e);
                    return;
                }
                self.log_access(&method, &path, peer, status, started);
                if upgrade
                    .send(Upgraded::new(Box::new(stream), buf.to_vec()))
                    .is_err()
                {
                    debug!("Upgrade for {} was abandoned by its handler", path);
                }
                return;
            }

            if let Err(e) =
                codec::write_response(&mut stream, status, &headers, &body, head_only, keep_alive)
                    .await
            {
                debug!("Cannot write response to {:?}: {}", peer, e);
                break;
            }
            self.log_access(&method, &path, peer, status, started);

            if !keep_alive {
                break;
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!("Connection shutdown: {}", e);
        }
    }

    fn log_access(
        &self,
        method: &http::Method,
        path: &str,
        peer: Option<SocketAddr>,
        status: StatusCode,
        started: Instant,
    ) {
        if !self.config.access_log {
            return;
        }
        info!(
            method = %method,
            path = %path,
            peer = ?peer,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{} {} {}",
            method,
            path,
            status.as_u16()
        );
    }
}

async fn accept_loop<A: Acceptor>(inner: Arc<Inner>, mut acceptor: A) {
    while inner.is_running() {
        let accepted = tokio::select! {
            _ = inner.shutdown.notified() => break,
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {:?}", peer);
                inner.spawn_connection(stream, peer);
            }
            Err(e) => {
                if !inner.is_running() {
                    debug!("Accept interrupted by shutdown: {}", e);
                    break;
                }

                let restarts = inner.restarts.fetch_add(1, Ordering::AcqRel) + 1;
                error!(restarts, "{}", Error::AcceptLoop(e.to_string()));

                if restarts > inner.config.max_accept_restarts {
                    error!(
                        fatal = true,
                        restarts,
                        "{}; no further connections will be accepted",
                        Error::AcceptLoopExhausted(restarts)
                    );
                    inner.set_state(ServerState::Faulted);
                    break;
                }

                let backoff = inner.config.restart_backoff() * restarts;
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    drop(acceptor);
    // a permit left unconsumed would end the next run's loop at once
    let _ = inner.shutdown.notified().now_or_never();
    if inner.state() == ServerState::Stopping {
        inner.set_state(ServerState::Stopped);
    }
    info!("Accept loop exited");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

//! The graceful server.
//!
//! [`GracefulServer`] owns the outstanding-work counter, the dispatch gate
//! and the connection tracker, and runs the accept loop. Shutdown moves
//! through three states:
//!
//! ```text
//! Running --close()--> ShuttingDown --accept loop done, counter zero--> Drained
//! ```
//!
//! When shutdown starts, the gate closes first, then keep-alive is switched
//! off, then the listener is closed, which ends the accept loop.

use super::counter::WorkCounter;
use super::gate::DispatchGate;
use super::handler::Handler;
use super::{fcgi, http};
use crate::conn::{ConnSnapshot, ConnState, ConnStateObserver, ConnTracker, Connection};
use crate::listener::{
    self, DrainingListener, Incoming, ListenAddr, ListenerError, TlsAcceptor, TlsError, acceptor_from_config,
    load_acceptor,
};
use crate::util::{Signal, signal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_HTTP_ADDR: &str = ":80";
const DEFAULT_HTTPS_ADDR: &str = ":443";
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
const DRAIN_REPORT_INTERVAL: Duration = Duration::from_secs(5);

// errno values shared by Linux and the BSDs.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Errors returned by [`GracefulServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("accept loop failed: {0}")]
    Accept(io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signal(io::Error),

    #[error("server already drained")]
    Drained,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("server has no listener")]
    NotServing,
}

/// Shutdown state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    ShuttingDown,
    Drained,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting_down",
            ServerState::Drained => "drained",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    /// FastCGI on Unix sockets, HTTP otherwise.
    #[default]
    Auto,
    Http,
    FastCgi,
}

impl ServeMode {
    fn resolve(self, listener: &DrainingListener) -> ServeMode {
        match self {
            ServeMode::Auto if listener.is_unix() => ServeMode::FastCgi,
            ServeMode::Auto => ServeMode::Http,
            other => other,
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bind address used by the `listen_and_serve*` methods. Empty means
    /// `:80`, or `:443` with TLS.
    pub addr: String,
    pub mode: ServeMode,
    /// Reuse connections for several requests.
    pub keep_alive: bool,
    /// Keep-alive probing period on accepted TCP connections.
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: String::new(),
            mode: ServeMode::Auto,
            keep_alive: true,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
        }
    }
}

/// Everything needed to build a server besides the handler.
#[derive(Default)]
pub struct ServerOptions {
    pub settings: ServerSettings,
    /// Listener to use instead of binding `settings.addr`.
    pub listener: Option<DrainingListener>,
    /// Informational observer of connection state changes.
    pub observer: Option<Arc<dyn ConnStateObserver>>,
}

struct Inner {
    settings: ServerSettings,
    gate: DispatchGate,
    tracker: Arc<ConnTracker>,
    pending_listener: Mutex<Option<DrainingListener>>,
    listener: Mutex<Option<Arc<DrainingListener>>>,
    state: watch::Sender<ServerState>,
    keep_alives: watch::Sender<bool>,
    signal: Mutex<Option<Signal>>,
    serving: AtomicBool,
    next_conn_id: AtomicU64,
}

/// An HTTP/FastCGI server that can stop accepting and wait for in-flight
/// work to finish.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct GracefulServer {
    inner: Arc<Inner>,
}

impl GracefulServer {
    pub fn new(handler: impl Handler) -> Self {
        Self::with_options(handler, ServerOptions::default())
    }

    pub fn with_settings(handler: impl Handler, settings: ServerSettings) -> Self {
        Self::with_options(
            handler,
            ServerOptions {
                settings,
                ..Default::default()
            },
        )
    }

    pub fn with_options(handler: impl Handler, options: ServerOptions) -> Self {
        let gate = DispatchGate::new(Arc::new(handler));
        let tracker = Arc::new(ConnTracker::new(Arc::new(WorkCounter::new()), gate.clone()));
        if let Some(observer) = options.observer {
            tracker.add_observer(observer);
        }

        let pending_listener = options
            .listener
            .map(|l| l.with_tcp_keepalive(options.settings.tcp_keepalive));
        let (state, _) = watch::channel(ServerState::Running);
        let (keep_alives, _) = watch::channel(options.settings.keep_alive);

        Self {
            inner: Arc::new(Inner {
                settings: options.settings,
                gate,
                tracker,
                pending_listener: Mutex::new(pending_listener),
                listener: Mutex::new(None),
                state,
                keep_alives,
                signal: Mutex::new(None),
                serving: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Begin shutting down. Returns true for the call that started it.
    pub fn close(&self) -> bool {
        let first = self.inner.state.send_if_modified(|state| {
            if *state == ServerState::Running {
                *state = ServerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if first {
            info!(
                addr = %self.inner.settings.addr,
                signal = self.signal_received().map(|s| s.as_str()),
                "shutdown requested"
            );
        }
        first
    }

    /// [`close`](Self::close), then wait until the server is drained.
    ///
    /// Never returns for a server that is not serving.
    pub async fn blocking_close(&self) -> bool {
        let first = self.close();
        self.drained().await;
        first
    }

    /// Resolves once shutdown has started.
    pub async fn shutting_down(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s != ServerState::Running).await;
    }

    /// Resolves once the server is drained.
    pub async fn drained(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Drained).await;
    }

    /// Count work that is not tied to a connection, such as a task spawned
    /// by a handler. Shutdown waits for the matching
    /// [`finish_routine`](Self::finish_routine).
    pub fn start_routine(&self) {
        self.inner.tracker.counter().add();
    }

    pub fn finish_routine(&self) {
        self.inner.tracker.counter().done();
    }

    /// Units of work shutdown is still waiting for.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.counter().count()
    }

    /// Live connections, ordered by id.
    pub fn connection_states(&self) -> Vec<ConnSnapshot> {
        self.inner.tracker.registry().snapshot()
    }

    /// Allow or forbid connection reuse. Turning it off makes live
    /// connections close after their current exchange.
    pub fn set_keep_alives_enabled(&self, enabled: bool) {
        self.inner.keep_alives.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    /// Add an observer of connection state changes. It runs after those
    /// already installed.
    pub fn add_observer(&self, observer: Arc<dyn ConnStateObserver>) {
        self.inner.tracker.add_observer(observer);
    }

    /// Signal that triggered shutdown, if one did.
    pub fn signal_received(&self) -> Option<Signal> {
        *self.inner.signal.lock()
    }

    /// Address of the listener this server serves or will serve on.
    pub fn local_addr(&self) -> Option<ListenAddr> {
        if let Some(listener) = self.inner.listener.lock().as_ref() {
            return listener.local_addr().cloned();
        }
        self.inner
            .pending_listener
            .lock()
            .as_ref()
            .and_then(|l| l.local_addr().cloned())
    }

    /// Raw descriptor of the listening socket, for hand-off tooling.
    pub fn listener_fd(&self) -> Result<RawFd, ServerError> {
        if let Some(listener) = self.inner.listener.lock().as_ref() {
            return Ok(listener.descriptor()?);
        }
        match self.inner.pending_listener.lock().as_ref() {
            Some(listener) => Ok(listener.descriptor()?),
            None => Err(ServerError::NotServing),
        }
    }

    /// Build a second server accepting on a duplicate of this server's
    /// listening socket, optionally wrapped in TLS.
    ///
    /// The successor can start serving before this server finishes
    /// draining; the two sockets are independent.
    pub fn hijack_listener(
        &self,
        handler: impl Handler,
        tls: Option<TlsAcceptor>,
    ) -> Result<GracefulServer, ServerError> {
        let listener = self
            .inner
            .listener
            .lock()
            .clone()
            .ok_or(ServerError::NotServing)?;

        let mut transport = listener.try_clone_transport()?;
        if let Some(acceptor) = tls {
            transport = transport.with_tls(acceptor).map_err(ListenerError::Clone)?;
        }
        let successor = DrainingListener::new(transport);
        info!(addr = ?successor.local_addr(), "listener handed off");

        Ok(GracefulServer::with_options(
            handler,
            ServerOptions {
                settings: self.inner.settings.clone(),
                listener: Some(successor),
                observer: None,
            },
        ))
    }

    /// Close the server when one of `signals` arrives (the default set when
    /// empty). The signal is available afterwards from
    /// [`signal_received`](Self::signal_received).
    pub fn close_on_interrupt(&self, signals: &[Signal]) -> io::Result<()> {
        let signals = if signals.is_empty() { Signal::DEFAULT } else { signals };
        let received = signal::listen(signals)?;
        let server = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                Some(sig) = received => {
                    if let Some(inner) = server.upgrade() {
                        info!(signal = %sig, "signal received");
                        *inner.signal.lock() = Some(sig);
                        GracefulServer { inner }.close();
                    }
                }
                _ = state.wait_for(|s| *s == ServerState::Drained) => {}
            }
        });
        Ok(())
    }

    /// Serve on the listener given at construction, or bind
    /// [`ServerSettings::addr`].
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let listener = match self.take_pending_listener() {
            Some(listener) => listener,
            None => self.bind(DEFAULT_HTTP_ADDR, None).await?,
        };
        self.serve(listener).await
    }

    /// Like [`listen_and_serve`](Self::listen_and_serve), wrapping the bound
    /// socket in TLS with the given PEM certificate chain and key.
    pub async fn listen_and_serve_tls(&self, cert: &Path, key: &Path) -> Result<(), ServerError> {
        let acceptor = load_acceptor(cert, key)?;
        self.listen_and_serve_tls_with_acceptor(acceptor).await
    }

    /// Like [`listen_and_serve_tls`](Self::listen_and_serve_tls) with a
    /// prepared rustls configuration.
    pub async fn listen_and_serve_tls_with_config(
        &self,
        config: tokio_rustls::rustls::ServerConfig,
    ) -> Result<(), ServerError> {
        self.listen_and_serve_tls_with_acceptor(acceptor_from_config(config))
            .await
    }

    async fn listen_and_serve_tls_with_acceptor(&self, acceptor: TlsAcceptor) -> Result<(), ServerError> {
        // A listener supplied at construction is served as it is.
        let listener = match self.take_pending_listener() {
            Some(listener) => listener,
            None => self.bind(DEFAULT_HTTPS_ADDR, Some(acceptor)).await?,
        };
        self.serve(listener).await
    }

    fn take_pending_listener(&self) -> Option<DrainingListener> {
        self.inner.pending_listener.lock().take()
    }

    async fn bind(&self, default_addr: &str, tls: Option<TlsAcceptor>) -> Result<DrainingListener, ServerError> {
        let addr = match self.inner.settings.addr.as_str() {
            "" => default_addr,
            addr => addr,
        };

        let mut bound = listener::listen(addr).await?;
        if let Some(acceptor) = tls {
            bound = bound.with_tls(acceptor).map_err(|source| ListenerError::Bind {
                target: addr.to_string(),
                source,
            })?;
        }
        Ok(DrainingListener::new(bound).with_tcp_keepalive(self.inner.settings.tcp_keepalive))
    }

    /// Accept and serve connections until shutdown, then wait for every
    /// protected connection and routine to finish.
    ///
    /// The intentional close of the listener is not reported as an error.
    /// Any other accept failure is returned, after draining.
    #[instrument(skip_all, name = "serve")]
    pub async fn serve(&self, listener: impl Into<DrainingListener>) -> Result<(), ServerError> {
        if self.state() == ServerState::Drained {
            return Err(ServerError::Drained);
        }
        if self.inner.serving.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyServing);
        }

        let listener = Arc::new(listener.into());
        *self.inner.listener.lock() = Some(Arc::clone(&listener));
        let mode = self.inner.settings.mode.resolve(&listener);
        info!(addr = ?listener.local_addr(), mode = ?mode, "serving");

        let mut state = self.inner.state.subscribe();
        if *state.borrow_and_update() == ServerState::Running {
            let inner = Arc::downgrade(&self.inner);
            let listener = Arc::clone(&listener);
            tokio::spawn(async move {
                if state.wait_for(|s| *s != ServerState::Running).await.is_ok() {
                    begin_drain(&inner, &listener);
                }
            });
        } else {
            begin_drain(&Arc::downgrade(&self.inner), &listener);
        }

        let result = self.accept_loop(&listener, mode).await;
        match &result {
            Ok(()) => info!("accept loop stopped"),
            Err(e) => {
                error!(error = %e, "accept loop failed");
                self.close();
            }
        }

        self.wait_for_drain().await;
        self.inner.state.send_replace(ServerState::Drained);
        info!("server drained");
        result
    }

    async fn accept_loop(&self, listener: &DrainingListener, mode: ServeMode) -> Result<(), ServerError> {
        accept_until_closed(|| listener.accept(), |incoming| self.spawn_connection(incoming, mode)).await
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn spawn_connection(&self, incoming: Incoming, mode: ServeMode) {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, incoming.peer().clone()));
        let tracker = Arc::clone(&self.inner.tracker);
        let gate = self.inner.gate.clone();
        let keep_alives = self.inner.keep_alives.subscribe();

        // Counted before the task exists, so a drain that starts now still
        // waits for this connection.
        tracker.on_state_change(&conn, ConnState::New);
        debug!(conn = id, peer = %conn.info().peer, "connection accepted");

        tokio::spawn(async move {
            match incoming.establish().await {
                Ok(stream) => match mode {
                    ServeMode::FastCgi => {
                        fcgi::serve_connection(stream, Arc::clone(&conn), Arc::clone(&tracker), gate, keep_alives)
                            .await
                    }
                    ServeMode::Http | ServeMode::Auto => {
                        http::serve_connection(stream, Arc::clone(&conn), Arc::clone(&tracker), gate, keep_alives)
                            .await
                    }
                },
                Err(e) => debug!(conn = id, error = %e, "connection setup failed"),
            }

            let last = if conn.is_upgraded() {
                ConnState::Hijacked
            } else {
                ConnState::Closed
            };
            tracker.on_state_change(&conn, last);
        });
    }

    async fn wait_for_drain(&self) {
        let counter = self.inner.tracker.counter();
        let outstanding = counter.count();
        if outstanding > 0 {
            info!(outstanding, "waiting for in-flight work");
        }

        let mut drained = pin!(counter.wait());
        loop {
            tokio::select! {
                _ = &mut drained => return,
                _ = tokio::time::sleep(DRAIN_REPORT_INTERVAL) => {
                    info!(
                        outstanding = counter.count(),
                        connections = ?self.inner.tracker.registry().protected_ids(),
                        "still waiting for in-flight work"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for GracefulServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulServer")
            .field("addr", &self.inner.settings.addr)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Gate, then keep-alive, then listener.
fn begin_drain(inner: &Weak<Inner>, listener: &DrainingListener) {
    if let Some(inner) = inner.upgrade() {
        if inner.gate.close() {
            debug!("dispatch gate closed");
        }
        inner.keep_alives.send_replace(false);
    }
    listener.close();
}

/// Hand every accepted connection to `serve` until the listener is closed.
/// Errors a retry can clear are logged and retried after a growing delay.
async fn accept_until_closed<T, A, F>(mut accept: A, mut serve: impl FnMut(T)) -> Result<(), ServerError>
where
    A: FnMut() -> F,
    F: Future<Output = Result<T, ListenerError>>,
{
    let mut backoff = AcceptBackoff::default();
    loop {
        match accept().await {
            Ok(incoming) => {
                backoff.reset();
                serve(incoming);
            }
            Err(ListenerError::AlreadyClosed) => return Ok(()),
            Err(ListenerError::Io(e)) if is_transient_accept_error(&e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "accept error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(ListenerError::Io(e)) => return Err(ServerError::Accept(e)),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Doubling delay between failed accepts, capped, reset by a success.
#[derive(Debug, Default)]
struct AcceptBackoff {
    last: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .last
            .map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
        self.last = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

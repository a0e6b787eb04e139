//! Process-wide default server behind the crate-level free functions.
//!
//! One default server runs at a time. Signals are only handled if
//! [`close_on_interrupt`] was called before serving starts.

use super::graceful::{GracefulServer, ServerError, ServerSettings};
use super::handler::Handler;
use crate::listener::DrainingListener;
use crate::util::Signal;
use parking_lot::{Mutex, const_mutex};
use std::path::Path;
use tracing::debug;

struct DefaultServer {
    server: Option<GracefulServer>,
    /// The server most recently removed from `server`.
    last: Option<GracefulServer>,
    signals: Option<Vec<Signal>>,
}

static DEFAULT: Mutex<DefaultServer> = const_mutex(DefaultServer {
    server: None,
    last: None,
    signals: None,
});

/// Bind `addr` and serve `handler` on the default server until it is
/// drained. Stop it with [`close`].
pub async fn listen_and_serve(addr: &str, handler: impl Handler) -> Result<(), ServerError> {
    let (server, _slot) = install(GracefulServer::with_settings(handler, settings(addr)))?;
    server.listen_and_serve().await
}

/// Like [`listen_and_serve`] over TLS with a PEM certificate chain and key.
pub async fn listen_and_serve_tls(
    addr: &str,
    cert: &Path,
    key: &Path,
    handler: impl Handler,
) -> Result<(), ServerError> {
    let (server, _slot) = install(GracefulServer::with_settings(handler, settings(addr)))?;
    server.listen_and_serve_tls(cert, key).await
}

/// Serve `handler` on an existing listener with the default server.
pub async fn serve(listener: impl Into<DrainingListener>, handler: impl Handler) -> Result<(), ServerError> {
    let (server, _slot) = install(GracefulServer::new(handler))?;
    server.serve(listener).await
}

/// Start shutting down the default server. Returns true if one was running
/// and this call closed it.
pub fn close() -> bool {
    let server = {
        let mut default = DEFAULT.lock();
        let server = default.server.take();
        if server.is_some() {
            default.last = server.clone();
        }
        server
    };
    server.is_some_and(|server| server.close())
}

/// Have default servers started from now on close when one of `signals`
/// arrives (the default set when empty).
pub fn close_on_interrupt(signals: &[Signal]) {
    DEFAULT.lock().signals = Some(signals.to_vec());
}

/// The signal that closed the running or most recent default server.
pub fn signal_received() -> Option<Signal> {
    let default = DEFAULT.lock();
    default
        .server
        .as_ref()
        .or(default.last.as_ref())
        .and_then(GracefulServer::signal_received)
}

/// A handle to the running default server.
pub fn default_server() -> Option<GracefulServer> {
    DEFAULT.lock().server.clone()
}

fn settings(addr: &str) -> ServerSettings {
    ServerSettings {
        addr: addr.to_string(),
        ..Default::default()
    }
}

fn install(server: GracefulServer) -> Result<(GracefulServer, Slot), ServerError> {
    let mut default = DEFAULT.lock();
    if default.server.is_some() {
        return Err(ServerError::AlreadyServing);
    }
    if let Some(signals) = &default.signals {
        server.close_on_interrupt(signals).map_err(ServerError::Signal)?;
    }
    default.server = Some(server.clone());
    debug!("default server installed");
    Ok((server.clone(), Slot(server)))
}

/// Frees the default slot when serving returns, unless [`close`] already
/// did or another server has taken it since.
struct Slot(GracefulServer);

impl Drop for Slot {
    fn drop(&mut self) {
        let mut default = DEFAULT.lock();
        if default.server.as_ref().is_some_and(|s| s.ptr_eq(&self.0)) {
            default.last = default.server.take();
        }
    }
}

//! Listening sockets.
//!
//! This module binds TCP and Unix domain sockets, optionally wraps TCP in
//! TLS, and provides the [`DrainingListener`] that stops handing out new
//! connections on close without touching the ones already accepted.

mod bind;
mod draining;
mod kind;
mod tls;

pub use bind::{BindTarget, is_unix_address, listen, listen_tcp, listen_unix, remove_stale_socket};
pub use draining::DrainingListener;
pub use kind::{Incoming, ListenAddr, Listener, PeerAddr, Stream};
pub use tls::{TlsAcceptor, TlsError, acceptor_from_config, load_acceptor};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while binding, accepting on, or duplicating a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was closed on purpose. Not a fault.
    #[error("listener already closed")]
    AlreadyClosed,

    #[error("error while parsing bind address '{0}'")]
    InvalidBind(String),

    #[error("failed to remove stale unix socket {}: {source}", path.display())]
    StaleSocket { path: PathBuf, source: io::Error },

    #[error("failed to bind {target}: {source}")]
    Bind { target: String, source: io::Error },

    #[error("failed to duplicate listening socket: {0}")]
    Clone(io::Error),

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Whether this is the intentional-shutdown condition.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, ListenerError::AlreadyClosed)
    }
}

//! Connection states and the per-connection record.

use crate::listener::PeerAddr;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Lifecycle state of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted, nothing read yet.
    New,
    /// A request is being read or served.
    Active,
    /// Between requests on a persistent connection.
    Idle,
    /// Gone.
    Closed,
    /// Handed over to the application (protocol upgrade).
    Hijacked,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Closed => "closed",
            ConnState::Hijacked => "hijacked",
        }
    }

    /// Closed and Hijacked are final: the server no longer owns the
    /// connection afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Hijacked)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub id: u64,
    pub peer: PeerAddr,
}

/// Bookkeeping the tracker keeps for one connection.
///
/// `protected` is true exactly while the connection holds one unit of the
/// outstanding-work counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRecord {
    pub state: ConnState,
    pub protected: bool,
}

impl Default for ConnRecord {
    fn default() -> Self {
        Self {
            state: ConnState::New,
            protected: false,
        }
    }
}

/// Shared handle on a live connection.
///
/// Held by the accept loop, the task serving the connection, and any
/// response body still in flight.
pub struct Connection {
    info: ConnInfo,
    record: Mutex<ConnRecord>,
    close_requested: AtomicBool,
    close_notify: Notify,
    upgraded: AtomicBool,
}

impl Connection {
    pub fn new(id: u64, peer: PeerAddr) -> Self {
        Self {
            info: ConnInfo { id, peer },
            record: Mutex::new(ConnRecord::default()),
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
            upgraded: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    /// Current record.
    pub fn record(&self) -> ConnRecord {
        *self.record.lock()
    }

    /// Run `f` with the record locked. Transitions of one connection are
    /// serialized through this lock.
    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut ConnRecord) -> R) -> R {
        f(&mut self.record.lock())
    }

    /// Ask the serving task to drop the connection immediately.
    pub fn force_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_one();
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Resolves once [`force_close`](Self::force_close) has been called.
    pub async fn close_requested(&self) {
        if self.is_close_requested() {
            return;
        }
        self.close_notify.notified().await;
    }

    /// Record that the application took over the connection.
    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.info.id)
            .field("peer", &self.info.peer)
            .field("record", &self.record())
            .finish()
    }
}

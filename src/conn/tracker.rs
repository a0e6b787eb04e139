//! Connection state tracker.
//!
//! Converts raw lifecycle notifications into protected/unprotected
//! transitions against the outstanding-work counter. A persistent connection
//! goes New, Active, Idle, Active, Idle, ... Closed; only the first entry
//! into a working period increments and every exit from one decrements, so
//! the counter equals the number of connections currently doing work no
//! matter how many keep-alive cycles happen.

use super::{ConnRecord, ConnRegistry, ConnState, ConnStateObserver, Connection, ObserverChain};
use crate::server::{DispatchGate, WorkCounter};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// What a state change did to the connection's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Became protected; one unit added to the counter.
    Protect,
    /// Stopped being protected; one unit removed from the counter.
    Release,
    /// Work arrived after shutdown began; the connection must be dropped.
    ForceClose,
    /// No change to the accounting.
    Unchanged,
}

impl ConnRecord {
    /// Apply a new state to the record and report the accounting effect.
    ///
    /// | next                  | condition           | effect     |
    /// |-----------------------|---------------------|------------|
    /// | New                   |                     | Protect    |
    /// | Active                | gate closed         | ForceClose |
    /// | Active                | not protected       | Protect    |
    /// | Active                | protected           | Unchanged  |
    /// | Idle/Closed/Hijacked  | protected           | Release    |
    /// | Idle/Closed/Hijacked  | not protected       | Unchanged  |
    pub fn apply(&mut self, next: ConnState, gate_closed: bool) -> Transition {
        self.state = next;
        match next {
            ConnState::Active if gate_closed => Transition::ForceClose,
            ConnState::New | ConnState::Active => {
                if self.protected {
                    Transition::Unchanged
                } else {
                    self.protected = true;
                    Transition::Protect
                }
            }
            ConnState::Idle | ConnState::Closed | ConnState::Hijacked => {
                if self.protected {
                    self.protected = false;
                    Transition::Release
                } else {
                    Transition::Unchanged
                }
            }
        }
    }
}

/// The lifecycle hook installed on every accepted connection.
pub struct ConnTracker {
    counter: Arc<WorkCounter>,
    gate: DispatchGate,
    registry: ConnRegistry,
    observers: RwLock<ObserverChain>,
}

impl ConnTracker {
    pub fn new(counter: Arc<WorkCounter>, gate: DispatchGate) -> Self {
        Self {
            counter,
            gate,
            registry: ConnRegistry::new(),
            observers: RwLock::new(ObserverChain::new()),
        }
    }

    /// Append an observer. Existing observers keep running, in front of it.
    pub fn add_observer(&self, observer: Arc<dyn ConnStateObserver>) {
        self.observers.write().push(observer);
    }

    pub fn counter(&self) -> &Arc<WorkCounter> {
        &self.counter
    }

    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }

    /// Record that `conn` moved to `next`.
    ///
    /// Calls for one connection must not overlap; the serving loops
    /// guarantee that.
    pub fn on_state_change(&self, conn: &Arc<Connection>, next: ConnState) -> Transition {
        let gate_closed = self.gate.is_closed();

        let (previous, transition) = conn.with_record(|record| {
            let previous = record.state;
            let transition = record.apply(next, gate_closed);
            match transition {
                Transition::Protect => self.counter.add(),
                Transition::Release => self.counter.done(),
                Transition::ForceClose | Transition::Unchanged => {}
            }
            (previous, transition)
        });

        if transition == Transition::ForceClose {
            debug!(conn = conn.id(), peer = %conn.info().peer, "request after shutdown, closing connection");
            conn.force_close();
        }

        match next {
            ConnState::New => self.registry.insert(Arc::clone(conn)),
            ConnState::Closed | ConnState::Hijacked => {
                self.registry.remove(conn.id());
            }
            ConnState::Active | ConnState::Idle => {}
        }

        trace!(
            conn = conn.id(),
            from = %previous,
            to = %next,
            transition = ?transition,
            outstanding = self.counter.count(),
            "connection state change"
        );

        self.observers.read().notify(conn.info(), previous, next);
        transition
    }
}

impl std::fmt::Debug for ConnTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTracker")
            .field("outstanding", &self.counter.count())
            .field("connections", &self.registry.len())
            .finish()
    }
}

//! Informational observers of connection state changes.

use super::{ConnInfo, ConnState};
use std::fmt;
use std::sync::Arc;

/// Receives every connection transition after the tracker has done its own
/// bookkeeping. Observers cannot influence the tracker.
pub trait ConnStateObserver: Send + Sync + 'static {
    fn on_state_change(&self, conn: &ConnInfo, previous: ConnState, next: ConnState);
}

impl<F> ConnStateObserver for F
where
    F: Fn(&ConnInfo, ConnState, ConnState) + Send + Sync + 'static,
{
    fn on_state_change(&self, conn: &ConnInfo, previous: ConnState, next: ConnState) {
        self(conn, previous, next)
    }
}

/// Ordered list of observers, invoked first to last.
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn ConnStateObserver>>,
}

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer to the end of the chain.
    pub fn push(&mut self, observer: Arc<dyn ConnStateObserver>) {
        self.observers.push(observer);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, observer: Arc<dyn ConnStateObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, conn: &ConnInfo, previous: ConnState, next: ConnState) {
        for observer in &self.observers {
            observer.on_state_change(conn, previous, next);
        }
    }
}

impl fmt::Debug for ObserverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverChain")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PeerAddr;
    use parking_lot::Mutex;

    #[test]
    fn test_observers_run_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let calls = Arc::clone(&calls);
            move |_: &ConnInfo, _: ConnState, next: ConnState| calls.lock().push(("first", next))
        };
        let second = {
            let calls = Arc::clone(&calls);
            move |_: &ConnInfo, _: ConnState, next: ConnState| calls.lock().push(("second", next))
        };

        let chain = ObserverChain::new()
            .with(Arc::new(first))
            .with(Arc::new(second));
        assert_eq!(chain.len(), 2);

        let info = ConnInfo {
            id: 1,
            peer: PeerAddr::Unix,
        };
        chain.notify(&info, ConnState::New, ConnState::Active);

        assert_eq!(
            *calls.lock(),
            vec![("first", ConnState::Active), ("second", ConnState::Active)]
        );
    }

    #[test]
    fn test_empty_chain_is_noop() {
        let chain = ObserverChain::default();
        assert!(chain.is_empty());
        let info = ConnInfo {
            id: 1,
            peer: PeerAddr::Unix,
        };
        chain.notify(&info, ConnState::Idle, ConnState::Closed);
    }
}

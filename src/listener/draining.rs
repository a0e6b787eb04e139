//! Listener that can stop accepting without disturbing accepted connections.

use super::{Incoming, ListenAddr, Listener, ListenerError};
use parking_lot::Mutex;
use std::future::poll_fn;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Wraps a [`Listener`] with an atomic closed flag.
///
/// Once closed, [`accept`](Self::accept) returns
/// [`ListenerError::AlreadyClosed`] instead of a connection, including for
/// callers that were already waiting. The underlying socket is released on
/// close; connections accepted earlier are independent and keep running.
pub struct DrainingListener {
    inner: Mutex<Option<Listener>>,
    closed: AtomicBool,
    close_notify: Notify,
    local_addr: Option<ListenAddr>,
    tcp_keepalive: Option<Duration>,
}

impl DrainingListener {
    /// Wrap a bound listener.
    pub fn new(listener: Listener) -> Self {
        let local_addr = listener.local_addr().ok();
        Self {
            inner: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            local_addr,
            tcp_keepalive: None,
        }
    }

    /// Enable keep-alive probing with the given period on accepted TCP
    /// connections.
    pub fn with_tcp_keepalive(mut self, period: Option<Duration>) -> Self {
        self.tcp_keepalive = period;
        self
    }

    /// Keep-alive probing period applied to accepted connections.
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive
    }

    /// Address the listener was bound to.
    pub fn local_addr(&self) -> Option<&ListenAddr> {
        self.local_addr.as_ref()
    }

    /// Whether this listener serves a Unix domain socket.
    pub fn is_unix(&self) -> bool {
        matches!(self.local_addr, Some(ListenAddr::Unix(_)))
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Incoming, ListenerError> {
        // Register for the close notification before looking at the flag so
        // a close racing with this call is never missed.
        let mut closed = pin!(self.close_notify.notified());
        closed.as_mut().enable();

        if self.is_closed() {
            return Err(ListenerError::AlreadyClosed);
        }

        let result = tokio::select! {
            result = poll_fn(|cx| self.poll_accept(cx)) => result,
            _ = closed => Err(ListenerError::AlreadyClosed),
        };

        match result {
            Ok(incoming) => {
                if let Some(period) = self.tcp_keepalive {
                    if let Err(e) = incoming.set_tcp_keepalive(period) {
                        warn!(peer = %incoming.peer(), error = %e, "failed to enable TCP keep-alive");
                    }
                }
                Ok(incoming)
            }
            Err(ListenerError::Io(_)) if self.is_closed() => Err(ListenerError::AlreadyClosed),
            Err(e) => Err(e),
        }
    }

    fn poll_accept(&self, cx: &mut std::task::Context<'_>) -> Poll<Result<Incoming, ListenerError>> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(listener) => listener.poll_accept(cx).map_err(ListenerError::Io),
            None => Poll::Ready(Err(ListenerError::AlreadyClosed)),
        }
    }

    /// Stop accepting connections and release the socket.
    ///
    /// Returns `true` for the call that actually closed the listener; later
    /// calls are no-ops.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let listener = self.inner.lock().take();
        self.close_notify.notify_waiters();

        if let Some(listener) = listener {
            info!(addr = ?self.local_addr, fd = listener.as_raw_fd(), "listener closed");
        }
        true
    }

    /// Raw descriptor of the listening socket.
    pub fn descriptor(&self) -> Result<RawFd, ListenerError> {
        self.inner
            .lock()
            .as_ref()
            .map(|l| l.as_raw_fd())
            .ok_or(ListenerError::AlreadyClosed)
    }

    /// Duplicate the socket into a new, independently owned listener.
    ///
    /// The copy accepts on the same address and survives this listener being
    /// closed. TLS listeners cannot be duplicated; see
    /// [`try_clone_transport`](Self::try_clone_transport).
    pub fn try_clone(&self) -> Result<DrainingListener, ListenerError> {
        let guard = self.inner.lock();
        let listener = guard.as_ref().ok_or(ListenerError::AlreadyClosed)?;
        let clone = listener.try_clone().map_err(ListenerError::Clone)?;
        debug!(from = listener.as_raw_fd(), to = clone.as_raw_fd(), "duplicated listener");
        Ok(DrainingListener::new(clone).with_tcp_keepalive(self.tcp_keepalive))
    }

    /// Duplicate the plaintext transport socket, dropping any TLS layer.
    pub fn try_clone_transport(&self) -> Result<Listener, ListenerError> {
        let guard = self.inner.lock();
        let listener = guard.as_ref().ok_or(ListenerError::AlreadyClosed)?;
        listener.try_clone_transport().map_err(ListenerError::Clone)
    }
}

impl From<Listener> for DrainingListener {
    fn from(listener: Listener) -> Self {
        DrainingListener::new(listener)
    }
}

impl From<tokio::net::TcpListener> for DrainingListener {
    fn from(listener: tokio::net::TcpListener) -> Self {
        DrainingListener::new(Listener::Tcp(listener))
    }
}

impl From<tokio::net::UnixListener> for DrainingListener {
    fn from(listener: tokio::net::UnixListener) -> Self {
        DrainingListener::new(Listener::Unix(listener))
    }
}

impl std::fmt::Debug for DrainingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainingListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn bound() -> (DrainingListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (DrainingListener::from(listener), addr)
    }

    #[tokio::test]
    async fn test_accept_returns_connection() {
        let (listener, addr) = bound().await;
        let _client = TcpStream::connect(addr).await.unwrap();

        let incoming = listener.accept().await.unwrap();
        assert!(matches!(incoming.peer(), super::super::PeerAddr::Tcp(_)));
    }

    #[tokio::test]
    async fn test_accept_after_close_is_already_closed() {
        let (listener, _) = bound().await;
        assert!(listener.close());

        let err = listener.accept().await.unwrap_err();
        assert!(err.is_already_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, _) = bound().await;
        assert!(listener.close());
        assert!(!listener.close());
        assert!(!listener.close());
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let (listener, _) = bound().await;
        let listener = Arc::new(listener);

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        listener.close();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("accept did not unblock")
            .unwrap();
        assert!(matches!(result, Err(ListenerError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let (listener, addr) = bound().await;
        listener.close();
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(matches!(listener.descriptor(), Err(ListenerError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_clone_has_distinct_descriptor_and_same_address() {
        let (listener, addr) = bound().await;
        let clone = listener.try_clone().unwrap();

        assert_ne!(clone.descriptor().unwrap(), listener.descriptor().unwrap());
        assert_eq!(clone.local_addr(), Some(&ListenAddr::Tcp(addr)));
        assert_eq!(listener.local_addr(), Some(&ListenAddr::Tcp(addr)));
    }

    #[tokio::test]
    async fn test_clone_survives_original_close() {
        let (listener, addr) = bound().await;
        let clone = listener.try_clone().unwrap();
        listener.close();

        let _client = TcpStream::connect(addr).await.unwrap();
        let incoming = tokio::time::timeout(Duration::from_secs(5), clone.accept())
            .await
            .unwrap();
        assert!(incoming.is_ok());
    }

    #[tokio::test]
    async fn test_clone_after_close_fails() {
        let (listener, _) = bound().await;
        listener.close();
        assert!(matches!(listener.try_clone(), Err(ListenerError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_keepalive_setting_carried_to_clone() {
        let (listener, _) = bound().await;
        let listener = listener.with_tcp_keepalive(Some(Duration::from_secs(180)));
        let clone = listener.try_clone().unwrap();
        assert_eq!(clone.tcp_keepalive(), Some(Duration::from_secs(180)));
    }
}

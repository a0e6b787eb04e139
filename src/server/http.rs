//! HTTP/1.1 serving for one accepted connection.
//!
//! hyper drives the protocol; this module turns its progress into lifecycle
//! events for the tracker. Active fires when a request head has been read,
//! Idle when the response body has been fully handed to the transport (the
//! body wrapper is dropped), and the caller reports Closed or Hijacked once
//! [`serve_connection`] returns.

use super::body::{self, Body, BoxError};
use super::gate::DispatchGate;
use crate::conn::{ConnState, ConnTracker, Connection, Transition};
use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use pin_project_lite::pin_project;
use std::error::Error as _;
use std::io;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Serve HTTP/1.1 on `stream` until the peer goes away, keep-alive ends, or
/// the tracker force-closes the connection.
///
/// `keep_alives` carries the server-wide keep-alive switch. When it turns
/// off, or the gate closes, the connection finishes its current exchange and
/// closes. A connection that has not sent a request yet closes at once.
pub(crate) async fn serve_connection<S>(
    stream: S,
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
    mut keep_alives: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let drain = gate.clone();
    let service = DispatchService {
        conn: Arc::clone(&conn),
        tracker,
        gate,
    };

    let keep_alive = *keep_alives.borrow_and_update();
    let mut builder = http1::Builder::new();
    builder.keep_alive(keep_alive).timer(TokioTimer::new());
    let mut connection = pin!(
        builder
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
    );

    let mut watching = keep_alive;
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    log_serve_error(conn.id(), &e);
                }
                break;
            }
            _ = conn.close_requested() => {
                debug!(conn = conn.id(), "dropping connection");
                break;
            }
            changed = keep_alives.changed(), if watching => {
                let enabled = changed.is_ok() && *keep_alives.borrow_and_update();
                if !enabled {
                    watching = false;
                    if !draining {
                        debug!(conn = conn.id(), "keep-alive disabled, closing after current exchange");
                        connection.as_mut().graceful_shutdown();
                    }
                }
            }
            _ = drain.closed(), if !draining => {
                draining = true;
                debug!(conn = conn.id(), "draining, closing after current exchange");
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Hands each request to [`dispatch`]. A named service rather than
/// `service_fn`, so the connection future stays provably `Send`.
struct DispatchService {
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
}

impl Service<Request<Incoming>> for DispatchService {
    type Response = Response<TrackedBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        Box::pin(dispatch(
            request,
            Arc::clone(&self.conn),
            Arc::clone(&self.tracker),
            self.gate.clone(),
        ))
    }
}

async fn dispatch(
    request: Request<Incoming>,
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
    gate: DispatchGate,
) -> Result<Response<TrackedBody>, BoxError> {
    if tracker.on_state_change(&conn, ConnState::Active) == Transition::ForceClose {
        return Err("connection closed during shutdown".into());
    }

    let guard = IdleGuard {
        conn: Arc::clone(&conn),
        tracker,
    };
    let response = gate.dispatch(request.map(body::boxed)).await;
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        conn.mark_upgraded();
    }

    Ok(response.map(|inner| TrackedBody {
        inner,
        _guard: guard,
    }))
}

fn log_serve_error(conn: u64, err: &hyper::Error) {
    if let Some(io_err) = err.source().and_then(|e| e.downcast_ref::<io::Error>()) {
        match io_err.kind() {
            io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => {
                debug!(conn, error = %io_err, "peer went away");
            }
            _ => warn!(conn, error = %io_err, "error while serving"),
        }
    } else if err.is_incomplete_message() || err.is_canceled() {
        debug!(conn, error = %err, "interrupted request");
    } else if err.is_user() {
        debug!(conn, error = %err, "connection closed by server");
    } else {
        warn!(conn, error = %err, "failed to serve HTTP");
    }
}

/// Reports Idle when dropped, unless the connection was upgraded.
struct IdleGuard {
    conn: Arc<Connection>,
    tracker: Arc<ConnTracker>,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if !self.conn.is_upgraded() {
            self.tracker.on_state_change(&self.conn, ConnState::Idle);
        }
    }
}

pin_project! {
    /// Response body that carries the connection's [`IdleGuard`].
    struct TrackedBody {
        #[pin]
        inner: Body,
        _guard: IdleGuard,
    }
}

impl HttpBody for TrackedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

//! Dispatch gate in front of the application handler.

use super::body::{self, Body};
use super::handler::Handler;
use futures::future::BoxFuture;
use hyper::header::{CONNECTION, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// Wraps the application handler and stops calling it once closed.
///
/// Clones share the closed flag.
#[derive(Clone)]
pub struct DispatchGate {
    state: Arc<GateState>,
    inner: Arc<dyn Handler>,
}

struct GateState {
    closed: AtomicBool,
    notify: Notify,
}

impl DispatchGate {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self {
            state: Arc::new(GateState {
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            inner,
        }
    }

    /// Close the gate. Returns true for the call that closed it.
    pub fn close(&self) -> bool {
        let first = !self.state.closed.swap(true, Ordering::AcqRel);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Resolves once the gate is closed.
    pub async fn closed(&self) {
        let mut notified = pin!(self.state.notify.notified());
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Pass `request` to the application, or reject it if the gate is closed.
    pub fn dispatch(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>> {
        if !self.is_closed() {
            return self.inner.handle(request);
        }

        debug!(method = %request.method(), uri = %request.uri(), "request after shutdown, discarding");
        drop(request);
        Box::pin(async { rejected() })
    }
}

impl Handler for DispatchGate {
    fn handle(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>> {
        self.dispatch(request)
    }
}

impl std::fmt::Debug for DispatchGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGate")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn rejected() -> Response<Body> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

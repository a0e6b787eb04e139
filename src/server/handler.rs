//! Application request handlers.

use super::body::Body;
use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::future::Future;

/// Application logic invoked once per request.
///
/// Implemented for any `Fn(Request<Body>) -> impl Future<Output =
/// Response<Body>>` that is `Send + Sync + 'static`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    fn handle(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>> {
        Box::pin(self(request))
    }
}

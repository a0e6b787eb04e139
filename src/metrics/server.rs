//! Prometheus metrics HTTP server.
//!
//! Runs on its own [`GracefulServer`], so it drains like any other server.

use crate::metrics::MetricsCollector;
use crate::server::{Body, GracefulServer, ServeMode, ServerError, ServerSettings, body};
use hyper::{Method, Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    server: GracefulServer,
    address: String,
    path: Arc<str>,
}

impl MetricsServer {
    pub fn new(address: impl Into<String>, path: impl Into<String>, collector: MetricsCollector) -> Self {
        let address = address.into();
        let path: Arc<str> = Arc::from(path.into());

        let handler = {
            let path = Arc::clone(&path);
            move |req: Request<Body>| {
                let response = handle_request(&req, &collector, &path);
                async move { response }
            }
        };
        let server = GracefulServer::with_settings(
            handler,
            ServerSettings {
                addr: address.clone(),
                mode: ServeMode::Http,
                ..Default::default()
            },
        );

        Self { server, address, path }
    }

    /// Handle to the underlying server, for closing it.
    pub fn server(&self) -> &GracefulServer {
        &self.server
    }

    /// Bind and serve until the server is closed and drained.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(address = %self.address, path = %self.path, "metrics server starting");
        self.server.listen_and_serve().await
    }
}

fn text(status: StatusCode, content: &'static str) -> Response<Body> {
    let mut response = Response::new(body::full(content));
    *response.status_mut() = status;
    response
}

/// Handle an incoming metrics request.
fn handle_request(req: &Request<Body>, collector: &MetricsCollector, metrics_path: &str) -> Response<Body> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
    }

    if path == metrics_path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n");
        }

        let mut response = Response::new(body::full(buffer));
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        response
    } else if path == "/health" || path == "/healthz" {
        text(StatusCode::OK, "OK\n")
    } else if path == "/" {
        let index = format!(
            "graceful-drain metrics server\n\nEndpoints:\n  {metrics_path} - Prometheus metrics\n  /health - Health check\n"
        );
        Response::new(body::full(index))
    } else {
        text(StatusCode::NOT_FOUND, "Not found\n")
    }
}

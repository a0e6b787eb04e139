//! graceful-drain - graceful shutdown for HTTP and FastCGI servers
//!
//! A [`GracefulServer`] stops accepting on command, lets every in-flight
//! request finish, then reports that it has drained:
//! - Draining listeners that refuse to accept once closed
//! - Per-connection state tracking that protects active requests
//! - A dispatch gate that keeps late requests away from the application
//! - Listening socket hand-off to a successor server
//! - Signal-driven shutdown and Prometheus metrics
//!
//! The free functions run a process-wide default server. Signals are not
//! handled unless asked for:
//!
//! ```no_run
//! use graceful_drain::server::{Body, body};
//! use graceful_drain::Signal;
//! use hyper::{Request, Response};
//!
//! # async fn run() -> Result<(), graceful_drain::ServerError> {
//! graceful_drain::close_on_interrupt(Signal::DEFAULT);
//! graceful_drain::listen_and_serve("127.0.0.1:8080", |_req: Request<Body>| async {
//!     Response::new(body::full("hello"))
//! })
//! .await
//! # }
//! ```
//!
//! For more than one server, or more control, build a [`GracefulServer`].

pub mod config;
pub mod conn;
pub mod listener;
pub mod metrics;
pub mod server;
pub mod util;

pub use config::Config;
pub use listener::DrainingListener;
pub use server::default::{
    close, close_on_interrupt, default_server, listen_and_serve, listen_and_serve_tls, serve, signal_received,
};
pub use server::{GracefulServer, Handler, ServerError, ServerSettings};
pub use util::Signal;

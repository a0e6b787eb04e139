//! Serving connections and coordinating shutdown.
//!
//! [`GracefulServer`] is the entry point. The pieces it is built from are
//! public so they can be used directly:
//!
//! - [`WorkCounter`] counts outstanding work and lets shutdown wait on it.
//! - [`DispatchGate`] stops requests from reaching the application once
//!   shutdown has begun.
//! - [`Handler`] is the application interface, with [`body`] helpers.

pub mod body;
mod counter;
pub(crate) mod default;
mod fcgi;
mod gate;
mod graceful;
mod handler;
mod http;

pub use body::{Body, BoxError};
pub use counter::WorkCounter;
pub use fcgi::FastCgiParams;
pub use gate::DispatchGate;
pub use graceful::{GracefulServer, ServeMode, ServerError, ServerOptions, ServerSettings, ServerState};
pub use handler::Handler;

//! Per-connection lifecycle tracking.
//!
//! The serving loops report every lifecycle transition of a connection to a
//! [`ConnTracker`], which turns them into increments and decrements of the
//! server's outstanding-work counter and forwards them to observers.

mod observer;
mod registry;
mod state;
mod tracker;

pub use observer::{ConnStateObserver, ObserverChain};
pub use registry::{ConnRegistry, ConnSnapshot};
pub use state::{ConnInfo, ConnRecord, ConnState, Connection};
pub use tracker::{ConnTracker, Transition};

//! Logging setup and OS signal handling.

mod logging;
pub mod signal;

pub use logging::init_logging;
pub use signal::Signal;

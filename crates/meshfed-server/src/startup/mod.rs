//! Server startup utilities

pub mod logging;
pub mod shutdown;

pub use logging::init_logging;
pub use shutdown::{wait_for_shutdown_signal, ShutdownSignal};

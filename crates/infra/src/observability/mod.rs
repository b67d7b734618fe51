//! Logging and diagnostics setup.

pub mod logging;

pub use logging::init_logging;

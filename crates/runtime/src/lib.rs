//! Process lifecycle helpers: signal handling and graceful shutdown.
#![allow(clippy::uninlined_format_args)]

/// Signal handling and graceful shutdown
pub mod shutdown;

pub use shutdown::{ShutdownSignal, run_until_shutdown_graceful};

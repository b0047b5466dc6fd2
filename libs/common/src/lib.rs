//! Shared bootstrap pieces for homewatt binaries
//!
//! - logging initialization
//! - command-line arguments
//! - shutdown signal handling

pub mod bootstrap_args;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use logging::LogConfig;
pub use shutdown::{wait_for_shutdown, ShutdownSignal};

// Re-export CLI derive macros for binaries that extend ServiceArgs
pub use clap::{self, Parser};

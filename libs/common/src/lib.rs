//! Shared service plumbing
//!
//! - `bootstrap_args` - common CLI arguments
//! - `logging` - tracing subscriber setup with optional rolling files
//! - `shutdown` - signal handling

pub mod bootstrap_args;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use shutdown::{spawn_shutdown_listener, wait_for_shutdown};

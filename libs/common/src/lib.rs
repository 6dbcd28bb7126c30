//! Shared service utilities for the TASE.2 bridge services
//!
//! - logging bootstrap (console + rolling file, reloadable level filter)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{current_log_level, init_with_config, set_log_level, LogConfig};
pub use shutdown::{shutdown_token, wait_for_shutdown};

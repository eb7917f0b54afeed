//! observa-utils: Common utilities shared across observa crates
//!
//! This crate provides:
//! - Unified error types ([`ObservaError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

pub use error::{ObservaError, Result};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

pub use paths::{config_dir, config_file, log_dir, pid_file, runtime_dir, state_dir};

//! Logging setup for observa processes
//!
//! Daemons log to a file under the XDG state directory; interactive tools
//! log to stderr. The filter comes from `OBSERVA_LOG` when set.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::{paths, ObservaError, Result};

/// Environment variable holding the tracing filter directive
pub const LOG_ENV: &str = "OBSERVA_LOG";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    File,
    Both,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub output: LogOutput,
    /// Filter directive (e.g. "info", "observa_core=debug,tokio=warn")
    pub filter: String,
    /// Include span enter/exit events
    pub span_events: bool,
    /// Include file/line in records
    pub file_line: bool,
    /// Log file name inside the log directory (defaults to "observa.log")
    pub file_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
            span_events: false,
            file_line: false,
            file_name: None,
        }
    }
}

fn env_filter_or(default: &str) -> String {
    std::env::var(LOG_ENV).unwrap_or_else(|_| default.into())
}

impl LogConfig {
    /// Device daemons and the broker: file output, one file per daemon name.
    pub fn daemon(name: &str) -> Self {
        Self {
            output: LogOutput::File,
            filter: env_filter_or("info"),
            span_events: true,
            file_line: true,
            file_name: Some(format!("{}.log", name)),
        }
    }

    /// Short-lived clients log warnings to stderr.
    pub fn client() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: env_filter_or("warn"),
            span_events: false,
            file_line: false,
            file_name: None,
        }
    }

    pub fn development() -> Self {
        Self {
            output: LogOutput::Both,
            filter: "debug".into(),
            span_events: true,
            file_line: true,
            file_name: None,
        }
    }

    fn log_file_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or("observa.log")
    }
}

/// Initialize logging with the default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LogConfig::default())
}

fn open_log_file(config: &LogConfig) -> Result<std::fs::File> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir).map_err(|e| ObservaError::FileWrite {
        path: log_dir.clone(),
        source: e,
    })?;

    let log_path = log_dir.join(config.log_file_name());
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| ObservaError::FileWrite {
            path: log_path,
            source: e,
        })
}

/// Initialize logging with custom configuration
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| ObservaError::config(format!("Invalid log filter: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let fmt_layer = if config.span_events {
        fmt_layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
    } else {
        fmt_layer
    };

    let fmt_layer = fmt_layer
        .with_file(config.file_line)
        .with_line_number(config.file_line);

    let init_failed = |e: TryInitError| ObservaError::internal(format!("Failed to init logging: {}", e));

    match config.output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .try_init()
                .map_err(init_failed)?;
        }
        LogOutput::File => {
            let file = open_log_file(&config)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(file).with_ansi(false))
                .try_init()
                .map_err(init_failed)?;
        }
        LogOutput::Both => {
            let file = open_log_file(&config)?;
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
                .map_err(init_failed)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // ==================== LogConfig Preset Tests ====================

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.output, LogOutput::Stderr);
        assert_eq!(config.filter, "info");
        assert!(!config.span_events);
        assert!(!config.file_line);
        assert_eq!(config.log_file_name(), "observa.log");
    }

    #[test]
    fn test_log_config_daemon_file_name() {
        let config = LogConfig::daemon("centrald");
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.log_file_name(), "centrald.log");
        assert!(config.span_events);
        assert!(config.file_line);
    }

    #[test]
    fn test_log_config_client_is_quiet() {
        let config = LogConfig::client();
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(!config.span_events);
    }

    #[test]
    fn test_log_config_development() {
        let config = LogConfig::development();
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.filter, "debug");
    }

    // ==================== Environment Tests ====================

    // Single test so parallel tests never race on the variable
    #[test]
    fn test_log_env_overrides_presets() {
        let original = env::var(LOG_ENV).ok();

        env::remove_var(LOG_ENV);
        assert_eq!(LogConfig::daemon("teld").filter, "info");
        assert_eq!(LogConfig::client().filter, "warn");

        env::set_var(LOG_ENV, "observa_core=trace");
        assert_eq!(LogConfig::daemon("teld").filter, "observa_core=trace");
        assert_eq!(LogConfig::client().filter, "observa_core=trace");

        match original {
            Some(val) => env::set_var(LOG_ENV, val),
            None => env::remove_var(LOG_ENV),
        }
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = LogConfig {
            filter: "observa=loud".into(),
            ..LogConfig::default()
        };
        let err = init_logging_with_config(config).unwrap_err();
        assert!(matches!(err, ObservaError::Config(_)));
    }
}

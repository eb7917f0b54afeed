//! Path utilities for observa
//!
//! Follows the XDG Base Directory layout for config, state and runtime
//! directories.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "observa";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/observa` or `/tmp/observa-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Location: `$XDG_CONFIG_HOME/observa` or `~/.config/observa`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
}

/// Main configuration file: `$XDG_CONFIG_HOME/observa/config.toml`
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Location: `$XDG_STATE_HOME/observa` or `~/.local/state/observa`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_dir().join(".local").join("state").join(APP_NAME))
}

/// Location: `$XDG_STATE_HOME/observa/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// PID file of a named daemon inside the runtime directory
pub fn pid_file(daemon: &str) -> PathBuf {
    runtime_dir().join(format!("{}.pid", daemon))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

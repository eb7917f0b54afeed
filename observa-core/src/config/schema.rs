//! Configuration schema structs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::CentraldLogin;

/// Default broker port
pub const CENTRALD_PORT: u16 = 617;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub block: BlockSettings,
    pub connection: ConnectionSettings,
    /// Broker to log into; a block without one only accepts peers
    pub centrald: Option<CentraldSettings>,
}

impl BlockConfig {
    /// Configuration for a named block with every other setting at its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            block: BlockSettings {
                name: name.into(),
                ..BlockSettings::default()
            },
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.block.idle_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.connection.reconnect_secs)
    }

    /// Largest binary channel set a peer may announce, in bytes
    pub fn max_data_size(&self) -> usize {
        self.connection.max_data_size
    }

    /// Login data for the configured broker, using the block name as service.
    pub fn centrald_login(&self) -> Option<CentraldLogin> {
        self.centrald.as_ref().map(|c| CentraldLogin {
            host: c.host.clone(),
            port: c.port,
            login: c.login.clone(),
            password: c.password.clone(),
            service: self.block.name.clone(),
        })
    }
}

/// This process as seen by its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSettings {
    /// Name announced to the broker
    pub name: String,
    /// Listening port; 0 picks a free one
    pub port: u16,
    /// Longest wait for network traffic before the idle pass runs
    pub idle_timeout_ms: u64,
    /// Accepted peers must pass the broker key check before sending commands
    pub require_auth: bool,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            name: "observa".into(),
            port: 0,
            idle_timeout_ms: 10_000,
            require_auth: false,
        }
    }
}

/// Per-connection timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Silence after which a peer is probed; twice this ends the connection. 0 disables.
    pub timeout_secs: u64,
    /// Delay before a broken broker connection is dialled again
    pub reconnect_secs: u64,
    /// Limit for an outbound TCP connect
    pub connect_timeout_secs: u64,
    /// Total bytes one `C` line may announce over all its channels
    pub max_data_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            reconnect_secs: 60,
            connect_timeout_secs: 10,
            max_data_size: 256 * 1024 * 1024,
        }
    }
}

/// Broker login
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentraldSettings {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

impl Default for CentraldSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: CENTRALD_PORT,
            login: "observa".into(),
            password: String::new(),
        }
    }
}

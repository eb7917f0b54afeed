//! Configuration loader

use std::path::Path;

use observa_utils::{config_file, ObservaError, Result};

use super::BlockConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<BlockConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(BlockConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<BlockConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| ObservaError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<BlockConfig> {
        toml::from_str(content).map_err(|e| ObservaError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &BlockConfig) -> Result<()> {
        let name = &config.block.name;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ObservaError::config(
                "block name must be a single non-empty token",
            ));
        }

        if config.block.idle_timeout_ms == 0 {
            return Err(ObservaError::config("idle_timeout_ms must be positive"));
        }

        if config.connection.reconnect_secs == 0 {
            return Err(ObservaError::config("reconnect_secs must be positive"));
        }

        if config.connection.max_data_size == 0 {
            return Err(ObservaError::config("max_data_size must be positive"));
        }

        if let Some(centrald) = &config.centrald {
            if centrald.host.is_empty() || centrald.port == 0 {
                return Err(ObservaError::config("centrald needs a host and a port"));
            }
            if centrald.login.contains(char::is_whitespace) {
                return Err(ObservaError::config("centrald login must be a single token"));
            }
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<BlockConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file() {
        let config = ConfigLoader::load();
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("observa.toml");

        std::fs::write(
            &path,
            r#"
            [block]
            name = "C0"
            port = 5556

            [centrald]
            host = "broker.local"
            login = "petr"
            "#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.block.name, "C0");
        assert_eq!(config.block.port, 5556);
        assert_eq!(config.block.idle_timeout_ms, 10_000);
        assert_eq!(config.connection.timeout_secs, 300);
        assert_eq!(config.max_data_size(), 256 * 1024 * 1024);

        let login = config.centrald_login().unwrap();
        assert_eq!(login.host, "broker.local");
        assert_eq!(login.port, 617);
        assert_eq!(login.login, "petr");
        assert_eq!(login.service, "C0");
    }

    #[test]
    fn test_load_unreadable_path() {
        let dir = tempdir().unwrap();
        let result = ConfigLoader::load_from_path(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ObservaError::FileRead { .. })));
    }

    #[test]
    fn test_no_centrald_section() {
        let config = ConfigLoader::parse("[block]\nname = \"T0\"\n", Path::new("t.toml")).unwrap();
        assert!(config.centrald.is_none());
        assert!(config.centrald_login().is_none());
    }

    #[test]
    fn test_validate() {
        assert!(ConfigLoader::validate(&BlockConfig::default()).is_ok());

        let config = BlockConfig::named("two words");
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = BlockConfig::default();
        config.block.idle_timeout_ms = 0;
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = BlockConfig::default();
        config.connection.max_data_size = 0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigLoader::parse("invalid { toml", Path::new("test.toml"));
        assert!(matches!(result, Err(ObservaError::ConfigInvalid { .. })));
    }
}

//! Configuration file loader.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use tracing::{debug, info};

use super::error::{ConfigError, ConfigResult};
use super::schema::OnemuxConfig;

/// Configuration loader with file discovery and environment overrides.
///
/// Values from `ONEMUX_`-prefixed environment variables win over the file;
/// nested keys use `__` as the separator (`ONEMUX_LOGGING__LEVEL=debug`).
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
        }
    }

    /// Adds a search path for configuration files.
    pub fn add_search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Adds the current directory to search paths.
    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.add_search_path(cwd)
        } else {
            self
        }
    }

    /// Loads configuration from the first available source.
    pub fn load(&self) -> ConfigResult<OnemuxConfig> {
        if let Some(path) = self.find_config_file() {
            return self.load_from_file(&path);
        }
        info!("no configuration file found, using defaults");
        self.extract(Figment::new())
    }

    /// Loads configuration from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<OnemuxConfig> {
        let path = path.as_ref();
        info!("loading configuration from: {}", path.display());
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        self.extract(Figment::from(Toml::file(path)))
    }

    /// Loads configuration from a TOML string.
    pub fn load_from_str(&self, toml: &str) -> ConfigResult<OnemuxConfig> {
        self.extract(Figment::from(Toml::string(toml)))
    }

    fn extract(&self, figment: Figment) -> ConfigResult<OnemuxConfig> {
        let config: OnemuxConfig = figment
            .merge(Env::prefixed("ONEMUX_").split("__"))
            .extract()?;
        validate(&config)?;
        debug!(
            "configuration loaded with {} connection(s)",
            config.connections.len()
        );
        Ok(config)
    }

    /// Finds the first available configuration file.
    fn find_config_file(&self) -> Option<PathBuf> {
        const CONFIG_NAMES: &[&str] = &["onemux.toml", "config.toml"];

        for search_path in &self.search_paths {
            for name in CONFIG_NAMES {
                let path = search_path.join(name);
                debug!("checking for config file: {}", path.display());
                if path.exists() {
                    info!("found configuration file: {}", path.display());
                    return Some(path);
                }
            }
        }
        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().with_current_dir()
    }
}

/// Rejects configs the proxy could not serve: enabled connections must carry
/// a parseable client endpoint and WebSocket target URLs. A disabled
/// connection may hold anything.
fn validate(config: &OnemuxConfig) -> ConfigResult<()> {
    for (connection_id, connection) in &config.connections {
        if !connection.enabled {
            continue;
        }
        connection
            .client_route()
            .map_err(|e| ConfigError::invalid_connection(connection_id, e))?;
        for endpoint in &connection.target_endpoints {
            let url = endpoint.url();
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::invalid_connection(
                    connection_id,
                    format!("target endpoint must use ws:// or wss://: {url}"),
                ));
            }
        }
    }
    Ok(())
}

/// Convenience function to load configuration with default settings.
pub fn load_config() -> ConfigResult<OnemuxConfig> {
    ConfigLoader::default().load()
}

/// Convenience function to load configuration from a specific file.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<OnemuxConfig> {
    ConfigLoader::new().load_from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogLevel;
    use onemux_core::TargetEndpoint;

    #[test]
    fn test_parse_empty_config() {
        let config = ConfigLoader::new().load_from_str("").unwrap();
        assert!(config.connections.is_empty());
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_full_connection() {
        let toml = r#"
[logging]
level = "debug"

[connections.yunzai]
enabled = true
client_endpoint = "ws://0.0.0.0:5111/bs/yunzai"
target_endpoints = [
    "ws://127.0.0.1:2536/ws",
    { url = "ws://127.0.0.1:8765/ws/Bot", sakoya_protocol = true },
    { url = "ws://127.0.0.1:9999/ws", disabled = true },
]
"#;
        let config = ConfigLoader::new().load_from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        let conn = &config.connections["yunzai"];
        assert!(conn.enabled);
        assert_eq!(conn.target_endpoints.len(), 3);
        assert!(matches!(&conn.target_endpoints[0], TargetEndpoint::Url(_)));
        assert!(conn.target_endpoints[1].is_sakoya());
        assert!(conn.target_endpoints[2].is_disabled());
    }

    #[test]
    fn test_enabled_connection_with_bad_endpoint_rejected() {
        let toml = r#"
[connections.bad]
enabled = true
client_endpoint = "http://0.0.0.0:5111/x"
"#;
        assert!(ConfigLoader::new().load_from_str(toml).is_err());
    }

    #[test]
    fn test_disabled_connection_not_validated() {
        let toml = r#"
[connections.off]
enabled = false
client_endpoint = "not even a url"
"#;
        assert!(ConfigLoader::new().load_from_str(toml).is_ok());
    }

    #[test]
    fn test_bad_target_scheme_rejected() {
        let toml = r#"
[connections.c]
enabled = true
client_endpoint = "ws://0.0.0.0:5111/x"
target_endpoints = ["http://127.0.0.1:2536/ws"]
"#;
        assert!(ConfigLoader::new().load_from_str(toml).is_err());
    }
}

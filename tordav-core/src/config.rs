//! Centralized configuration for tordav.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all tordav components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TorDavConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
    pub engine: EngineConfig,
}

/// WebDAV server and access control configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface and port the WebDAV server listens on
    pub listen_addr: SocketAddr,
    /// Secret URL path segment gating every request ("/" when unset)
    pub secret_path: String,
    /// HTTP Basic username, empty disables authentication
    pub username: String,
    /// HTTP Basic password
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            secret_path: "/".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ServerConfig {
    /// Returns true when both username and password are configured.
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// On-disk locations used by the server.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory watched for descriptors and magnet batches
    pub torrents_dir: PathBuf,
    /// Directory holding the engine's completion and session state
    pub metadata_dir: PathBuf,
    /// Directory for the full debug log of the last run
    pub logs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            torrents_dir: PathBuf::from("torrents"),
            metadata_dir: PathBuf::from("metadata"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// File naming conventions and timing of the directory lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Canonical descriptor name inside a watched torrent directory
    pub descriptor_name: String,
    /// Name of the newline-separated magnet batch file
    pub magnet_batch_name: String,
    /// Reserved status file name, served live and never ingested
    pub status_file_name: String,
    /// Delay before the single retry of a failed descriptor/batch read
    pub retry_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            descriptor_name: "this.torrent".to_string(),
            magnet_batch_name: "magnets.txt".to_string(),
            status_file_name: "stats.txt".to_string(),
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Torrent engine parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TCP/UDP port the engine listens on for peers
    pub listen_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { listen_port: 4065 }
    }
}

/// Errors raised while validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Secret path must not end with '/': {path}")]
    TrailingSlash { path: String },

    #[error("Username is set but password is empty")]
    MissingPassword,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl TorDavConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - A variable is set but cannot be parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TORDAV_LISTEN") {
            config.server.listen_addr = addr.parse().map_err(|_| ConfigError::InvalidValue {
                name: "TORDAV_LISTEN",
                value: addr.clone(),
            })?;
        }

        if let Ok(secret) = std::env::var("TORDAV_SECRET") {
            config.server.secret_path = secret;
        }

        if let Ok(username) = std::env::var("TORDAV_USER") {
            config.server.username = username;
        }

        if let Ok(password) = std::env::var("TORDAV_PASS") {
            config.server.password = password;
        }

        if let Ok(dir) = std::env::var("TORDAV_TORRENTS_DIR") {
            config.storage.torrents_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("TORDAV_METADATA_DIR") {
            config.storage.metadata_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("TORDAV_PEER_PORT") {
            config.engine.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "TORDAV_PEER_PORT",
                value: port.clone(),
            })?;
        }

        if let Ok(delay) = std::env::var("TORDAV_RETRY_DELAY_MS") {
            let millis = delay.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "TORDAV_RETRY_DELAY_MS",
                value: delay.clone(),
            })?;
            config.lifecycle.retry_delay = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Normalizes and checks the configuration.
    ///
    /// The secret path gains a leading '/' when missing; an empty secret
    /// becomes "/".
    ///
    /// # Errors
    /// - `ConfigError::TrailingSlash` - Secret path ends with '/'
    /// - `ConfigError::MissingPassword` - Username given without password
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.server.secret_path = normalize_secret_path(&self.server.secret_path)?;

        if !self.server.username.is_empty() && self.server.password.is_empty() {
            return Err(ConfigError::MissingPassword);
        }

        Ok(())
    }

    /// Creates a configuration suitable for tests rooted at `root`.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig {
                torrents_dir: root.join("torrents"),
                metadata_dir: root.join("metadata"),
                logs_dir: root.join("logs"),
            },
            lifecycle: LifecycleConfig {
                retry_delay: Duration::from_millis(20),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Normalizes a user supplied secret path segment.
///
/// # Errors
/// - `ConfigError::TrailingSlash` - Non-root secret ending with '/'
pub fn normalize_secret_path(secret: &str) -> Result<String, ConfigError> {
    if secret.is_empty() || secret == "/" {
        return Ok("/".to_string());
    }
    if secret.ends_with('/') {
        return Err(ConfigError::TrailingSlash {
            path: secret.to_string(),
        });
    }
    if secret.starts_with('/') {
        Ok(secret.to_string())
    } else {
        Ok(format!("/{secret}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TorDavConfig::default();

        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.server.secret_path, "/");
        assert!(!config.server.auth_enabled());
        assert_eq!(config.storage.torrents_dir, PathBuf::from("torrents"));
        assert_eq!(config.storage.metadata_dir, PathBuf::from("metadata"));
        assert_eq!(config.lifecycle.descriptor_name, "this.torrent");
        assert_eq!(config.lifecycle.magnet_batch_name, "magnets.txt");
        assert_eq!(config.lifecycle.status_file_name, "stats.txt");
        assert_eq!(config.lifecycle.retry_delay, Duration::from_secs(3));
        assert_eq!(config.engine.listen_port, 4065);
    }

    #[test]
    fn test_secret_path_normalization() {
        assert_eq!(normalize_secret_path("").unwrap(), "/");
        assert_eq!(normalize_secret_path("/").unwrap(), "/");
        assert_eq!(normalize_secret_path("hidden").unwrap(), "/hidden");
        assert_eq!(normalize_secret_path("/hidden").unwrap(), "/hidden");
        assert!(matches!(
            normalize_secret_path("/hidden/"),
            Err(ConfigError::TrailingSlash { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_username_without_password() {
        let mut config = TorDavConfig::default();
        config.server.username = "alice".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPassword)
        ));
    }

    #[test]
    fn test_auth_requires_both_credentials() {
        let mut config = TorDavConfig::default();
        config.server.username = "alice".to_string();
        assert!(!config.server.auth_enabled());

        config.server.password = "secret".to_string();
        assert!(config.server.auth_enabled());
    }
}

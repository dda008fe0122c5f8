//! Configuration management for the VFS gateway.
//!
//! TOML-based configuration file loading and saving. The default
//! configuration path is `~/.config/vfs-gateway/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::TransmissionCapability;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{PathRule, PermissionLevel};
use crate::transfer::{TransferSettings, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_FILE_SIZE, MAX_BLOCK_SIZE};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("root must be an absolute path, got {0}")]
    RelativeRoot(PathBuf),

    #[error("relative_paths requires a root")]
    RelativePathsWithoutRoot,

    #[error("block sizes must be greater than 0")]
    ZeroBlockSize,

    #[error("default_block_size ({default}) exceeds max_block_size ({max})")]
    BlockSizeAboveMax { default: u64, max: u64 },

    #[error("max_file_size must be greater than 0")]
    ZeroMaxFileSize,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("access rule path must be absolute, got {0}")]
    RelativeRulePath(PathBuf),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Namespace and logging.
    pub gateway: GatewaySection,

    /// Block transfer limits.
    pub transfer: TransferSection,

    /// Rule-based authorization.
    pub access: AccessSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySection {
    /// Sandbox root. Absent means the whole machine is visible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Expose paths relative to the root (`vfs:/...`).
    pub relative_paths: bool,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSection {
    pub default_block_size: u64,
    pub max_block_size: u64,
    /// Largest upload accepted, in bytes (default: 100MB).
    pub max_file_size: u64,
    /// Token lifetime in seconds (0 = tokens never expire).
    pub token_ttl_secs: u64,
    pub capability: TransmissionCapability,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccessSection {
    /// Level for paths no rule matches.
    pub default_level: PermissionLevel,

    pub rules: Vec<PathRule>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            root: None,
            relative_paths: false,
            log_level: "info".to_string(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            token_ttl_secs: 3600,
            capability: TransmissionCapability::Random,
        }
    }
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            default_level: PermissionLevel::Full,
            rules: Vec::new(),
        }
    }
}

impl TransferSection {
    /// Engine settings for this section.
    pub fn settings(&self) -> TransferSettings {
        TransferSettings {
            default_block_size: self.default_block_size,
            max_block_size: self.max_block_size,
            max_file_size: self.max_file_size,
            token_ttl: (self.token_ttl_secs > 0).then(|| Duration::from_secs(self.token_ttl_secs)),
            capability: self.capability,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vfs-gateway")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - VFS_GATEWAY_ROOT: Override the sandbox root
    /// - VFS_GATEWAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("VFS_GATEWAY_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding root from environment: {}", root);
                self.gateway.root = Some(PathBuf::from(root));
            }
        }

        if let Ok(level) = std::env::var("VFS_GATEWAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.gateway.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.gateway.root {
            Some(root) if !root.is_absolute() => {
                return Err(ConfigError::RelativeRoot(root.clone()));
            }
            None if self.gateway.relative_paths => {
                return Err(ConfigError::RelativePathsWithoutRoot);
            }
            _ => {}
        }

        let transfer = &self.transfer;
        if transfer.default_block_size == 0 || transfer.max_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if transfer.default_block_size > transfer.max_block_size {
            return Err(ConfigError::BlockSizeAboveMax {
                default: transfer.default_block_size,
                max: transfer.max_block_size,
            });
        }
        if transfer.max_file_size == 0 {
            return Err(ConfigError::ZeroMaxFileSize);
        }

        let level = self.gateway.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.gateway.log_level.clone()));
        }

        if let Some(rule) = self.access.rules.iter().find(|r| !r.path.is_absolute()) {
            return Err(ConfigError::RelativeRulePath(rule.path.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.gateway.root.is_none());
        assert!(!config.gateway.relative_paths);
        assert_eq!(config.gateway.log_level, "info");
        assert_eq!(config.transfer.default_block_size, 64 * 1024);
        assert_eq!(config.transfer.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.transfer.capability, TransmissionCapability::Random);
        assert_eq!(config.access.default_level, PermissionLevel::Full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[gateway]
root = "/data"
relative_paths = true
log_level = "debug"

[transfer]
default_block_size = 4096
token_ttl_secs = 0
capability = "strict_sequential"

[access]
default_level = "read"

[[access.rules]]
path = "/data/inbox"
level = "read_write"

[[access.rules]]
path = "/data/locked"
level = "none"
recursive = false
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.gateway.root, Some(PathBuf::from("/data")));
        assert!(config.gateway.relative_paths);
        assert_eq!(config.transfer.default_block_size, 4096);
        assert_eq!(config.transfer.max_block_size, MAX_BLOCK_SIZE);
        assert_eq!(
            config.transfer.capability,
            TransmissionCapability::StrictSequential
        );
        assert_eq!(config.access.default_level, PermissionLevel::Read);
        assert_eq!(
            config.access.rules,
            vec![
                PathRule::new("/data/inbox", PermissionLevel::ReadWrite, true),
                PathRule::new("/data/locked", PermissionLevel::None, false),
            ]
        );

        let settings = config.transfer.settings();
        assert_eq!(settings.default_block_size, 4096);
        assert_eq!(settings.token_ttl, None);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = Config::from_toml("[transfer]\nmax_file_size = \"big\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.gateway.relative_paths = true;
        assert_eq!(config.validate(), Err(ConfigError::RelativePathsWithoutRoot));

        let mut config = Config::default();
        config.gateway.root = Some(PathBuf::from("data"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeRoot(PathBuf::from("data")))
        );

        let mut config = Config::default();
        config.transfer.default_block_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBlockSize));

        let mut config = Config::default();
        config.transfer.default_block_size = MAX_BLOCK_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlockSizeAboveMax { .. })
        ));

        let mut config = Config::default();
        config.transfer.max_file_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxFileSize));

        let mut config = Config::default();
        config.gateway.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        let mut config = Config::default();
        config
            .access
            .rules
            .push(PathRule::new("relative", PermissionLevel::Read, true));
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeRulePath(PathBuf::from("relative")))
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.gateway.root = Some(PathBuf::from("/srv/files"));
        config.transfer.capability = TransmissionCapability::SequentialWithRetransmission;
        config
            .access
            .rules
            .push(PathRule::new("/srv/files/ro", PermissionLevel::Read, true));

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("vfs-gateway/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("VFS_GATEWAY_ROOT", "/from/env");
        std::env::set_var("VFS_GATEWAY_LOG_LEVEL", "warn");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("VFS_GATEWAY_ROOT");
        std::env::remove_var("VFS_GATEWAY_LOG_LEVEL");

        assert_eq!(config.gateway.root, Some(PathBuf::from("/from/env")));
        assert_eq!(config.gateway.log_level, "warn");
    }

    #[test]
    #[serial]
    fn test_empty_env_values_ignored() {
        std::env::set_var("VFS_GATEWAY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("VFS_GATEWAY_LOG_LEVEL");
        assert_eq!(config.gateway.log_level, "info");
    }
}

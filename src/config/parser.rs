//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files, `.env` files,
//! and environment variables, with environment values taking precedence.

use crate::error::{ConfigError, LeaseError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{LeaseConfig, StorageBackend};

/// Overrides the primary endpoint with a local snapshot path.
pub const ENV_PRIMARY_PATH: &str = "GPULEASE_PRIMARY_PATH";
/// Overrides the backup endpoint with a local snapshot path.
pub const ENV_BACKUP_PATH: &str = "GPULEASE_BACKUP_PATH";
/// Overrides the backup endpoint with an S3 bucket.
pub const ENV_BACKUP_BUCKET: &str = "GPULEASE_BACKUP_BUCKET";
/// Overrides the probe timeout in milliseconds.
pub const ENV_PROBE_TIMEOUT_MS: &str = "GPULEASE_PROBE_TIMEOUT_MS";

/// Configuration parser for loading lease manager configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LeaseConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(LeaseError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            LeaseError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<LeaseConfig> {
        debug!("Parsing YAML configuration");

        let config: LeaseConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            LeaseError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for fleet: {}", config.fleet.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<LeaseConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `GPULEASE_PROBE_TIMEOUT_MS` is not a number.
    pub fn apply_env_overrides<F>(config: &mut LeaseConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_PRIMARY_PATH) {
            debug!("Overriding storage.primary from environment");
            config.storage.primary.backend = StorageBackend::Local;
            config.storage.primary.path = Some(path);
        }

        if let Some(path) = lookup(ENV_BACKUP_PATH) {
            debug!("Overriding storage.backup path from environment");
            config.storage.backup.backend = StorageBackend::Local;
            config.storage.backup.path = Some(path);
        }

        if let Some(bucket) = lookup(ENV_BACKUP_BUCKET) {
            debug!("Overriding storage.backup bucket from environment");
            config.storage.backup.backend = StorageBackend::S3;
            config.storage.backup.bucket = Some(bucket);
        }

        if let Some(raw) = lookup(ENV_PROBE_TIMEOUT_MS) {
            debug!("Overriding storage.probe_timeout_ms from environment");
            config.storage.probe_timeout_ms = raw.trim().parse().map_err(|e| {
                LeaseError::Config(ConfigError::ParseError {
                    message: format!("Invalid {ENV_PROBE_TIMEOUT_MS} value '{raw}': {e}"),
                    location: None,
                })
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                LeaseError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["gpulease.yaml", "gpulease.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(LeaseError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

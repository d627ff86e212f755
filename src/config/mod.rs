//! Configuration module for the GPU lease manager.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `gpulease.yaml`
//! - Environment and `.env` overrides
//! - Validation of configuration values

mod parser;
mod spec;
mod validator;

pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_BACKUP_BUCKET, ENV_BACKUP_PATH, ENV_PRIMARY_PATH,
    ENV_PROBE_TIMEOUT_MS, find_config_file,
};
pub use spec::{
    EndpointConfig, EventSinkKind, EventsConfig, FleetConfig, InventoryConfig, LeaseConfig,
    StorageBackend, StorageConfig,
};
pub use validator::{
    ConfigValidator, MAX_PROBE_TIMEOUT_MS, MIN_PROBE_TIMEOUT_MS, ValidationError,
    ValidationResult,
};

//! Configuration validation.
//!
//! This module checks a parsed configuration for values the manager cannot
//! run with, collecting every error and warning before reporting.

use crate::error::{ConfigError, LeaseError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{EndpointConfig, EventsConfig, InventoryConfig, LeaseConfig, StorageBackend, StorageConfig};

/// Smallest accepted probe timeout, in milliseconds.
pub const MIN_PROBE_TIMEOUT_MS: u64 = 10;
/// Largest accepted probe timeout, in milliseconds.
pub const MAX_PROBE_TIMEOUT_MS: u64 = 5000;
/// Probe timeouts above this stall mutations noticeably.
const SLOW_PROBE_TIMEOUT_MS: u64 = 1000;

/// Validator for lease manager configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &LeaseConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(LeaseError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &LeaseConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_fleet(config, &mut result);
        Self::validate_storage(&config.storage, &mut result);
        Self::validate_inventory(&config.inventory, &mut result);
        Self::validate_events(&config.events, &mut result);

        result
    }

    /// Validates fleet configuration.
    fn validate_fleet(config: &LeaseConfig, result: &mut ValidationResult) {
        if config.fleet.name.is_empty() {
            result.push_error("fleet.name", "Fleet name cannot be empty");
        } else if !is_valid_name(&config.fleet.name) {
            result.push_error(
                "fleet.name",
                format!(
                    "Fleet name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.fleet.name
                ),
            );
        }

        if config.fleet.environment.is_empty() {
            result.push_error("fleet.environment", "Environment cannot be empty");
        }
    }

    /// Validates storage configuration.
    fn validate_storage(storage: &StorageConfig, result: &mut ValidationResult) {
        Self::validate_endpoint("storage.primary", &storage.primary, result);
        Self::validate_endpoint("storage.backup", &storage.backup, result);

        // Default local paths resolve to distinct files
        let both_default = storage.primary.backend == StorageBackend::Local
            && storage.primary.path.is_none()
            && storage.backup.path.is_none();
        if !both_default
            && storage.primary.backend == storage.backup.backend
            && storage.primary.describe() == storage.backup.describe()
        {
            result.push_error(
                "storage.backup",
                "Backup endpoint must differ from the primary endpoint",
            );
        }

        let timeout = storage.probe_timeout_ms;
        if !(MIN_PROBE_TIMEOUT_MS..=MAX_PROBE_TIMEOUT_MS).contains(&timeout) {
            result.push_error(
                "storage.probe_timeout_ms",
                format!(
                    "Probe timeout must be between {MIN_PROBE_TIMEOUT_MS} and {MAX_PROBE_TIMEOUT_MS} ms, got {timeout}"
                ),
            );
        } else if timeout > SLOW_PROBE_TIMEOUT_MS {
            result.warnings.push(format!(
                "Probe timeout of {timeout} ms delays every durable write while storage is down"
            ));
        }

        if storage.health_check_interval_secs == 0 {
            result.push_error(
                "storage.health_check_interval_secs",
                "Health check interval must be at least 1 second",
            );
        }
    }

    /// Validates one endpoint.
    fn validate_endpoint(field: &str, endpoint: &EndpointConfig, result: &mut ValidationResult) {
        match endpoint.backend {
            StorageBackend::Local => {
                if endpoint.path.as_ref().is_some_and(String::is_empty) {
                    result.push_error(format!("{field}.path"), "Snapshot path cannot be empty");
                }
                if endpoint.bucket.is_some() {
                    result.warnings.push(format!(
                        "{field}.bucket is ignored for the local backend"
                    ));
                }
            }
            StorageBackend::S3 => {
                if endpoint.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push_error(
                        format!("{field}.bucket"),
                        "S3 bucket name is required when using the s3 backend",
                    );
                }
                if endpoint.path.is_some() {
                    result.warnings.push(format!("{field}.path is ignored for the s3 backend"));
                }
            }
        }
    }

    /// Validates the physical inventory.
    fn validate_inventory(inventory: &InventoryConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, gpu) in inventory.gpus.iter().enumerate() {
            let field = format!("inventory.gpus[{i}].id");

            if !is_valid_gpu_id(&gpu.id) {
                result.push_error(
                    field.clone(),
                    format!(
                        "GPU id '{}' is invalid. Use letters, digits, '-', '_', ':' or '.'.",
                        gpu.id
                    ),
                );
            }

            if !seen.insert(gpu.id.as_str()) {
                result.push_error(field, format!("Duplicate GPU id '{}'", gpu.id));
            }

            if gpu.vram_gb == Some(0) {
                result.warnings.push(format!("GPU '{}' declares 0 GB of VRAM", gpu.id));
            }
        }

        if inventory.gpus.is_empty() {
            result.warnings.push(String::from(
                "No GPUs configured; register inventory before allocating",
            ));
        }
    }

    /// Validates event configuration.
    fn validate_events(events: &EventsConfig, result: &mut ValidationResult) {
        if events.channel_capacity == 0 {
            result.push_error(
                "events.channel_capacity",
                "Event channel capacity must be greater than 0",
            );
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// GPU ids are non-empty, at most 128 characters, without whitespace.
fn is_valid_gpu_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{EventSinkKind, FleetConfig};
    use crate::inventory::GpuRecord;

    fn config() -> LeaseConfig {
        LeaseConfig {
            fleet: FleetConfig {
                name: String::from("market"),
                environment: String::from("prod"),
            },
            storage: StorageConfig {
                primary: EndpointConfig::local("/data/primary.json"),
                backup: EndpointConfig::local("/backup/inventory.json"),
                probe_timeout_ms: 300,
                health_check_interval_secs: 30,
            },
            inventory: InventoryConfig {
                gpus: vec![GpuRecord::new("gpu-0"), GpuRecord::new("gpu-1")],
            },
            events: EventsConfig {
                sink: EventSinkKind::Tracing,
                channel_capacity: 16,
            },
        }
    }

    fn has_error(result: &ValidationResult, field: &str) -> bool {
        result.errors.iter().any(|e| e.field == field)
    }

    #[test]
    fn test_valid_config() {
        let result = ConfigValidator::new()
            .validate(&config())
            .expect("should be valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("market"));
        assert!(is_valid_name("market-eu-1"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Market")); // uppercase
        assert!(!is_valid_name("1-market")); // starts with number
        assert!(!is_valid_name("market_eu")); // underscore
        assert!(!is_valid_name("market-")); // ends with hyphen
        assert!(!is_valid_name("market--eu")); // consecutive hyphens
    }

    #[test]
    fn test_gpu_ids() {
        assert!(is_valid_gpu_id("gpu-0"));
        assert!(is_valid_gpu_id("node1:gpu_3.0"));
        assert!(!is_valid_gpu_id(""));
        assert!(!is_valid_gpu_id("gpu 0"));
        assert!(!is_valid_gpu_id(&"g".repeat(129)));
    }

    #[test]
    fn test_duplicate_gpu_ids_rejected() {
        let mut config = config();
        config.inventory.gpus.push(GpuRecord::new("gpu-0"));

        let result = ConfigValidator::new().check(&config);
        assert!(has_error(&result, "inventory.gpus[2].id"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_probe_timeout_bounds() {
        let mut config = config();

        config.storage.probe_timeout_ms = 5;
        assert!(has_error(
            &ConfigValidator::new().check(&config),
            "storage.probe_timeout_ms"
        ));

        config.storage.probe_timeout_ms = 6000;
        assert!(has_error(
            &ConfigValidator::new().check(&config),
            "storage.probe_timeout_ms"
        ));

        config.storage.probe_timeout_ms = 2000;
        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_s3_backup_requires_bucket() {
        let mut config = config();
        config.storage.backup = EndpointConfig {
            backend: StorageBackend::S3,
            ..EndpointConfig::default()
        };

        let result = ConfigValidator::new().check(&config);
        assert!(has_error(&result, "storage.backup.bucket"));
    }

    #[test]
    fn test_identical_endpoints_rejected() {
        let mut config = config();
        config.storage.backup = config.storage.primary.clone();

        let result = ConfigValidator::new().check(&config);
        assert!(has_error(&result, "storage.backup"));
    }

    #[test]
    fn test_zero_capacity_and_interval_rejected() {
        let mut config = config();
        config.events.channel_capacity = 0;
        config.storage.health_check_interval_secs = 0;

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert!(has_error(&result, "events.channel_capacity"));
        assert!(has_error(&result, "storage.health_check_interval_secs"));
    }
}

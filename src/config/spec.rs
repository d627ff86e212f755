//! Configuration types for the GPU lease manager.
//!
//! This module defines the structs that map to the `gpulease.yaml` file:
//! the fleet identity, the primary and backup snapshot endpoints, the
//! physical inventory to import, and event delivery.

use serde::{Deserialize, Serialize};

use crate::inventory::GpuRecord;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Fleet-level configuration.
    pub fleet: FleetConfig,
    /// Snapshot storage configuration.
    pub storage: StorageConfig,
    /// Physical inventory to register.
    #[serde(default)]
    pub inventory: InventoryConfig,
    /// Event delivery configuration.
    #[serde(default)]
    pub events: EventsConfig,
}

/// Fleet-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetConfig {
    /// Name of the GPU fleet.
    pub name: String,
    /// Environment (e.g., "dev", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Preferred endpoint.
    pub primary: EndpointConfig,
    /// Fallback endpoint.
    pub backup: EndpointConfig,
    /// Upper bound for a single availability probe, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Interval between storage health checks, in seconds.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

/// One snapshot endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StorageBackend,
    /// Snapshot file path (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// Snapshot backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local JSON file.
    #[default]
    Local,
    /// AWS S3 object.
    S3,
}

/// Physical inventory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryConfig {
    /// GPUs to register, in allocation order.
    #[serde(default)]
    pub gpus: Vec<GpuRecord>,
}

/// Event delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsConfig {
    /// Where lifecycle events go.
    #[serde(default)]
    pub sink: EventSinkKind,
    /// Capacity of the event channel (for the channel sink).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Event sink types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSinkKind {
    /// Log every event.
    #[default]
    Tracing,
    /// Stream events as JSON lines through a bounded channel.
    Channel,
    /// Discard events.
    None,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: EventSinkKind::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

// Default value functions

const fn default_probe_timeout_ms() -> u64 {
    300
}

const fn default_health_check_interval_secs() -> u64 {
    30
}

const fn default_channel_capacity() -> usize {
    1024
}

fn default_environment() -> String {
    String::from("dev")
}

impl LeaseConfig {
    /// Returns the fully qualified fleet name (`fleet-environment`).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.fleet.name, self.fleet.environment)
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub const fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.storage.probe_timeout_ms)
    }

    /// Health check interval as a duration.
    #[must_use]
    pub const fn health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.storage.health_check_interval_secs)
    }
}

impl EndpointConfig {
    /// Creates a local endpoint for the given snapshot path.
    #[must_use]
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Local,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Human-readable description of the endpoint.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.backend {
            StorageBackend::Local => format!(
                "local:{}",
                self.path.as_deref().unwrap_or("<default>")
            ),
            StorageBackend::S3 => format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or("<unset>"),
                self.prefix.as_deref().unwrap_or("")
            ),
        }
    }
}

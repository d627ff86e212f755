//! Physical GPU inventory types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// State of a physical GPU.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GpuState {
    /// Free for allocation.
    Available,
    /// Exclusively assigned to one consumer.
    Allocated,
    /// Withdrawn for servicing.
    Maintenance,
    /// Powered off or unreachable.
    Offline,
}

/// How an inventory import treats the existing inventory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationMode {
    /// Discard the existing inventory and start every GPU `available`.
    #[default]
    Replace,
    /// Keep known GPUs and their assignments, add unknown ones.
    Merge,
}

/// A physical GPU tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhysicalGpu {
    /// Stable unique identifier.
    pub id: String,
    /// Current state.
    pub state: GpuState,
    /// Consumer holding the GPU; set iff `state` is `Allocated`.
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// GPU model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// On-board memory in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_gb: Option<u32>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// A physical GPU as supplied by an inventory import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuRecord {
    /// Stable unique identifier.
    pub id: String,
    /// GPU model name.
    #[serde(default)]
    pub model: Option<String>,
    /// On-board memory in GB.
    #[serde(default)]
    pub vram_gb: Option<u32>,
}

/// The externally visible status of a GPU.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GpuStatus {
    /// GPU identifier.
    pub id: String,
    /// Current state.
    pub state: GpuState,
    /// Current assignee.
    pub assigned_to: Option<String>,
}

impl PhysicalGpu {
    /// Creates an available GPU from an import record.
    #[must_use]
    pub fn from_record(record: GpuRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            state: GpuState::Available,
            assigned_to: None,
            model: record.model,
            vram_gb: record.vram_gb,
            updated_at: now,
        }
    }

    /// Returns true if the assignment invariant holds for this record.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.assigned_to.is_some() == matches!(self.state, GpuState::Allocated)
    }

    /// Returns true if the GPU is allocated to `consumer_id`.
    #[must_use]
    pub fn is_held_by(&self, consumer_id: &str) -> bool {
        self.state == GpuState::Allocated && self.assigned_to.as_deref() == Some(consumer_id)
    }

    /// Returns the public status view of this GPU.
    #[must_use]
    pub fn status(&self) -> GpuStatus {
        GpuStatus {
            id: self.id.clone(),
            state: self.state,
            assigned_to: self.assigned_to.clone(),
        }
    }
}

impl GpuRecord {
    /// Creates a record with only an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: None,
            vram_gb: None,
        }
    }
}

impl std::fmt::Display for GpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Available => "available",
            Self::Allocated => "allocated",
            Self::Maintenance => "maintenance",
            Self::Offline => "offline",
        };
        write!(f, "{state}")
    }
}

impl std::fmt::Display for RegistrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
        };
        write!(f, "{mode}")
    }
}

impl FromStr for GpuState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "allocated" => Ok(Self::Allocated),
            "maintenance" => Ok(Self::Maintenance),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown GPU state: {other}")),
        }
    }
}

impl FromStr for RegistrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown registration mode: {other}")),
        }
    }
}

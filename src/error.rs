//! Error types for the GPU lease manager.
//!
//! This module provides the error hierarchy for every layer of the core:
//! configuration, snapshot storage, allocation and lifecycle transitions.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the GPU lease manager.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot storage errors.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Allocation errors.
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Lifecycle state machine errors.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Snapshot storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Neither the primary nor the backup endpoint can be used.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Description of what was attempted.
        message: String,
    },

    /// The snapshot is corrupted.
    #[error("Snapshot is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The snapshot checksum does not match its content.
    #[error("Snapshot checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Checksum recorded in the snapshot.
        expected: String,
        /// Checksum computed from the snapshot content.
        found: String,
    },

    /// Snapshot version mismatch.
    #[error("Snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected snapshot version.
        expected: String,
        /// Found snapshot version.
        found: String,
    },

    /// Serialization error.
    #[error("Snapshot serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// Local filesystem error.
    #[error("Snapshot file error at {path}: {message}")]
    File {
        /// Path involved in the failure.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 snapshot backend error: {message}")]
    S3 {
        /// Description of the S3 error.
        message: String,
    },
}

/// Allocation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// No GPU is currently available.
    #[error("No GPU capacity available")]
    NoCapacity,

    /// A specific GPU was requested but is not available.
    #[error("GPU {gpu_id} is not available (state: {state})")]
    GpuUnavailable {
        /// Requested GPU.
        gpu_id: String,
        /// Current state of the GPU.
        state: String,
    },
}

/// Kind of entity referenced by a lifecycle error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A physical GPU.
    Gpu,
    /// A rental order.
    Order,
}

/// Lifecycle state machine errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested transition is not in the transition table.
    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entity kind.
        entity: EntityKind,
        /// Entity identifier.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: EntityKind,
        /// Entity identifier.
        id: String,
    },

    /// A transition to `allocated` was requested without an assignee.
    #[error("GPU {gpu_id} cannot be allocated without an assignee")]
    MissingAssignee {
        /// GPU identifier.
        gpu_id: String,
    },

    /// An assignee was given for a state other than `allocated`.
    #[error("GPU {gpu_id} cannot carry an assignee in state {state}")]
    UnexpectedAssignee {
        /// GPU identifier.
        gpu_id: String,
        /// Requested state.
        state: String,
    },

    /// The order's GPU is no longer allocated to the renter.
    #[error("Order {order_id} does not hold GPU {gpu_id}")]
    GpuNotAssigned {
        /// Order identifier.
        order_id: String,
        /// GPU identifier.
        gpu_id: String,
    },

    /// The GPU is still referenced or not offline.
    #[error("GPU {gpu_id} is in use: {reason}")]
    GpuInUse {
        /// GPU identifier.
        gpu_id: String,
        /// Why the GPU cannot be removed.
        reason: String,
    },

    /// The same GPU id appears more than once in a registration batch.
    #[error("Duplicate GPU id: {gpu_id}")]
    DuplicateGpuId {
        /// The duplicated id.
        gpu_id: String,
    },

    /// The hourly rate of a rental request is negative or not finite.
    #[error("Invalid hourly rate: {rate}")]
    InvalidRate {
        /// The rejected rate, as given.
        rate: String,
    },

    /// Restored data breaks a state invariant.
    #[error("Invariant violated: {message}")]
    InvariantViolation {
        /// Description of the violation.
        message: String,
    },
}

/// Result type alias for lease manager operations.
pub type Result<T> = std::result::Result<T, LeaseError>;

impl LeaseError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Allocation(AllocationError::NoCapacity)
                | Self::Storage(StorageError::Unavailable { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Allocation(AllocationError::NoCapacity) => Some(1),
            Self::Storage(StorageError::Unavailable { .. }) => Some(5),
            _ => None,
        }
    }

    /// Returns true if this is a storage-unavailable error.
    #[must_use]
    pub const fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Unavailable { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StorageError {
    /// Creates an unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3 {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a file error for the given path.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl LifecycleError {
    /// Creates a not-found error for a GPU.
    #[must_use]
    pub fn gpu_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: EntityKind::Gpu,
            id: id.into(),
        }
    }

    /// Creates a not-found error for an order.
    #[must_use]
    pub fn order_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: EntityKind::Order,
            id: id.into(),
        }
    }

    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(
        entity: EntityKind,
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Gpu => "GPU",
            Self::Order => "order",
        };
        write!(f, "{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LeaseError::from(AllocationError::NoCapacity).is_retryable());
        assert!(LeaseError::from(StorageError::unavailable("both down")).is_retryable());
        assert!(
            !LeaseError::from(LifecycleError::invalid_transition(
                EntityKind::Order,
                "o1",
                "pending",
                "completed"
            ))
            .is_retryable()
        );
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(
            LeaseError::from(AllocationError::NoCapacity).retry_delay_secs(),
            Some(1)
        );
        assert_eq!(LeaseError::internal("boom").retry_delay_secs(), None);
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = LifecycleError::invalid_transition(EntityKind::Gpu, "g1", "offline", "allocated");
        assert_eq!(
            err.to_string(),
            "Invalid GPU transition for g1: offline -> allocated"
        );
    }
}

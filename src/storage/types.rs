//! Persisted inventory snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::inventory::PhysicalGpu;
use crate::lifecycle::RentalOrder;

use super::hash::SnapshotHasher;

/// Current version of the snapshot format.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Durable form of the inventory and its rental orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventorySnapshot {
    /// Snapshot format version.
    pub version: String,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// GPUs in registration order.
    pub gpus: Vec<PhysicalGpu>,
    /// Rental orders.
    #[serde(default)]
    pub orders: Vec<RentalOrder>,
    /// Hex SHA-256 of `gpus` and `orders`.
    pub checksum: String,
}

impl InventorySnapshot {
    /// Builds a snapshot and computes its checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized.
    pub fn new(
        gpus: Vec<PhysicalGpu>,
        orders: Vec<RentalOrder>,
        saved_at: DateTime<Utc>,
    ) -> Result<Self> {
        let checksum = SnapshotHasher::new().checksum(&gpus, &orders)?;
        Ok(Self {
            version: SNAPSHOT_VERSION.to_string(),
            saved_at,
            gpus,
            orders,
            checksum,
        })
    }

    /// Builds an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum cannot be computed.
    pub fn empty(saved_at: DateTime<Utc>) -> Result<Self> {
        Self::new(Vec::new(), Vec::new(), saved_at)
    }

    /// Checks version and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot was written by another format version
    /// or its content does not match the checksum.
    pub fn verify(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            }
            .into());
        }

        let found = SnapshotHasher::new().checksum(&self.gpus, &self.orders)?;
        if found != self.checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: self.checksum.clone(),
                found,
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeaseError;
    use crate::inventory::{GpuRecord, GpuState};

    fn snapshot() -> InventorySnapshot {
        let now = Utc::now();
        InventorySnapshot::new(
            vec![PhysicalGpu::from_record(GpuRecord::new("g1"), now)],
            Vec::new(),
            now,
        )
        .expect("snapshot failed")
    }

    #[test]
    fn test_fresh_snapshot_verifies() {
        snapshot().verify().expect("verify failed");
        InventorySnapshot::empty(Utc::now())
            .expect("snapshot failed")
            .verify()
            .expect("verify failed");
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let mut snapshot = snapshot();
        snapshot.gpus[0].state = GpuState::Maintenance;

        assert!(matches!(
            snapshot.verify(),
            Err(LeaseError::Storage(StorageError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut snapshot = snapshot();
        snapshot.version = String::from("0.1");

        assert!(matches!(
            snapshot.verify(),
            Err(LeaseError::Storage(StorageError::VersionMismatch { .. }))
        ));
    }
}

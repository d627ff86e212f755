//! Snapshot hashing for corruption detection.
//!
//! The checksum covers the canonical JSON of the GPU list followed by the
//! order list, so any edit to a persisted snapshot is caught on load.

use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};
use crate::inventory::PhysicalGpu;
use crate::lifecycle::RentalOrder;

/// Hasher for computing snapshot checksums.
#[derive(Debug, Default)]
pub struct SnapshotHasher;

impl SnapshotHasher {
    /// Creates a new snapshot hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the checksum of a snapshot body.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized.
    pub fn checksum(&self, gpus: &[PhysicalGpu], orders: &[RentalOrder]) -> Result<String> {
        let mut hasher = Sha256::new();

        let gpu_bytes = serde_json::to_vec(gpus)
            .map_err(|e| StorageError::serialization(format!("Failed to encode GPUs: {e}")))?;
        hasher.update(&gpu_bytes);

        let order_bytes = serde_json::to_vec(orders)
            .map_err(|e| StorageError::serialization(format!("Failed to encode orders: {e}")))?;
        hasher.update(&order_bytes);

        Ok(hex::encode(hasher.finalize()))
    }

    /// Returns a short version of a checksum for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{GpuRecord, GpuState};
    use chrono::Utc;

    fn gpus() -> Vec<PhysicalGpu> {
        let now = Utc::now();
        vec![
            PhysicalGpu::from_record(GpuRecord::new("g1"), now),
            PhysicalGpu::from_record(GpuRecord::new("g2"), now),
        ]
    }

    #[test]
    fn test_checksum_deterministic() {
        let hasher = SnapshotHasher::new();
        let gpus = gpus();

        let a = hasher.checksum(&gpus, &[]).expect("hash failed");
        let b = hasher.checksum(&gpus, &[]).expect("hash failed");

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_detects_state_change() {
        let hasher = SnapshotHasher::new();
        let mut gpus = gpus();
        let before = hasher.checksum(&gpus, &[]).expect("hash failed");

        gpus[0].state = GpuState::Offline;
        let after = hasher.checksum(&gpus, &[]).expect("hash failed");

        assert_ne!(before, after);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(SnapshotHasher::short_hash("abcdef0123456789"), "abcdef01");
        assert_eq!(SnapshotHasher::short_hash("abc"), "abc");
    }
}

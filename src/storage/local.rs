//! Local file-based snapshot storage backend.
//!
//! This module provides a JSON file snapshot store for single-machine
//! deployments and for the local side of a primary/backup pair.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{LeaseError, Result, StorageError};

use super::store::SnapshotStore;
use super::types::InventorySnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".gpulease";

/// Snapshot file name.
pub const SNAPSHOT_FILE: &str = "inventory.json";

/// Local file-based snapshot store.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    /// Directory holding the snapshot.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    snapshot_path: PathBuf,
}

impl LocalSnapshotStore {
    /// Creates a store in the default state directory under the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| LeaseError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let snapshot_path = base_dir.join(SNAPSHOT_FILE);

        Self {
            base_dir,
            snapshot_path,
        }
    }

    /// Creates a store from a custom snapshot file path.
    #[must_use]
    pub fn with_snapshot_path(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let base_dir = snapshot_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Self {
            base_dir,
            snapshot_path,
        }
    }

    /// Path to the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StorageError::file(&self.base_dir, format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn load(&self) -> Result<Option<InventorySnapshot>> {
        if !self.snapshot_path.exists() {
            debug!("Snapshot file does not exist: {}", self.snapshot_path.display());
            return Ok(None);
        }

        info!("Loading snapshot from: {}", self.snapshot_path.display());

        let content = fs::read_to_string(&self.snapshot_path).await.map_err(|e| {
            StorageError::file(&self.snapshot_path, format!("Failed to read snapshot: {e}"))
        })?;

        let snapshot: InventorySnapshot = serde_json::from_str(&content).map_err(|e| {
            LeaseError::Storage(StorageError::Corrupted {
                message: format!("Failed to parse snapshot file: {e}"),
            })
        })?;

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &InventorySnapshot) -> Result<()> {
        self.ensure_dir().await?;

        debug!("Saving snapshot to: {}", self.snapshot_path.display());

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            StorageError::serialization(format!("Failed to serialize snapshot: {e}"))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.snapshot_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StorageError::file(&temp_path, format!("Failed to create temp snapshot: {e}"))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StorageError::file(&temp_path, format!("Failed to write snapshot: {e}"))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::file(&temp_path, format!("Failed to sync snapshot: {e}"))
        })?;

        fs::rename(&temp_path, &self.snapshot_path).await.map_err(|e| {
            StorageError::file(&self.snapshot_path, format!("Failed to rename snapshot: {e}"))
        })?;

        debug!("Snapshot saved successfully");
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot_path.exists())
    }

    async fn check_available(&self) -> Result<()> {
        let metadata = fs::metadata(&self.snapshot_path)
            .await
            .map_err(|e| StorageError::file(&self.snapshot_path, e.to_string()))?;

        if !metadata.is_file() {
            return Err(StorageError::file(&self.snapshot_path, "not a regular file").into());
        }
        if metadata.permissions().readonly() {
            return Err(StorageError::file(&self.snapshot_path, "read-only").into());
        }

        // Opening for append proves write permission without touching content
        fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.snapshot_path)
            .await
            .map_err(|e| StorageError::file(&self.snapshot_path, e.to_string()))?;

        Ok(())
    }

    fn location(&self) -> String {
        self.snapshot_path.display().to_string()
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{GpuRecord, PhysicalGpu};
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalSnapshotStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalSnapshotStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn snapshot() -> InventorySnapshot {
        let now = Utc::now();
        InventorySnapshot::new(
            vec![PhysicalGpu::from_record(GpuRecord::new("g1"), now)],
            Vec::new(),
            now,
        )
        .expect("snapshot failed")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let snapshot = snapshot();
        store.save(&snapshot).await.expect("Failed to save snapshot");

        let loaded = store
            .load()
            .await
            .expect("Failed to load snapshot")
            .expect("Snapshot should exist");

        assert_eq!(loaded, snapshot);
        loaded.verify().expect("verify failed");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_load_garbage_is_corrupted() {
        let (store, _temp) = create_test_store();
        std::fs::write(store.snapshot_path(), "not json").expect("write failed");

        let result = store.load().await;
        assert!(matches!(
            result,
            Err(LeaseError::Storage(StorageError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_check_available_requires_file() {
        let (store, _temp) = create_test_store();
        assert!(store.check_available().await.is_err());
        assert!(!store.exists().await.expect("exists check failed"));

        store.save(&snapshot()).await.expect("Failed to save snapshot");
        store.check_available().await.expect("should be available");
        assert!(store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_check_available_rejects_read_only() {
        let (store, _temp) = create_test_store();
        store.save(&snapshot()).await.expect("Failed to save snapshot");

        let mut permissions = std::fs::metadata(store.snapshot_path())
            .expect("metadata failed")
            .permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(store.snapshot_path(), permissions).expect("chmod failed");

        assert!(store.check_available().await.is_err());
    }

    #[tokio::test]
    async fn test_with_snapshot_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("gpus.json");
        let store = LocalSnapshotStore::with_snapshot_path(&path);

        store.save(&snapshot()).await.expect("Failed to save snapshot");
        assert!(path.exists());
        assert_eq!(store.location(), path.display().to_string());
        assert_eq!(store.backend_type(), "local");
    }
}

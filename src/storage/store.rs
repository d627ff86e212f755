//! Snapshot store trait definition.
//!
//! This module defines the common interface for snapshot storage backends.

use async_trait::async_trait;

use crate::error::Result;
use super::types::InventorySnapshot;

/// Trait for snapshot storage backends.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads the inventory snapshot.
    ///
    /// Returns `None` if no snapshot exists yet.
    async fn load(&self) -> Result<Option<InventorySnapshot>>;

    /// Saves the inventory snapshot.
    async fn save(&self, snapshot: &InventorySnapshot) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Checks that the snapshot exists and can be read and written.
    ///
    /// Must not modify the snapshot.
    async fn check_available(&self) -> Result<()>;

    /// Human-readable location of the snapshot.
    fn location(&self) -> String;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

//! Durable inventory snapshots.
//!
//! This module provides the snapshot format, the storage backends, and the
//! persistence guard that fails over from the primary to the backup endpoint.

mod guard;
mod hash;
mod local;
mod probe;
mod s3;
mod store;
mod types;

pub use guard::{
    DEFAULT_PROBE_TIMEOUT, Endpoint, EndpointHealth, EndpointRole, PersistenceGuard,
    StorageHealth,
};
pub use hash::SnapshotHasher;
pub use local::{LocalSnapshotStore, SNAPSHOT_FILE, STATE_DIR};
pub use probe::{AvailabilityProbe, StoreProbe};
pub use s3::S3SnapshotStore;
pub use store::SnapshotStore;
pub use types::{InventorySnapshot, SNAPSHOT_VERSION};

//! Persistence guard choosing between the primary and backup endpoints.
//!
//! The guard is polled: callers ask it for an endpoint before every durable
//! read or write. The primary wins whenever it is available. While it is not,
//! the backup is used and the moment of failover is recorded until the
//! primary comes back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{LeaseError, Result, StorageError};
use crate::events::{EventSink, LifecycleEvent, NoopEventSink};

use super::probe::{AvailabilityProbe, StoreProbe};
use super::store::SnapshotStore;
use super::types::InventorySnapshot;

/// Default upper bound for a single availability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Role of a storage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Preferred endpoint.
    Primary,
    /// Fallback endpoint.
    Backup,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// A snapshot store together with its role.
#[derive(Clone)]
pub struct Endpoint {
    role: EndpointRole,
    store: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("location", &self.store.location())
            .finish()
    }
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(role: EndpointRole, store: Arc<dyn SnapshotStore>) -> Self {
        Self { role, store }
    }

    /// Role of this endpoint.
    #[must_use]
    pub const fn role(&self) -> EndpointRole {
        self.role
    }

    /// Underlying snapshot store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Human-readable location.
    #[must_use]
    pub fn location(&self) -> String {
        self.store.location()
    }
}

/// Probe result for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    /// Endpoint role.
    pub role: EndpointRole,
    /// Backend type name.
    pub backend: &'static str,
    /// Human-readable location.
    pub location: String,
    /// Whether the probe succeeded.
    pub available: bool,
}

/// Health of both endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StorageHealth {
    /// Primary endpoint.
    pub primary: EndpointHealth,
    /// Backup endpoint.
    pub backup: EndpointHealth,
    /// Endpoint the next operation would use, if any.
    pub active: Option<EndpointRole>,
    /// When failover was recorded, if the guard is on the backup.
    pub failover_since: Option<DateTime<Utc>>,
}

/// Chooses the authoritative snapshot endpoint.
pub struct PersistenceGuard {
    primary: Endpoint,
    backup: Endpoint,
    probe: Arc<dyn AvailabilityProbe>,
    probe_timeout: Duration,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    /// Failover timestamp, `None` while on the primary.
    failover: Mutex<Option<DateTime<Utc>>>,
}

impl PersistenceGuard {
    /// Creates a guard over two stores with the default probe and clock.
    #[must_use]
    pub fn new(primary: Arc<dyn SnapshotStore>, backup: Arc<dyn SnapshotStore>) -> Self {
        Self {
            primary: Endpoint::new(EndpointRole::Primary, primary),
            backup: Endpoint::new(EndpointRole::Backup, backup),
            probe: Arc::new(StoreProbe),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            failover: Mutex::new(None),
        }
    }

    /// Replaces the availability probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn AvailabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Sets the upper bound for a single probe call.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replaces the clock used for failover timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Primary endpoint.
    #[must_use]
    pub const fn primary(&self) -> &Endpoint {
        &self.primary
    }

    /// Backup endpoint.
    #[must_use]
    pub const fn backup(&self) -> &Endpoint {
        &self.backup
    }

    /// Returns the endpoint to use for the current operation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if neither endpoint is available.
    pub async fn select_endpoint(&self) -> Result<&Endpoint> {
        if self.probe(&self.primary).await {
            self.mark_primary().await;
            return Ok(&self.primary);
        }

        if self.probe(&self.backup).await {
            self.mark_failover().await;
            return Ok(&self.backup);
        }

        warn!("Neither storage endpoint is available");
        Err(Self::unavailable("neither primary nor backup endpoint is available"))
    }

    /// Switches back to the primary if it has become available again.
    ///
    /// Keeps using the backup otherwise.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if neither endpoint is available.
    pub async fn attempt_recovery(&self) -> Result<&Endpoint> {
        let endpoint = self.select_endpoint().await?;
        if endpoint.role() == EndpointRole::Backup {
            debug!("Primary still unavailable, staying on backup");
        }
        Ok(endpoint)
    }

    /// When failover to the backup was recorded, if it is in effect.
    pub async fn failover_since(&self) -> Option<DateTime<Utc>> {
        *self.failover.lock().await
    }

    /// Returns true while the backup is authoritative.
    pub async fn is_failed_over(&self) -> bool {
        self.failover.lock().await.is_some()
    }

    /// Loads and verifies the snapshot from the selected endpoint.
    ///
    /// Failover state does not outlive the process, so when the primary is
    /// selected a reachable backup is read too. If the backup holds a newer
    /// valid snapshot it wins and is copied back to the primary.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is available or the selected snapshot
    /// is unreadable, corrupted, or from another format version.
    pub async fn read_snapshot(&self) -> Result<Option<InventorySnapshot>> {
        let endpoint = self.select_endpoint().await?;
        debug!("Reading snapshot from {} ({})", endpoint.location(), endpoint.role());

        let snapshot = Self::load_verified(endpoint).await?;
        if endpoint.role() == EndpointRole::Backup || !self.probe(&self.backup).await {
            return Ok(snapshot);
        }

        let backup = match Self::load_verified(&self.backup).await {
            Ok(Some(backup)) => backup,
            Ok(None) => return Ok(snapshot),
            Err(e) => {
                warn!("Ignoring unreadable backup snapshot: {e}");
                return Ok(snapshot);
            }
        };

        let backup_is_newer = snapshot
            .as_ref()
            .is_none_or(|primary| backup.saved_at > primary.saved_at);
        if !backup_is_newer {
            return Ok(snapshot);
        }

        warn!(
            "Backup snapshot from {} is newer than the primary, copying it back",
            backup.saved_at
        );
        if let Err(e) = self.primary.store().save(&backup).await {
            warn!("Could not rewrite primary snapshot: {e}");
        }
        Ok(Some(backup))
    }

    /// Saves the snapshot to the selected endpoint.
    ///
    /// A save that fails on the primary is retried once on the backup.
    /// Returns the role of the endpoint that accepted the write.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if no endpoint accepted the write.
    pub async fn write_snapshot(&self, snapshot: &InventorySnapshot) -> Result<EndpointRole> {
        let endpoint = self.select_endpoint().await?;

        let primary_error = match endpoint.store().save(snapshot).await {
            Ok(()) => {
                debug!("Snapshot written to {}", endpoint.location());
                return Ok(endpoint.role());
            }
            Err(e) if endpoint.role() == EndpointRole::Primary => e,
            Err(e) => {
                return Err(Self::unavailable(format!("backup write failed: {e}")));
            }
        };

        warn!("Primary write failed, retrying on backup: {primary_error}");
        if !self.probe(&self.backup).await {
            return Err(Self::unavailable(format!(
                "primary write failed ({primary_error}) and backup is unavailable"
            )));
        }

        self.backup.store().save(snapshot).await.map_err(|e| {
            Self::unavailable(format!(
                "primary write failed ({primary_error}), backup write failed ({e})"
            ))
        })?;
        self.mark_failover().await;
        Ok(EndpointRole::Backup)
    }

    /// Creates a snapshot on every endpoint that does not have one yet.
    ///
    /// Returns the roles that were initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be checked or a new one
    /// cannot be written.
    pub async fn initialize(&self, snapshot: &InventorySnapshot) -> Result<Vec<EndpointRole>> {
        let mut initialized = Vec::new();
        for endpoint in [&self.primary, &self.backup] {
            if endpoint.store().exists().await? {
                debug!("Snapshot already present at {}", endpoint.location());
                continue;
            }
            endpoint.store().save(snapshot).await?;
            info!("Initialized {} snapshot at {}", endpoint.role(), endpoint.location());
            initialized.push(endpoint.role());
        }
        Ok(initialized)
    }

    /// Probes both endpoints without changing failover state.
    pub async fn health(&self) -> StorageHealth {
        let primary = self.endpoint_health(&self.primary).await;
        let backup = self.endpoint_health(&self.backup).await;

        let active = if primary.available {
            Some(EndpointRole::Primary)
        } else if backup.available {
            Some(EndpointRole::Backup)
        } else {
            None
        };

        StorageHealth {
            primary,
            backup,
            active,
            failover_since: self.failover_since().await,
        }
    }

    async fn endpoint_health(&self, endpoint: &Endpoint) -> EndpointHealth {
        EndpointHealth {
            role: endpoint.role(),
            backend: endpoint.store().backend_type(),
            location: endpoint.location(),
            available: self.probe(endpoint).await,
        }
    }

    async fn load_verified(endpoint: &Endpoint) -> Result<Option<InventorySnapshot>> {
        let snapshot = endpoint.store().load().await?;
        if let Some(snapshot) = &snapshot {
            snapshot.verify()?;
        }
        Ok(snapshot)
    }

    /// Runs the probe bounded by the configured timeout.
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.probe.is_available(endpoint)).await {
            Ok(available) => available,
            Err(_) => {
                debug!(
                    "Probe of {} timed out after {}ms",
                    endpoint.location(),
                    self.probe_timeout.as_millis()
                );
                false
            }
        }
    }

    async fn mark_primary(&self) {
        let recovered = self.failover.lock().await.take().is_some();
        if recovered {
            info!("Primary storage recovered: {}", self.primary.location());
            self.events.emit(LifecycleEvent::StorageRecovered {
                location: self.primary.location(),
            });
        }
    }

    async fn mark_failover(&self) {
        let started = {
            let mut failover = self.failover.lock().await;
            if failover.is_some() {
                None
            } else {
                let at = self.clock.now();
                *failover = Some(at);
                Some(at)
            }
        };

        if let Some(at) = started {
            warn!("Primary storage unavailable, failing over to {}", self.backup.location());
            self.events.emit(LifecycleEvent::StorageFailover {
                location: self.backup.location(),
                at,
            });
        }
    }

    fn unavailable(message: impl Into<String>) -> LeaseError {
        StorageError::unavailable(message).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::ChannelEventSink;
    use crate::inventory::{GpuRecord, PhysicalGpu};
    use crate::storage::local::LocalSnapshotStore;
    use crate::storage::probe::MockAvailabilityProbe;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid time")
    }

    fn empty_snapshot() -> InventorySnapshot {
        InventorySnapshot::empty(start()).expect("snapshot failed")
    }

    /// Two local stores in one temp dir, both initialized.
    async fn local_pair() -> (Arc<LocalSnapshotStore>, Arc<LocalSnapshotStore>, TempDir) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let primary = Arc::new(LocalSnapshotStore::with_base_dir(temp.path().join("primary")));
        let backup = Arc::new(LocalSnapshotStore::with_base_dir(temp.path().join("backup")));
        primary.save(&empty_snapshot()).await.expect("save failed");
        backup.save(&empty_snapshot()).await.expect("save failed");
        (primary, backup, temp)
    }

    /// Probe driven by two switches.
    #[derive(Default)]
    struct SwitchProbe {
        primary_down: AtomicBool,
        backup_down: AtomicBool,
    }

    #[async_trait]
    impl AvailabilityProbe for SwitchProbe {
        async fn is_available(&self, endpoint: &Endpoint) -> bool {
            match endpoint.role() {
                EndpointRole::Primary => !self.primary_down.load(Ordering::SeqCst),
                EndpointRole::Backup => !self.backup_down.load(Ordering::SeqCst),
            }
        }
    }

    /// Probe that never answers in time.
    struct SlowProbe;

    #[async_trait]
    impl AvailabilityProbe for SlowProbe {
        async fn is_available(&self, _endpoint: &Endpoint) -> bool {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        }
    }

    /// Store that reports itself available but rejects every write.
    struct ReadOnlyStore;

    #[async_trait]
    impl SnapshotStore for ReadOnlyStore {
        async fn load(&self) -> Result<Option<InventorySnapshot>> {
            Ok(None)
        }

        async fn save(&self, _snapshot: &InventorySnapshot) -> Result<()> {
            Err(StorageError::file("/ro/inventory.json", "disk full").into())
        }

        async fn exists(&self) -> Result<bool> {
            Ok(true)
        }

        async fn check_available(&self) -> Result<()> {
            Ok(())
        }

        fn location(&self) -> String {
            String::from("/ro/inventory.json")
        }

        fn backend_type(&self) -> &'static str {
            "readonly"
        }
    }

    #[tokio::test]
    async fn test_primary_preferred() {
        let (primary, backup, _temp) = local_pair().await;
        let mut probe = MockAvailabilityProbe::new();
        probe.expect_is_available().returning(|_| true);

        let guard = PersistenceGuard::new(primary, backup).with_probe(Arc::new(probe));

        let endpoint = guard.select_endpoint().await.expect("select failed");
        assert_eq!(endpoint.role(), EndpointRole::Primary);
        assert!(guard.failover_since().await.is_none());
    }

    #[tokio::test]
    async fn test_failover_to_backup_records_timestamp() {
        let (primary, backup, _temp) = local_pair().await;
        let mut probe = MockAvailabilityProbe::new();
        probe
            .expect_is_available()
            .returning(|endpoint| endpoint.role() == EndpointRole::Backup);
        let clock = Arc::new(ManualClock::new(start()));

        let guard = PersistenceGuard::new(primary, backup)
            .with_probe(Arc::new(probe))
            .with_clock(clock.clone());

        let endpoint = guard.select_endpoint().await.expect("select failed");
        assert_eq!(endpoint.role(), EndpointRole::Backup);
        assert_eq!(guard.failover_since().await, Some(start()));

        // The first failover timestamp is kept
        clock.advance(chrono::Duration::minutes(5));
        guard.select_endpoint().await.expect("select failed");
        assert_eq!(guard.failover_since().await, Some(start()));
    }

    #[tokio::test]
    async fn test_both_unavailable() {
        let (primary, backup, _temp) = local_pair().await;
        let mut probe = MockAvailabilityProbe::new();
        probe.expect_is_available().times(2).returning(|_| false);

        let guard = PersistenceGuard::new(primary, backup).with_probe(Arc::new(probe));

        let err = guard.select_endpoint().await.expect_err("should fail");
        assert!(err.is_storage_unavailable());
        assert!(guard.failover_since().await.is_none());
    }

    #[tokio::test]
    async fn test_recovery_clears_failover() {
        let (primary, backup, _temp) = local_pair().await;
        let probe = Arc::new(SwitchProbe::default());
        let (sink, mut events) = ChannelEventSink::new(8);

        let guard = PersistenceGuard::new(primary, backup)
            .with_probe(probe.clone())
            .with_events(Arc::new(sink));

        probe.primary_down.store(true, Ordering::SeqCst);
        assert_eq!(
            guard.attempt_recovery().await.expect("recovery failed").role(),
            EndpointRole::Backup
        );
        assert!(guard.is_failed_over().await);

        probe.primary_down.store(false, Ordering::SeqCst);
        assert_eq!(
            guard.attempt_recovery().await.expect("recovery failed").role(),
            EndpointRole::Primary
        );
        assert!(!guard.is_failed_over().await);

        let first = events.try_recv().expect("missing failover event");
        assert_eq!(first.name(), "storage_failover");
        let second = events.try_recv().expect("missing recovery event");
        assert_eq!(second.name(), "storage_recovered");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_unavailable() {
        let (primary, backup, _temp) = local_pair().await;
        let guard = PersistenceGuard::new(primary, backup)
            .with_probe(Arc::new(SlowProbe))
            .with_probe_timeout(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let err = guard.select_endpoint().await.expect_err("should time out");

        assert!(err.is_storage_unavailable());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_primary_file_removed_then_restored() {
        let (primary, backup, _temp) = local_pair().await;
        let primary_path = primary.snapshot_path().to_path_buf();
        let guard = PersistenceGuard::new(primary, backup);

        assert_eq!(
            guard.select_endpoint().await.expect("select failed").role(),
            EndpointRole::Primary
        );

        let saved = std::fs::read(&primary_path).expect("read failed");
        std::fs::remove_file(&primary_path).expect("remove failed");
        assert_eq!(
            guard.select_endpoint().await.expect("select failed").role(),
            EndpointRole::Backup
        );
        assert!(guard.failover_since().await.is_some());

        std::fs::write(&primary_path, saved).expect("restore failed");
        assert_eq!(
            guard.attempt_recovery().await.expect("recovery failed").role(),
            EndpointRole::Primary
        );
        assert!(guard.failover_since().await.is_none());
    }

    #[tokio::test]
    async fn test_write_retries_on_backup() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let backup = Arc::new(LocalSnapshotStore::with_base_dir(temp.path()));
        backup.save(&empty_snapshot()).await.expect("save failed");

        let guard = PersistenceGuard::new(Arc::new(ReadOnlyStore), backup.clone());

        let role = guard
            .write_snapshot(&empty_snapshot())
            .await
            .expect("write failed");

        assert_eq!(role, EndpointRole::Backup);
        assert!(guard.is_failed_over().await);
        assert!(backup.load().await.expect("load failed").is_some());
    }

    #[tokio::test]
    async fn test_write_fails_when_nothing_accepts() {
        let guard = PersistenceGuard::new(Arc::new(ReadOnlyStore), Arc::new(ReadOnlyStore));

        let err = guard
            .write_snapshot(&empty_snapshot())
            .await
            .expect_err("write should fail");

        assert!(err.is_storage_unavailable());
    }

    #[tokio::test]
    async fn test_read_rejects_tampered_snapshot() {
        let (primary, backup, _temp) = local_pair().await;
        let mut tampered = empty_snapshot();
        tampered.checksum = String::from("deadbeef");
        primary.save(&tampered).await.expect("save failed");

        let guard = PersistenceGuard::new(primary, backup);

        let err = guard.read_snapshot().await.expect_err("should reject");
        assert!(matches!(
            err,
            LeaseError::Storage(StorageError::ChecksumMismatch { .. })
        ));
    }

    fn snapshot_with(gpu_id: &str, saved_at: DateTime<Utc>) -> InventorySnapshot {
        InventorySnapshot::new(
            vec![PhysicalGpu::from_record(GpuRecord::new(gpu_id), saved_at)],
            Vec::new(),
            saved_at,
        )
        .expect("snapshot failed")
    }

    #[tokio::test]
    async fn test_read_prefers_newer_backup_after_restart() {
        let (primary, backup, _temp) = local_pair().await;
        let later = start() + chrono::Duration::hours(1);
        backup
            .save(&snapshot_with("g1", later))
            .await
            .expect("save failed");

        // A fresh guard has no memory of the earlier failover
        let guard = PersistenceGuard::new(primary.clone(), backup);
        assert!(!guard.is_failed_over().await);

        let snapshot = guard
            .read_snapshot()
            .await
            .expect("read failed")
            .expect("missing snapshot");
        assert_eq!(snapshot.saved_at, later);
        assert_eq!(snapshot.gpus[0].id, "g1");

        let rewritten = primary
            .load()
            .await
            .expect("load failed")
            .expect("missing snapshot");
        assert_eq!(rewritten, snapshot);
    }

    #[tokio::test]
    async fn test_read_keeps_primary_when_backup_is_older_or_broken() {
        let (primary, backup, _temp) = local_pair().await;
        let later = start() + chrono::Duration::hours(1);
        primary
            .save(&snapshot_with("g1", later))
            .await
            .expect("save failed");

        let guard = PersistenceGuard::new(primary.clone(), backup.clone());
        let snapshot = guard.read_snapshot().await.expect("read failed");
        assert_eq!(snapshot.map(|s| s.saved_at), Some(later));

        let mut tampered = snapshot_with("g2", later + chrono::Duration::hours(1));
        tampered.checksum = String::from("deadbeef");
        backup.save(&tampered).await.expect("save failed");

        let snapshot = guard
            .read_snapshot()
            .await
            .expect("read failed")
            .expect("missing snapshot");
        assert_eq!(snapshot.gpus[0].id, "g1");
    }

    #[tokio::test]
    async fn test_initialize_creates_missing_snapshots() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let primary = Arc::new(LocalSnapshotStore::with_base_dir(temp.path().join("p")));
        let backup = Arc::new(LocalSnapshotStore::with_base_dir(temp.path().join("b")));
        let guard = PersistenceGuard::new(primary, backup);

        assert!(guard.select_endpoint().await.is_err());

        let created = guard
            .initialize(&empty_snapshot())
            .await
            .expect("initialize failed");
        assert_eq!(created, vec![EndpointRole::Primary, EndpointRole::Backup]);

        let again = guard
            .initialize(&empty_snapshot())
            .await
            .expect("initialize failed");
        assert!(again.is_empty());

        let health = guard.health().await;
        assert!(health.primary.available);
        assert!(health.backup.available);
        assert_eq!(health.active, Some(EndpointRole::Primary));
    }
}

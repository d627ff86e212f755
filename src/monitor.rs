//! Periodic storage health monitoring.
//!
//! The monitor polls the persistence guard on a fixed interval. When the
//! primary comes back after a failover it rewrites the snapshot there, and
//! while the manager holds unsaved changes it retries the write.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{LeaseError, Result};
use crate::lifecycle::LifecycleManager;
use crate::storage::{EndpointRole, PersistenceGuard};

/// Background task that keeps storage in sync with memory.
pub struct StorageMonitor {
    manager: Arc<LifecycleManager>,
    guard: Arc<PersistenceGuard>,
    interval: Duration,
}

/// Handle to a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StorageMonitor {
    /// Creates a monitor for the manager's persistence guard.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has no persistence guard.
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration) -> Result<Self> {
        let guard = manager
            .guard()
            .cloned()
            .ok_or_else(|| LeaseError::internal("storage monitor needs a persistence guard"))?;

        Ok(Self {
            manager,
            guard,
            interval,
        })
    }

    /// Runs one health check.
    ///
    /// Returns the endpoint now in use.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if no endpoint can be used or
    /// pending changes cannot be written.
    pub async fn check_once(&self) -> Result<EndpointRole> {
        let was_failed_over = self.guard.is_failed_over().await;
        let role = self.guard.attempt_recovery().await?.role();

        if was_failed_over && role == EndpointRole::Primary {
            info!("Primary storage is back, rewriting snapshot");
            self.manager.persist().await?;
        } else if self.manager.flush_if_dirty().await? {
            debug!("Pending changes written to {role}");
        }

        Ok(role)
    }

    /// Starts the monitor on the current runtime.
    #[must_use]
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                "Storage monitor started (every {}s)",
                self.interval.as_secs_f64()
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_once().await {
                            warn!("Storage health check failed: {e}");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Storage monitor stopped");
        });

        MonitorHandle { shutdown, task }
    }
}

impl MonitorHandle {
    /// Stops the monitor and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor task panicked.
    pub async fn shutdown(self) -> Result<()> {
        // A closed receiver means the task already ended
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| LeaseError::internal(format!("storage monitor task failed: {e}")))
    }
}

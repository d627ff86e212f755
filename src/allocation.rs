//! Allocation engine granting exclusive GPU assignment.
//!
//! Allocation picks the first `available` GPU in registration order. There is
//! no scoring and no queueing: a request either succeeds immediately or fails
//! with `NoCapacity` and the caller retries.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::inventory::{GpuTransition, InventoryRegistry, PhysicalGpu};

/// Grants and revokes exclusive GPU assignments.
#[derive(Clone)]
pub struct AllocationEngine {
    /// Inventory the engine allocates from.
    registry: Arc<InventoryRegistry>,
}

impl AllocationEngine {
    /// Creates an engine over the given registry.
    #[must_use]
    pub const fn new(registry: Arc<InventoryRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<InventoryRegistry> {
        &self.registry
    }

    /// Allocates the first available GPU to `consumer_id`.
    ///
    /// # Errors
    ///
    /// Returns `NoCapacity` if no GPU is available.
    pub async fn allocate(&self, consumer_id: &str) -> Result<PhysicalGpu> {
        let gpu = self.registry.claim_first_available(consumer_id).await?;
        info!("Allocated GPU {} to {consumer_id}", gpu.id);
        Ok(gpu)
    }

    /// Allocates a specific GPU to `consumer_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `GpuUnavailable` if the GPU
    /// is not available.
    pub async fn allocate_specific(&self, consumer_id: &str, gpu_id: &str) -> Result<PhysicalGpu> {
        let gpu = self.registry.claim(gpu_id, consumer_id).await?;
        info!("Allocated GPU {gpu_id} to {consumer_id}");
        Ok(gpu)
    }

    /// Returns an allocated GPU to the pool.
    ///
    /// Returns `false` if the GPU exists but was not allocated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn release(&self, gpu_id: &str) -> Result<bool> {
        Ok(self.release_held(gpu_id, None).await?.is_some())
    }

    /// Releases `gpu_id` only if it is allocated to `consumer_id` (or to
    /// anyone when `consumer_id` is `None`).
    pub(crate) async fn release_held(
        &self,
        gpu_id: &str,
        consumer_id: Option<&str>,
    ) -> Result<Option<GpuTransition>> {
        let released = self.registry.release_if_held(gpu_id, consumer_id).await?;
        match &released {
            Some(t) => info!(
                "Released GPU {gpu_id} from {}",
                t.previous_assignee.as_deref().unwrap_or("unknown")
            ),
            None => debug!("GPU {gpu_id} was not allocated, nothing to release"),
        }
        Ok(released)
    }

    /// Lists GPUs currently allocated to `consumer_id`.
    pub async fn assigned_to(&self, consumer_id: &str) -> Vec<PhysicalGpu> {
        self.registry
            .list_all()
            .await
            .into_iter()
            .filter(|g| g.is_held_by(consumer_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::{AllocationError, LeaseError, LifecycleError};
    use crate::inventory::{GpuRecord, GpuState};
    use std::collections::HashSet;

    async fn engine_with(ids: &[&str]) -> AllocationEngine {
        let registry = Arc::new(InventoryRegistry::new(Arc::new(SystemClock)));
        registry
            .register_physical_gpus(ids.iter().map(|id| GpuRecord::new(*id)).collect())
            .await
            .expect("register failed");
        AllocationEngine::new(registry)
    }

    #[tokio::test]
    async fn test_first_fit_until_exhausted() {
        let engine = engine_with(&["g1", "g2"]).await;

        let alice = engine.allocate("alice").await.expect("alice failed");
        assert_eq!(alice.id, "g1");
        assert_eq!(alice.state, GpuState::Allocated);
        assert_eq!(alice.assigned_to.as_deref(), Some("alice"));

        let bob = engine.allocate("bob").await.expect("bob failed");
        assert_eq!(bob.id, "g2");

        let carol = engine.allocate("carol").await;
        assert!(matches!(
            carol,
            Err(LeaseError::Allocation(AllocationError::NoCapacity))
        ));
    }

    #[tokio::test]
    async fn test_release_makes_gpu_reusable() {
        let engine = engine_with(&["g1", "g2"]).await;
        engine.allocate("alice").await.expect("alice failed");
        engine.allocate("bob").await.expect("bob failed");

        assert!(engine.release("g1").await.expect("release failed"));
        let g1 = engine.registry().get("g1").await.expect("g1 missing");
        assert_eq!(g1.state, GpuState::Available);
        assert!(g1.assigned_to.is_none());

        let carol = engine.allocate("carol").await.expect("carol failed");
        assert_eq!(carol.id, "g1");
    }

    #[tokio::test]
    async fn test_allocate_then_release_round_trip() {
        let engine = engine_with(&["g1"]).await;
        let before = engine.registry().get("g1").await.expect("g1 missing");

        engine.allocate("alice").await.expect("allocate failed");
        engine.release("g1").await.expect("release failed");

        let after = engine.registry().get("g1").await.expect("g1 missing");
        assert_eq!(after.status(), before.status());
        assert_eq!(after.model, before.model);
    }

    #[tokio::test]
    async fn test_release_unknown_and_idle() {
        let engine = engine_with(&["g1"]).await;

        let unknown = engine.release("nope").await;
        assert!(matches!(
            unknown,
            Err(LeaseError::Lifecycle(LifecycleError::NotFound { .. }))
        ));

        assert!(!engine.release("g1").await.expect("release failed"));
    }

    #[tokio::test]
    async fn test_release_held_checks_consumer() {
        let engine = engine_with(&["g1"]).await;
        engine.allocate("alice").await.expect("allocate failed");

        let wrong = engine
            .release_held("g1", Some("bob"))
            .await
            .expect("release failed");
        assert!(wrong.is_none());

        let right = engine
            .release_held("g1", Some("alice"))
            .await
            .expect("release failed")
            .expect("should release");
        assert_eq!(right.previous_assignee.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_allocate_specific() {
        let engine = engine_with(&["g1", "g2"]).await;

        let gpu = engine
            .allocate_specific("alice", "g2")
            .await
            .expect("allocate failed");
        assert_eq!(gpu.id, "g2");

        let taken = engine.allocate_specific("bob", "g2").await;
        assert!(matches!(
            taken,
            Err(LeaseError::Allocation(AllocationError::GpuUnavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_assigned_to_filter() {
        let engine = engine_with(&["g1", "g2", "g3"]).await;
        engine.allocate("alice").await.expect("allocate failed");
        engine.allocate("bob").await.expect("allocate failed");
        engine.allocate("alice").await.expect("allocate failed");

        let ids: Vec<String> = engine
            .assigned_to("alice")
            .await
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert_eq!(ids, vec!["g1", "g3"]);
        assert!(engine.assigned_to("carol").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_share_a_gpu() {
        const GPUS: usize = 8;
        const REQUESTS: usize = 64;

        let ids: Vec<String> = (0..GPUS).map(|i| format!("g{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let engine = engine_with(&id_refs).await;

        let mut handles = Vec::with_capacity(REQUESTS);
        for i in 0..REQUESTS {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let consumer = format!("user-{i}");
                tokio::task::yield_now().await;
                engine.allocate(&consumer).await.ok().map(|g| (g.id, consumer))
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            if let Some(grant) = handle.await.expect("task panicked") {
                granted.push(grant);
            }
        }

        assert_eq!(granted.len(), GPUS);
        let distinct: HashSet<&str> = granted.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(distinct.len(), GPUS);

        let allocated = engine.registry().list_by_state(GpuState::Allocated).await;
        assert_eq!(allocated.len(), granted.len());
        for (gpu_id, consumer) in &granted {
            let gpu = engine.registry().get(gpu_id).await.expect("gpu missing");
            assert!(gpu.is_held_by(consumer));
        }
    }
}

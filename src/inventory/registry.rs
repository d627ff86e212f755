//! Thread-safe registry of physical GPUs.
//!
//! Records are kept in registration order in an arena addressed by GPU id.
//! Every mutation goes through [`InventoryRegistry::apply_transition`] or one
//! of the claim helpers, all of which run under the registry write lock so a
//! scan-then-mutate sequence is atomic.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{AllocationError, EntityKind, LifecycleError, Result};
use crate::lifecycle::StateMachine;

use super::types::{GpuRecord, GpuState, PhysicalGpu};

/// Outcome of a GPU state change.
#[derive(Debug, Clone)]
pub(crate) struct GpuTransition {
    /// State before the change.
    pub from: GpuState,
    /// Assignee before the change.
    pub previous_assignee: Option<String>,
    /// Record after the change.
    pub gpu: PhysicalGpu,
}

/// Summary of a merge import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Ids not previously known.
    pub added: usize,
    /// Known ids whose descriptive fields were refreshed.
    pub refreshed: usize,
}

#[derive(Debug, Default)]
struct Inventory {
    records: Vec<PhysicalGpu>,
    index: HashMap<String, usize>,
}

impl Inventory {
    fn from_records(records: Vec<PhysicalGpu>) -> std::result::Result<Self, LifecycleError> {
        let mut index = HashMap::with_capacity(records.len());
        for (position, gpu) in records.iter().enumerate() {
            if index.insert(gpu.id.clone(), position).is_some() {
                return Err(LifecycleError::DuplicateGpuId {
                    gpu_id: gpu.id.clone(),
                });
            }
        }
        Ok(Self { records, index })
    }

    fn get(&self, gpu_id: &str) -> Option<&PhysicalGpu> {
        self.index.get(gpu_id).map(|&i| &self.records[i])
    }

    fn remove(&mut self, gpu_id: &str) -> std::result::Result<PhysicalGpu, LifecycleError> {
        let position = self
            .index
            .remove(gpu_id)
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id))?;
        let removed = self.records.remove(position);
        for (i, gpu) in self.records.iter().enumerate().skip(position) {
            self.index.insert(gpu.id.clone(), i);
        }
        Ok(removed)
    }

    fn transition(
        &mut self,
        gpu_id: &str,
        new_state: GpuState,
        assigned_to: Option<&str>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> std::result::Result<GpuTransition, LifecycleError> {
        let position = *self
            .index
            .get(gpu_id)
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id))?;
        let gpu = &mut self.records[position];

        if !gpu.state.can_transition_to(new_state) {
            return Err(LifecycleError::invalid_transition(
                EntityKind::Gpu,
                gpu_id,
                gpu.state,
                new_state,
            ));
        }

        match (new_state, assigned_to) {
            (GpuState::Allocated, None) => {
                return Err(LifecycleError::MissingAssignee {
                    gpu_id: gpu_id.to_string(),
                });
            }
            (state, Some(_)) if state != GpuState::Allocated => {
                return Err(LifecycleError::UnexpectedAssignee {
                    gpu_id: gpu_id.to_string(),
                    state: state.to_string(),
                });
            }
            _ => {}
        }

        let from = gpu.state;
        let previous_assignee = gpu.assigned_to.take();
        gpu.state = new_state;
        gpu.assigned_to = assigned_to.map(ToString::to_string);
        gpu.updated_at = now;

        Ok(GpuTransition {
            from,
            previous_assignee,
            gpu: gpu.clone(),
        })
    }
}

fn first_duplicate(records: &[GpuRecord]) -> Option<String> {
    let mut seen = std::collections::HashSet::with_capacity(records.len());
    records
        .iter()
        .find(|r| !seen.insert(r.id.as_str()))
        .map(|r| r.id.clone())
}

/// Authoritative in-memory GPU inventory.
pub struct InventoryRegistry {
    inner: RwLock<Inventory>,
    clock: Arc<dyn Clock>,
}

impl InventoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inventory::default()),
            clock,
        }
    }

    /// Replaces the entire inventory.
    ///
    /// Every record starts `available` with no assignee. Prior state,
    /// including allocations, is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if `records` contains the same id twice.
    pub async fn register_physical_gpus(&self, records: Vec<GpuRecord>) -> Result<usize> {
        let now = self.clock.now();
        let gpus: Vec<PhysicalGpu> = records
            .into_iter()
            .map(|r| PhysicalGpu::from_record(r, now))
            .collect();
        let inventory = Inventory::from_records(gpus)?;
        let count = inventory.records.len();

        *self.inner.write().await = inventory;
        info!("Registered {count} physical GPUs");
        Ok(count)
    }

    /// Adds unknown GPUs and refreshes descriptive fields of known ones.
    ///
    /// State and assignment of known GPUs are preserved, and GPUs missing
    /// from `records` are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if `records` contains the same id twice.
    pub async fn merge_physical_gpus(&self, records: Vec<GpuRecord>) -> Result<MergeSummary> {
        if let Some(gpu_id) = first_duplicate(&records) {
            return Err(LifecycleError::DuplicateGpuId { gpu_id }.into());
        }

        let now = self.clock.now();
        let mut summary = MergeSummary::default();
        let mut inventory = self.inner.write().await;

        for record in records {
            if let Some(&position) = inventory.index.get(&record.id) {
                let gpu = &mut inventory.records[position];
                gpu.model = record.model;
                gpu.vram_gb = record.vram_gb;
                summary.refreshed += 1;
            } else {
                let position = inventory.records.len();
                inventory.index.insert(record.id.clone(), position);
                inventory.records.push(PhysicalGpu::from_record(record, now));
                summary.added += 1;
            }
        }

        info!(
            "Merged inventory: {} added, {} refreshed",
            summary.added, summary.refreshed
        );
        Ok(summary)
    }

    /// Gets a GPU by id.
    pub async fn get(&self, gpu_id: &str) -> Option<PhysicalGpu> {
        self.inner.read().await.get(gpu_id).cloned()
    }

    /// Lists every GPU in registration order.
    pub async fn list_all(&self) -> Vec<PhysicalGpu> {
        self.inner.read().await.records.clone()
    }

    /// Lists GPUs in the given state, in registration order.
    pub async fn list_by_state(&self, state: GpuState) -> Vec<PhysicalGpu> {
        self.inner
            .read()
            .await
            .records
            .iter()
            .filter(|g| g.state == state)
            .cloned()
            .collect()
    }

    /// Number of registered GPUs.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Returns true if no GPU is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }

    /// Applies a state transition to one GPU.
    ///
    /// Rejects transitions outside the GPU table, an assignee on any state
    /// other than `allocated`, and a missing assignee for `allocated`.
    pub(crate) async fn apply_transition(
        &self,
        gpu_id: &str,
        new_state: GpuState,
        assigned_to: Option<&str>,
    ) -> Result<GpuTransition> {
        let now = self.clock.now();
        let transition = self
            .inner
            .write()
            .await
            .transition(gpu_id, new_state, assigned_to, now)?;
        debug!(
            "GPU {gpu_id}: {} -> {}",
            transition.from, transition.gpu.state
        );
        Ok(transition)
    }

    /// Allocates the first available GPU in registration order.
    pub(crate) async fn claim_first_available(&self, consumer_id: &str) -> Result<PhysicalGpu> {
        let now = self.clock.now();
        let mut inventory = self.inner.write().await;

        let gpu_id = inventory
            .records
            .iter()
            .find(|g| g.state == GpuState::Available)
            .map(|g| g.id.clone())
            .ok_or(AllocationError::NoCapacity)?;

        let transition =
            inventory.transition(&gpu_id, GpuState::Allocated, Some(consumer_id), now)?;
        Ok(transition.gpu)
    }

    /// Allocates a named GPU if it is available.
    pub(crate) async fn claim(&self, gpu_id: &str, consumer_id: &str) -> Result<PhysicalGpu> {
        let now = self.clock.now();
        let mut inventory = self.inner.write().await;

        let state = inventory
            .get(gpu_id)
            .map(|g| g.state)
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id))?;
        if state != GpuState::Available {
            return Err(AllocationError::GpuUnavailable {
                gpu_id: gpu_id.to_string(),
                state: state.to_string(),
            }
            .into());
        }

        let transition =
            inventory.transition(gpu_id, GpuState::Allocated, Some(consumer_id), now)?;
        Ok(transition.gpu)
    }

    /// Returns an allocated GPU to `available` if it is held by `consumer_id`.
    ///
    /// `Ok(None)` means the GPU exists but was not allocated to that consumer.
    pub(crate) async fn release_if_held(
        &self,
        gpu_id: &str,
        consumer_id: Option<&str>,
    ) -> Result<Option<GpuTransition>> {
        let now = self.clock.now();
        let mut inventory = self.inner.write().await;

        let gpu = inventory
            .get(gpu_id)
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id))?;
        let held = match consumer_id {
            Some(consumer) => gpu.is_held_by(consumer),
            None => gpu.state == GpuState::Allocated,
        };
        if !held {
            return Ok(None);
        }

        let transition = inventory.transition(gpu_id, GpuState::Available, None, now)?;
        Ok(Some(transition))
    }

    /// Replaces the inventory with persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if ids repeat or a record breaks the assignment invariant.
    pub(crate) async fn restore(&self, gpus: Vec<PhysicalGpu>) -> Result<()> {
        if let Some(bad) = gpus.iter().find(|g| !g.is_consistent()) {
            return Err(LifecycleError::InvariantViolation {
                message: format!(
                    "GPU {} is {} with assignee {:?}",
                    bad.id, bad.state, bad.assigned_to
                ),
            }
            .into());
        }

        let inventory = Inventory::from_records(gpus)?;
        debug!("Restored {} GPUs", inventory.records.len());
        *self.inner.write().await = inventory;
        Ok(())
    }

    /// Removes an offline GPU from the inventory.
    pub(crate) async fn remove(&self, gpu_id: &str) -> Result<PhysicalGpu> {
        let mut inventory = self.inner.write().await;

        let state = inventory
            .get(gpu_id)
            .map(|g| g.state)
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id))?;
        if state != GpuState::Offline {
            return Err(LifecycleError::GpuInUse {
                gpu_id: gpu_id.to_string(),
                reason: format!("must be offline to decommission, currently {state}"),
            }
            .into());
        }

        let removed = inventory.remove(gpu_id)?;

        info!("Decommissioned GPU {gpu_id}");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::LeaseError;

    fn registry() -> InventoryRegistry {
        InventoryRegistry::new(Arc::new(SystemClock))
    }

    async fn registry_with(ids: &[&str]) -> InventoryRegistry {
        let registry = registry();
        registry
            .register_physical_gpus(ids.iter().map(|id| GpuRecord::new(*id)).collect())
            .await
            .expect("register failed");
        registry
    }

    #[tokio::test]
    async fn test_register_starts_available() {
        let registry = registry_with(&["g1", "g2", "g3"]).await;

        let all = registry.list_all().await;
        let ids: Vec<&str> = all.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2", "g3"]);
        assert!(all.iter().all(|g| g.state == GpuState::Available && g.assigned_to.is_none()));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let registry = registry();
        let result = registry
            .register_physical_gpus(vec![GpuRecord::new("g1"), GpuRecord::new("g1")])
            .await;

        assert!(matches!(
            result,
            Err(LeaseError::Lifecycle(LifecycleError::DuplicateGpuId { .. }))
        ));
    }

    #[tokio::test]
    async fn test_register_resets_state() {
        let registry = registry_with(&["g1"]).await;
        registry
            .claim_first_available("alice")
            .await
            .expect("claim failed");

        registry
            .register_physical_gpus(vec![GpuRecord::new("g1")])
            .await
            .expect("register failed");

        let gpu = registry.get("g1").await.expect("g1 missing");
        assert_eq!(gpu.state, GpuState::Available);
        assert!(gpu.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_merge_preserves_assignment() {
        let registry = registry_with(&["g1"]).await;
        registry.claim("g1", "alice").await.expect("claim failed");

        let summary = registry
            .merge_physical_gpus(vec![
                GpuRecord {
                    id: String::from("g1"),
                    model: Some(String::from("NVIDIA A100")),
                    vram_gb: Some(80),
                },
                GpuRecord::new("g2"),
            ])
            .await
            .expect("merge failed");

        assert_eq!(summary, MergeSummary { added: 1, refreshed: 1 });
        let g1 = registry.get("g1").await.expect("g1 missing");
        assert!(g1.is_held_by("alice"));
        assert_eq!(g1.vram_gb, Some(80));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_list_by_state() {
        let registry = registry_with(&["g1", "g2", "g3"]).await;
        registry.claim("g2", "alice").await.expect("claim failed");

        let allocated = registry.list_by_state(GpuState::Allocated).await;
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].id, "g2");
        assert_eq!(registry.list_by_state(GpuState::Available).await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_transition_rejects_illegal() {
        let registry = registry_with(&["g1"]).await;
        registry
            .apply_transition("g1", GpuState::Offline, None)
            .await
            .expect("offline failed");

        let result = registry.apply_transition("g1", GpuState::Maintenance, None).await;
        assert!(matches!(
            result,
            Err(LeaseError::Lifecycle(LifecycleError::InvalidTransition { .. }))
        ));
        let gpu = registry.get("g1").await.expect("g1 missing");
        assert_eq!(gpu.state, GpuState::Offline);
    }

    #[tokio::test]
    async fn test_apply_transition_assignee_rules() {
        let registry = registry_with(&["g1"]).await;

        let missing = registry.apply_transition("g1", GpuState::Allocated, None).await;
        assert!(matches!(
            missing,
            Err(LeaseError::Lifecycle(LifecycleError::MissingAssignee { .. }))
        ));

        let unexpected = registry
            .apply_transition("g1", GpuState::Maintenance, Some("alice"))
            .await;
        assert!(matches!(
            unexpected,
            Err(LeaseError::Lifecycle(LifecycleError::UnexpectedAssignee { .. }))
        ));

        let gpu = registry.get("g1").await.expect("g1 missing");
        assert_eq!(gpu.state, GpuState::Available);
    }

    #[tokio::test]
    async fn test_apply_transition_unknown_gpu() {
        let registry = registry_with(&["g1"]).await;
        let result = registry.apply_transition("nope", GpuState::Offline, None).await;
        assert!(matches!(
            result,
            Err(LeaseError::Lifecycle(LifecycleError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_claim_unavailable_gpu() {
        let registry = registry_with(&["g1"]).await;
        registry.claim("g1", "alice").await.expect("claim failed");

        let result = registry.claim("g1", "bob").await;
        assert!(matches!(
            result,
            Err(LeaseError::Allocation(AllocationError::GpuUnavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_restore_rejects_inconsistent_record() {
        let registry = registry();
        let mut gpu = PhysicalGpu::from_record(GpuRecord::new("g1"), chrono::Utc::now());
        gpu.assigned_to = Some(String::from("alice"));

        let result = registry.restore(vec![gpu]).await;
        assert!(matches!(
            result,
            Err(LeaseError::Lifecycle(LifecycleError::InvariantViolation { .. }))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_requires_offline() {
        let registry = registry_with(&["g1", "g2"]).await;

        assert!(registry.remove("g1").await.is_err());

        registry
            .apply_transition("g1", GpuState::Offline, None)
            .await
            .expect("offline failed");
        let removed = registry.remove("g1").await.expect("remove failed");
        assert_eq!(removed.id, "g1");
        assert!(registry.get("g1").await.is_none());
        assert!(registry.get("g2").await.is_some());
    }
}

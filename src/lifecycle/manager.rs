//! Lifecycle manager for rental orders and operator GPU transitions.
//!
//! Every operation checks the transition table before it mutates anything.
//! When both orders and inventory are touched, the order lock is taken first.
//! Events are emitted after both locks are released, and a snapshot is
//! written through the persistence guard after each successful mutation.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::allocation::AllocationEngine;
use crate::clock::Clock;
use crate::error::{AllocationError, EntityKind, LeaseError, LifecycleError, Result};
use crate::events::{EventSink, LifecycleEvent, NoopEventSink};
use crate::inventory::{
    GpuRecord, GpuState, GpuStatus, GpuTransition, InventoryRegistry, PhysicalGpu,
    RegistrationMode,
};
use crate::storage::{EndpointRole, InventorySnapshot, PersistenceGuard};

use super::order::{OrderBook, OrderState, RentRequest, RentalOrder};
use super::transitions::StateMachine;

type Timestamp = chrono::DateTime<chrono::Utc>;

/// Result of a rent request.
#[derive(Debug)]
pub enum RentOutcome {
    /// A GPU was reserved and the order is `matched`.
    Matched(RentalOrder),
    /// No GPU could be reserved; the order stays `pending`.
    Pending {
        /// The pending order, to be retried with `transition_order`.
        order: RentalOrder,
        /// Why allocation failed.
        reason: AllocationError,
    },
}

impl RentOutcome {
    /// The order in its current state.
    #[must_use]
    pub const fn order(&self) -> &RentalOrder {
        match self {
            Self::Matched(order) | Self::Pending { order, .. } => order,
        }
    }

    /// Returns true if a GPU was reserved.
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

/// Summary of an inventory import.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Import mode.
    pub mode: RegistrationMode,
    /// GPUs in the inventory after the import.
    pub total: usize,
    /// GPUs not previously known.
    pub added: usize,
    /// Known GPUs whose descriptive fields were refreshed.
    pub refreshed: usize,
    /// Orders cancelled because their GPU assignment was reset.
    pub cancelled_orders: Vec<String>,
}

/// Drives rental orders and GPU state through their transition tables.
pub struct LifecycleManager {
    engine: AllocationEngine,
    orders: RwLock<OrderBook>,
    guard: Option<Arc<PersistenceGuard>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    /// Set while in-memory state is newer than the last written snapshot.
    dirty: AtomicBool,
    /// Serializes snapshot writes.
    persist_lock: Mutex<()>,
}

impl LifecycleManager {
    /// Creates a manager with an empty inventory and no persistence.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(InventoryRegistry::new(Arc::clone(&clock)));
        Self {
            engine: AllocationEngine::new(registry),
            orders: RwLock::new(OrderBook::default()),
            guard: None,
            events: Arc::new(NoopEventSink),
            clock,
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }

    /// Persists every mutation through `guard`.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<PersistenceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Sends lifecycle events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Allocation engine.
    #[must_use]
    pub const fn engine(&self) -> &AllocationEngine {
        &self.engine
    }

    /// Inventory registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<InventoryRegistry> {
        self.engine.registry()
    }

    /// Persistence guard, if one is configured.
    #[must_use]
    pub const fn guard(&self) -> Option<&Arc<PersistenceGuard>> {
        self.guard.as_ref()
    }

    /// Returns true if the last snapshot write failed and changes are pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    /// Imports physical inventory.
    ///
    /// `Replace` resets every GPU to `available` and cancels the orders that
    /// held one. `Merge` adds unknown GPUs and keeps the state of known ones.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGpuId` if `records` repeats an id; nothing changes.
    pub async fn register_inventory(
        &self,
        records: Vec<GpuRecord>,
        mode: RegistrationMode,
    ) -> Result<RegistrationReport> {
        let count = records.len();
        let now = self.clock.now();
        let mut events = vec![LifecycleEvent::InventoryRegistered { count, mode }];

        let report = {
            let mut orders = self.orders.write().await;
            match mode {
                RegistrationMode::Replace => {
                    let total = self.registry().register_physical_gpus(records).await?;
                    let cancelled_orders = orders.holding_ids();
                    for order_id in &cancelled_orders {
                        let (from, _) = apply_order_state(
                            &mut orders,
                            order_id,
                            OrderState::Cancelled,
                            None,
                            now,
                        )?;
                        events.push(LifecycleEvent::OrderTransitioned {
                            order_id: order_id.clone(),
                            from,
                            to: OrderState::Cancelled,
                        });
                    }
                    RegistrationReport {
                        mode,
                        total,
                        added: total,
                        refreshed: 0,
                        cancelled_orders,
                    }
                }
                RegistrationMode::Merge => {
                    let summary = self.registry().merge_physical_gpus(records).await?;
                    RegistrationReport {
                        mode,
                        total: self.registry().len().await,
                        added: summary.added,
                        refreshed: summary.refreshed,
                        cancelled_orders: Vec::new(),
                    }
                }
            }
        };

        if !report.cancelled_orders.is_empty() {
            warn!(
                "Re-registration cancelled {} open orders",
                report.cancelled_orders.len()
            );
        }

        self.publish(events);
        self.sync().await;
        Ok(report)
    }

    /// Status of every GPU in registration order.
    pub async fn get_status(&self) -> Vec<GpuStatus> {
        self.registry()
            .list_all()
            .await
            .iter()
            .map(PhysicalGpu::status)
            .collect()
    }

    /// Gets one GPU.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn get_gpu(&self, gpu_id: &str) -> Result<PhysicalGpu> {
        self.registry()
            .get(gpu_id)
            .await
            .ok_or_else(|| LifecycleError::gpu_not_found(gpu_id).into())
    }

    /// Allocates the first available GPU to `consumer_id`.
    ///
    /// # Errors
    ///
    /// Returns `NoCapacity` if no GPU is available.
    pub async fn allocate(&self, consumer_id: &str) -> Result<PhysicalGpu> {
        let gpu = self.engine.allocate(consumer_id).await?;

        self.publish(vec![LifecycleEvent::GpuAllocated {
            gpu_id: gpu.id.clone(),
            consumer_id: consumer_id.to_string(),
        }]);
        self.sync().await;
        Ok(gpu)
    }

    /// Returns an allocated GPU to the pool.
    ///
    /// Returns `false` if the GPU exists but is not allocated. GPUs held by an
    /// open order are released by completing or cancelling that order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `GpuInUse` if an order holds
    /// the GPU.
    pub async fn release(&self, gpu_id: &str) -> Result<bool> {
        let released = {
            let orders = self.orders.read().await;
            if let Some(holder) = orders.holder_of(gpu_id) {
                return Err(LifecycleError::GpuInUse {
                    gpu_id: gpu_id.to_string(),
                    reason: format!("held by order {}", holder.id),
                }
                .into());
            }
            self.engine.release_held(gpu_id, None).await?
        };

        let Some(transition) = released else {
            return Ok(false);
        };

        self.publish(vec![released_event(&transition)]);
        self.sync().await;
        Ok(true)
    }

    /// Moves a GPU to `target` on behalf of an operator.
    ///
    /// `allocated` cannot be reached this way. Leaving `allocated` clears the
    /// assignee and cancels the order that held the GPU.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidTransition`, or `MissingAssignee` (for
    /// `allocated`); the GPU is unchanged in every case.
    pub async fn transition_gpu(&self, gpu_id: &str, target: GpuState) -> Result<PhysicalGpu> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let gpu = {
            let mut orders = self.orders.write().await;
            let transition = self.registry().apply_transition(gpu_id, target, None).await?;
            events.push(LifecycleEvent::GpuStateChanged {
                gpu_id: gpu_id.to_string(),
                from: transition.from,
                to: target,
            });

            if transition.from == GpuState::Allocated {
                let holder = orders.holder_of(gpu_id).map(|o| o.id.clone());
                if let Some(order_id) = holder {
                    let (from, _) = apply_order_state(
                        &mut orders,
                        &order_id,
                        OrderState::Cancelled,
                        None,
                        now,
                    )?;
                    warn!("Order {order_id} cancelled: GPU {gpu_id} moved to {target}");
                    events.push(LifecycleEvent::OrderTransitioned {
                        order_id,
                        from,
                        to: OrderState::Cancelled,
                    });
                }
            }

            transition.gpu
        };

        info!("GPU {gpu_id} is now {target}");
        self.publish(events);
        self.sync().await;
        Ok(gpu)
    }

    /// Removes an offline GPU that no open order references.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `GpuInUse` if the GPU is not
    /// offline or an open order references it.
    pub async fn decommission(&self, gpu_id: &str) -> Result<PhysicalGpu> {
        let removed = {
            let orders = self.orders.read().await;
            if let Some(order) = orders.open_referencing(gpu_id) {
                return Err(LifecycleError::GpuInUse {
                    gpu_id: gpu_id.to_string(),
                    reason: format!("referenced by open order {}", order.id),
                }
                .into());
            }
            self.registry().remove(gpu_id).await?
        };

        self.publish(vec![LifecycleEvent::GpuDecommissioned {
            gpu_id: gpu_id.to_string(),
        }]);
        self.sync().await;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Creates a `pending` order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRate` for a negative or non-finite rate and `NotFound`
    /// if the request names an unknown GPU.
    pub async fn create_order(&self, request: RentRequest) -> Result<RentalOrder> {
        if !request.rate.is_finite() || request.rate < 0.0 {
            return Err(LifecycleError::InvalidRate {
                rate: request.rate.to_string(),
            }
            .into());
        }
        if let Some(gpu_id) = request.gpu_id.as_deref() {
            if self.registry().get(gpu_id).await.is_none() {
                return Err(LifecycleError::gpu_not_found(gpu_id).into());
            }
        }

        let order = RentalOrder::new(request, self.clock.now());
        self.orders.write().await.insert(order.clone());
        info!("Created order {} for {}", order.id, order.user_id);

        self.publish(vec![LifecycleEvent::OrderCreated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
        }]);
        self.sync().await;
        Ok(order)
    }

    /// Creates an order and tries to match it immediately.
    ///
    /// When no GPU can be reserved the order is kept `pending` and returned
    /// with the reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the order cannot be created or matching fails for
    /// a reason other than allocation. In the latter case the new order is
    /// cancelled first.
    pub async fn rent(&self, request: RentRequest) -> Result<RentOutcome> {
        let order = self.create_order(request).await?;
        self.match_new_order(order).await
    }

    async fn match_new_order(&self, order: RentalOrder) -> Result<RentOutcome> {
        match self.transition_order(&order.id, OrderState::Matched).await {
            Ok(matched) => Ok(RentOutcome::Matched(matched)),
            Err(LeaseError::Allocation(reason)) => {
                info!("Order {} left pending: {reason}", order.id);
                Ok(RentOutcome::Pending { order, reason })
            }
            Err(e) => {
                warn!("Cancelling order {} after failed match: {e}", order.id);
                if let Err(cancel) = self.cancel(&order.id).await {
                    warn!("Order {} could not be cancelled: {cancel}", order.id);
                }
                Err(e)
            }
        }
    }

    /// Moves an order to `target`.
    ///
    /// `matched` allocates a GPU, `active` requires the renter to still hold
    /// it, and `completed`/`cancelled` release it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidTransition`, an allocation error when
    /// matching, or `GpuNotAssigned` when activating. Nothing changes on error.
    pub async fn transition_order(&self, order_id: &str, target: OrderState) -> Result<RentalOrder> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let (from, updated) = {
            let mut orders = self.orders.write().await;
            let order = orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| LifecycleError::order_not_found(order_id))?;

            if !order.state.can_transition_to(target) {
                return Err(LifecycleError::invalid_transition(
                    EntityKind::Order,
                    order_id,
                    order.state,
                    target,
                )
                .into());
            }

            let updated = match target {
                OrderState::Matched => {
                    self.match_order(&mut orders, &order, now, &mut events).await?
                }
                OrderState::Active => self.activate_order(&mut orders, &order, now).await?,
                OrderState::Completed | OrderState::Cancelled => {
                    self.close_order(&mut orders, &order, target, now, &mut events)
                        .await?
                }
                OrderState::Pending => {
                    return Err(LifecycleError::invalid_transition(
                        EntityKind::Order,
                        order_id,
                        order.state,
                        target,
                    )
                    .into());
                }
            };
            (order.state, updated)
        };

        info!("Order {order_id}: {from} -> {target}");
        events.push(LifecycleEvent::OrderTransitioned {
            order_id: order_id.to_string(),
            from,
            to: target,
        });
        self.publish(events);
        self.sync().await;
        Ok(updated)
    }

    /// Marks a matched order as paid.
    ///
    /// # Errors
    ///
    /// See [`Self::transition_order`].
    pub async fn confirm_payment(&self, order_id: &str) -> Result<RentalOrder> {
        self.transition_order(order_id, OrderState::Active).await
    }

    /// Completes an active order and releases its GPU.
    ///
    /// # Errors
    ///
    /// See [`Self::transition_order`].
    pub async fn complete(&self, order_id: &str) -> Result<RentalOrder> {
        self.transition_order(order_id, OrderState::Completed).await
    }

    /// Cancels an open order and releases its GPU if it holds one.
    ///
    /// # Errors
    ///
    /// See [`Self::transition_order`].
    pub async fn cancel(&self, order_id: &str) -> Result<RentalOrder> {
        self.transition_order(order_id, OrderState::Cancelled).await
    }

    /// Gets one order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn get_order(&self, order_id: &str) -> Result<RentalOrder> {
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| LifecycleError::order_not_found(order_id).into())
    }

    /// Lists orders by creation time, optionally for one renter.
    pub async fn list_orders(&self, user_id: Option<&str>) -> Vec<RentalOrder> {
        self.orders.read().await.list(user_id)
    }

    async fn match_order(
        &self,
        orders: &mut OrderBook,
        order: &RentalOrder,
        now: Timestamp,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<RentalOrder> {
        let gpu = match order.gpu_id.as_deref() {
            Some(gpu_id) => self.engine.allocate_specific(&order.user_id, gpu_id).await?,
            None => self.engine.allocate(&order.user_id).await?,
        };

        match apply_order_state(orders, &order.id, OrderState::Matched, Some(&gpu.id), now) {
            Ok((_, updated)) => {
                events.push(LifecycleEvent::GpuAllocated {
                    gpu_id: gpu.id,
                    consumer_id: order.user_id.clone(),
                });
                Ok(updated)
            }
            Err(e) => {
                warn!("Rolling back GPU {} for order {}: {e}", gpu.id, order.id);
                self.engine
                    .release_held(&gpu.id, Some(&order.user_id))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn activate_order(
        &self,
        orders: &mut OrderBook,
        order: &RentalOrder,
        now: Timestamp,
    ) -> Result<RentalOrder> {
        let gpu_id = order.gpu_id.as_deref().ok_or_else(|| {
            LifecycleError::InvariantViolation {
                message: format!("order {} is {} without a GPU", order.id, order.state),
            }
        })?;

        let held = self
            .registry()
            .get(gpu_id)
            .await
            .is_some_and(|gpu| gpu.is_held_by(&order.user_id));
        if !held {
            return Err(LifecycleError::GpuNotAssigned {
                order_id: order.id.clone(),
                gpu_id: gpu_id.to_string(),
            }
            .into());
        }

        let (_, updated) = apply_order_state(orders, &order.id, OrderState::Active, None, now)?;
        Ok(updated)
    }

    async fn close_order(
        &self,
        orders: &mut OrderBook,
        order: &RentalOrder,
        target: OrderState,
        now: Timestamp,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<RentalOrder> {
        if order.holds_gpu() {
            if let Some(gpu_id) = order.gpu_id.as_deref() {
                let released = self
                    .engine
                    .release_held(gpu_id, Some(&order.user_id))
                    .await?;
                if let Some(transition) = released {
                    events.push(released_event(&transition));
                }
            }
        }

        let (_, updated) = apply_order_state(orders, &order.id, target, None, now)?;
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Captures the inventory and orders as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum cannot be computed.
    pub async fn snapshot(&self) -> Result<InventorySnapshot> {
        let orders = self.orders.read().await;
        let gpus = self.registry().list_all().await;
        InventorySnapshot::new(gpus, orders.list(None), self.clock.now())
    }

    /// Writes the current state through the persistence guard.
    ///
    /// Returns the endpoint that accepted the write, or `None` when no guard
    /// is configured. On failure the in-memory state is kept and marked dirty.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if no endpoint accepted the write.
    pub async fn persist(&self) -> Result<Option<EndpointRole>> {
        let Some(guard) = &self.guard else {
            return Ok(None);
        };

        let _writer = self.persist_lock.lock().await;
        let snapshot = self.snapshot().await?;

        match guard.write_snapshot(&snapshot).await {
            Ok(role) => {
                self.dirty.store(false, Ordering::SeqCst);
                debug!("Persisted {} GPUs to {role}", snapshot.gpus.len());
                Ok(Some(role))
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.events.emit(LifecycleEvent::PersistFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Persists only if a previous write failed.
    ///
    /// Returns true if a snapshot was written.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if storage is still down.
    pub async fn flush_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.persist().await?;
        info!("Flushed unsaved changes to storage");
        Ok(true)
    }

    /// Loads state from the guard's selected endpoint.
    ///
    /// Returns false, leaving the manager untouched, when no guard is
    /// configured or no snapshot exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if storage is unavailable, the snapshot is corrupted,
    /// or its orders and GPUs disagree.
    pub async fn restore(&self) -> Result<bool> {
        let Some(guard) = &self.guard else {
            return Ok(false);
        };

        let Some(snapshot) = guard.read_snapshot().await? else {
            info!("No snapshot found, starting with an empty inventory");
            return Ok(false);
        };

        check_restored_orders(&snapshot.gpus, &snapshot.orders)?;

        let gpu_count = snapshot.gpus.len();
        let order_count = snapshot.orders.len();
        {
            let mut orders = self.orders.write().await;
            self.registry().restore(snapshot.gpus).await?;
            orders.replace_all(snapshot.orders);
        }
        self.dirty.store(false, Ordering::SeqCst);

        info!("Restored {gpu_count} GPUs and {order_count} orders");
        Ok(true)
    }

    fn publish(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Writes a snapshot after a mutation, keeping memory authoritative on failure.
    async fn sync(&self) {
        if self.guard.is_none() {
            return;
        }
        if let Err(e) = self.persist().await {
            warn!("Keeping unsaved changes in memory: {e}");
        }
    }
}

/// Moves one order to `target` and returns its previous state and new record.
fn apply_order_state(
    orders: &mut OrderBook,
    order_id: &str,
    target: OrderState,
    gpu_id: Option<&str>,
    now: Timestamp,
) -> std::result::Result<(OrderState, RentalOrder), LifecycleError> {
    let order = orders
        .get_mut(order_id)
        .ok_or_else(|| LifecycleError::order_not_found(order_id))?;

    if !order.state.can_transition_to(target) {
        return Err(LifecycleError::invalid_transition(
            EntityKind::Order,
            order_id,
            order.state,
            target,
        ));
    }

    let from = order.state;
    order.state = target;
    order.updated_at = now;
    if let Some(gpu_id) = gpu_id {
        order.gpu_id = Some(gpu_id.to_string());
    }
    Ok((from, order.clone()))
}

fn released_event(transition: &GpuTransition) -> LifecycleEvent {
    LifecycleEvent::GpuReleased {
        gpu_id: transition.gpu.id.clone(),
        consumer_id: transition.previous_assignee.clone(),
    }
}

/// Every order holding a GPU must match exactly one allocated GPU of its renter.
fn check_restored_orders(
    gpus: &[PhysicalGpu],
    orders: &[RentalOrder],
) -> std::result::Result<(), LifecycleError> {
    let by_id: HashMap<&str, &PhysicalGpu> = gpus.iter().map(|g| (g.id.as_str(), g)).collect();
    let mut held = HashSet::new();

    for order in orders.iter().filter(|o| o.holds_gpu()) {
        let Some(gpu_id) = order.gpu_id.as_deref() else {
            return Err(LifecycleError::InvariantViolation {
                message: format!("order {} is {} without a GPU", order.id, order.state),
            });
        };

        let holds = by_id
            .get(gpu_id)
            .is_some_and(|gpu| gpu.is_held_by(&order.user_id));
        if !holds || !held.insert(gpu_id) {
            return Err(LifecycleError::InvariantViolation {
                message: format!("order {} does not hold GPU {gpu_id}", order.id),
            });
        }
    }

    Ok(())
}

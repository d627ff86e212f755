//! Lifecycle events and fire-and-forget sinks.
//!
//! The core never waits on event delivery. Events are emitted after the
//! mutation that produced them has released its locks, and a sink that cannot
//! accept an event drops it with a warning.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::inventory::{GpuState, RegistrationMode};
use crate::lifecycle::OrderState;

/// Something that happened to the inventory, an order, or storage.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The inventory was (re)registered.
    InventoryRegistered {
        /// Number of GPUs in the import.
        count: usize,
        /// Import mode.
        mode: RegistrationMode,
    },
    /// A GPU was allocated.
    GpuAllocated {
        /// GPU identifier.
        gpu_id: String,
        /// New assignee.
        consumer_id: String,
    },
    /// An allocated GPU was returned to the pool.
    GpuReleased {
        /// GPU identifier.
        gpu_id: String,
        /// Previous assignee.
        consumer_id: Option<String>,
    },
    /// An operator changed a GPU state.
    GpuStateChanged {
        /// GPU identifier.
        gpu_id: String,
        /// Previous state.
        from: GpuState,
        /// New state.
        to: GpuState,
    },
    /// A GPU was removed from the inventory.
    GpuDecommissioned {
        /// GPU identifier.
        gpu_id: String,
    },
    /// A rental order was created.
    OrderCreated {
        /// Order identifier.
        order_id: String,
        /// Renter.
        user_id: String,
    },
    /// A rental order changed state.
    OrderTransitioned {
        /// Order identifier.
        order_id: String,
        /// Previous state.
        from: OrderState,
        /// New state.
        to: OrderState,
    },
    /// The backup endpoint became authoritative.
    StorageFailover {
        /// Location of the backup endpoint.
        location: String,
        /// When failover was first recorded.
        at: DateTime<Utc>,
    },
    /// The primary endpoint became authoritative again.
    StorageRecovered {
        /// Location of the primary endpoint.
        location: String,
    },
    /// A snapshot could not be written to any endpoint.
    PersistFailed {
        /// Failure description.
        reason: String,
    },
}

impl LifecycleEvent {
    /// Short machine-readable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InventoryRegistered { .. } => "inventory_registered",
            Self::GpuAllocated { .. } => "gpu_allocated",
            Self::GpuReleased { .. } => "gpu_released",
            Self::GpuStateChanged { .. } => "gpu_state_changed",
            Self::GpuDecommissioned { .. } => "gpu_decommissioned",
            Self::OrderCreated { .. } => "order_created",
            Self::OrderTransitioned { .. } => "order_transitioned",
            Self::StorageFailover { .. } => "storage_failover",
            Self::StorageRecovered { .. } => "storage_recovered",
            Self::PersistFailed { .. } => "persist_failed",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InventoryRegistered { count, mode } => {
                write!(f, "inventory registered ({count} GPUs, {mode})")
            }
            Self::GpuAllocated { gpu_id, consumer_id } => {
                write!(f, "GPU {gpu_id} allocated to {consumer_id}")
            }
            Self::GpuReleased { gpu_id, consumer_id } => write!(
                f,
                "GPU {gpu_id} released by {}",
                consumer_id.as_deref().unwrap_or("unknown")
            ),
            Self::GpuStateChanged { gpu_id, from, to } => {
                write!(f, "GPU {gpu_id}: {from} -> {to}")
            }
            Self::GpuDecommissioned { gpu_id } => write!(f, "GPU {gpu_id} decommissioned"),
            Self::OrderCreated { order_id, user_id } => {
                write!(f, "order {order_id} created for {user_id}")
            }
            Self::OrderTransitioned { order_id, from, to } => {
                write!(f, "order {order_id}: {from} -> {to}")
            }
            Self::StorageFailover { location, at } => {
                write!(f, "storage failed over to {location} at {}", at.to_rfc3339())
            }
            Self::StorageRecovered { location } => write!(f, "storage recovered on {location}"),
            Self::PersistFailed { reason } => write!(f, "snapshot persist failed: {reason}"),
        }
    }
}

/// Receiver of lifecycle events.
///
/// Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Hands an event to the sink.
    fn emit(&self, event: LifecycleEvent);
}

/// Sink that forwards events into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<LifecycleEvent>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver that drains it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: LifecycleEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {}", event.name());
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!("Event channel closed, dropping {}", event.name());
            }
        }
    }
}

/// Sink that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        info!("Lifecycle event: {event}");
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn released(gpu_id: &str) -> LifecycleEvent {
        LifecycleEvent::GpuReleased {
            gpu_id: gpu_id.to_string(),
            consumer_id: Some(String::from("alice")),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut receiver) = ChannelEventSink::new(4);
        sink.emit(released("g1"));

        let event = receiver.recv().await.expect("event missing");
        assert_eq!(event, released("g1"));
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelEventSink::new(1);
        sink.emit(released("g1"));
        sink.emit(released("g2"));

        assert_eq!(receiver.recv().await, Some(released("g1")));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, receiver) = ChannelEventSink::new(1);
        drop(receiver);
        sink.emit(released("g1"));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = LifecycleEvent::OrderTransitioned {
            order_id: String::from("o1"),
            from: OrderState::Pending,
            to: OrderState::Matched,
        };
        let json = serde_json::to_value(&event).expect("serialize failed");
        assert_eq!(json["event"], "order_transitioned");
        assert_eq!(json["from"], "pending");
        assert_eq!(json["to"], "matched");
        assert_eq!(event.name(), "order_transitioned");
    }
}

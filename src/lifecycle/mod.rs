//! Lifecycle state machines for GPUs and rental orders.
//!
//! This module provides the transition tables, the rental order model, and
//! the [`LifecycleManager`] that applies transitions on behalf of callers.

mod manager;
mod order;
mod transitions;

pub use manager::{LifecycleManager, RegistrationReport, RentOutcome};
pub use order::{OrderState, RentRequest, RentalOrder};
pub use transitions::StateMachine;

//! Transition tables for GPUs and rental orders.
//!
//! Both tables are total: every `(from, to)` pair has a legality answer, and
//! callers check it before mutating anything.

use crate::inventory::GpuState;

use super::order::OrderState;

/// A finite state machine described by an explicit transition table.
pub trait StateMachine: Copy + Eq + std::fmt::Display + 'static {
    /// Every state of the machine.
    const ALL: &'static [Self];

    /// States reachable in one step from `self`.
    fn allowed_targets(self) -> &'static [Self];

    /// Returns true if `self -> target` is in the table.
    fn can_transition_to(self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Returns true if no transition leaves this state.
    fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }
}

impl StateMachine for GpuState {
    const ALL: &'static [Self] = &[
        Self::Available,
        Self::Allocated,
        Self::Maintenance,
        Self::Offline,
    ];

    fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Available => &[Self::Allocated, Self::Maintenance, Self::Offline],
            Self::Allocated => &[Self::Available, Self::Maintenance, Self::Offline],
            Self::Maintenance => &[Self::Available, Self::Offline],
            Self::Offline => &[Self::Available],
        }
    }
}

impl StateMachine for OrderState {
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Matched,
        Self::Active,
        Self::Completed,
        Self::Cancelled,
    ];

    fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Matched, Self::Cancelled],
            Self::Matched => &[Self::Active, Self::Cancelled],
            Self::Active => &[Self::Completed, Self::Cancelled],
            Self::Completed | Self::Cancelled => &[],
        }
    }
}

//! Physical GPU inventory.
//!
//! This module holds the GPU record types and the registry that owns them.

mod registry;
mod types;

pub(crate) use registry::GpuTransition;
pub use registry::{InventoryRegistry, MergeSummary};
pub use types::{GpuRecord, GpuState, GpuStatus, PhysicalGpu, RegistrationMode};

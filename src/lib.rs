// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # gpulease
//!
//! GPU inventory, exclusive allocation, and rental order lifecycle management
//! with primary/backup snapshot storage.
//!
//! ## Overview
//!
//! gpulease keeps track of a fleet of physical GPUs and the rental orders
//! placed against them:
//!
//! - Register the physical inventory from a YAML configuration file
//! - Allocate each GPU to at most one consumer at a time
//! - Drive rental orders from `pending` to `completed` or `cancelled`
//! - Persist every change to a primary snapshot, falling back to a backup
//!   while the primary is unreachable
//!
//! ## Architecture
//!
//! 1. **Registry**: the authoritative set of GPUs and their states
//! 2. **Allocation engine**: atomic check-and-claim over the registry
//! 3. **Lifecycle manager**: order and GPU transition tables, events, and
//!    write-through persistence
//! 4. **Persistence guard**: picks the snapshot endpoint and fails over
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`inventory`]: GPU records and the registry
//! - [`allocation`]: Exclusive GPU allocation
//! - [`lifecycle`]: Rental orders and state machines
//! - [`storage`]: Snapshot backends (local, S3) and failover
//! - [`events`]: Lifecycle events and sinks
//! - [`monitor`]: Background storage health checks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! fleet:
//!   name: market
//!   environment: prod
//!
//! storage:
//!   primary:
//!     path: /var/lib/gpulease/inventory.json
//!   backup:
//!     backend: s3
//!     bucket: gpulease-backups
//!
//! inventory:
//!   gpus:
//!     - id: gpu-0
//!       model: "NVIDIA A100"
//!       vram_gb: 80
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod allocation;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod inventory;
pub mod lifecycle;
pub mod monitor;
pub mod storage;

// ============================================================================
// Re-exports
// ============================================================================

pub use allocation::AllocationEngine;
pub use cli::{Cli, Commands, OutputFormatter};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigParser, ConfigValidator, LeaseConfig};
pub use error::{LeaseError, Result};
pub use events::{EventSink, LifecycleEvent};
pub use inventory::{GpuRecord, GpuState, GpuStatus, InventoryRegistry, PhysicalGpu};
pub use lifecycle::{LifecycleManager, OrderState, RentOutcome, RentRequest, RentalOrder};
pub use monitor::{MonitorHandle, StorageMonitor};
pub use storage::{
    InventorySnapshot, LocalSnapshotStore, PersistenceGuard, S3SnapshotStore, SnapshotStore,
};

//! CLI module for the gpulease tool.
//!
//! This module provides the command-line interface for managing the GPU
//! inventory, rental orders, and snapshot storage.

mod commands;
mod output;

pub use commands::{
    Cli, Commands, GpuCommands, LogFormat, OrderCommands, OutputFormat, StorageCommands,
};
pub use output::OutputFormatter;

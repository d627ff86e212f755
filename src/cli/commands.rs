//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::inventory::{GpuState, RegistrationMode};
use crate::lifecycle::OrderState;

/// gpulease - GPU inventory, allocation and rental order manager.
#[derive(Parser, Debug)]
#[command(name = "gpulease")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "GPULEASE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter configuration file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the state of every GPU.
    Status,

    /// Manage the physical inventory.
    Gpu {
        /// GPU subcommand.
        #[command(subcommand)]
        command: GpuCommands,
    },

    /// Manage rental orders.
    Order {
        /// Order subcommand.
        #[command(subcommand)]
        command: OrderCommands,
    },

    /// Manage snapshot storage.
    Storage {
        /// Storage subcommand.
        #[command(subcommand)]
        command: StorageCommands,
    },

    /// Watch storage health until interrupted.
    Monitor {
        /// Seconds between checks (defaults to the configured interval).
        #[arg(long)]
        interval: Option<u64>,
    },
}

/// Inventory subcommands.
#[derive(Subcommand, Debug)]
pub enum GpuCommands {
    /// Register the GPUs listed in the configuration.
    Register {
        /// How to treat the existing inventory (replace, merge).
        #[arg(long, default_value = "replace")]
        mode: RegistrationMode,
    },

    /// Allocate the first available GPU to a consumer.
    Allocate {
        /// Consumer receiving the GPU.
        consumer: String,
    },

    /// Return an allocated GPU to the pool.
    Release {
        /// GPU identifier.
        gpu_id: String,
    },

    /// Move a GPU to another state.
    Transition {
        /// GPU identifier.
        gpu_id: String,

        /// Target state (available, allocated, maintenance, offline).
        target: GpuState,
    },

    /// Remove an offline GPU from the inventory.
    Decommission {
        /// GPU identifier.
        gpu_id: String,
    },

    /// List GPUs.
    List {
        /// Only show GPUs in this state.
        #[arg(long)]
        state: Option<GpuState>,
    },
}

/// Rental order subcommands.
#[derive(Subcommand, Debug)]
pub enum OrderCommands {
    /// Create an order and try to match it immediately.
    Rent {
        /// Renter.
        user: String,

        /// Price per hour.
        #[arg(long)]
        rate: f64,

        /// Rental length in hours.
        #[arg(long)]
        hours: u32,

        /// Request a specific GPU.
        #[arg(long)]
        gpu: Option<String>,
    },

    /// Create a pending order without matching it.
    Create {
        /// Renter.
        user: String,

        /// Price per hour.
        #[arg(long)]
        rate: f64,

        /// Rental length in hours.
        #[arg(long)]
        hours: u32,

        /// Request a specific GPU.
        #[arg(long)]
        gpu: Option<String>,
    },

    /// Move an order to another state.
    Transition {
        /// Order identifier.
        order_id: String,

        /// Target state (pending, matched, active, completed, cancelled).
        target: OrderState,
    },

    /// Confirm payment for a matched order.
    Pay {
        /// Order identifier.
        order_id: String,
    },

    /// Complete an active order.
    Complete {
        /// Order identifier.
        order_id: String,
    },

    /// Cancel an open order.
    Cancel {
        /// Order identifier.
        order_id: String,
    },

    /// Show one order.
    Show {
        /// Order identifier.
        order_id: String,
    },

    /// List orders.
    List {
        /// Only show orders of this renter.
        #[arg(long)]
        user: Option<String>,
    },
}

/// Storage subcommands.
#[derive(Subcommand, Debug)]
pub enum StorageCommands {
    /// Create empty snapshots on endpoints that have none.
    Init,

    /// Probe both endpoints.
    Health,

    /// Switch back to the primary endpoint if it is reachable.
    Recover,

    /// Show the current snapshot.
    Show,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_transition() {
        let cli = Cli::try_parse_from(["gpulease", "gpu", "transition", "g1", "maintenance"])
            .expect("parse failed");

        match cli.command {
            Commands::Gpu {
                command: GpuCommands::Transition { gpu_id, target },
            } => {
                assert_eq!(gpu_id, "g1");
                assert_eq!(target, GpuState::Maintenance);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rent_with_globals() {
        let cli = Cli::try_parse_from([
            "gpulease", "order", "rent", "alice", "--rate", "2.5", "--hours", "4", "--output",
            "json", "-v",
        ])
        .expect("parse failed");

        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
        match cli.command {
            Commands::Order {
                command: OrderCommands::Rent { user, hours, gpu, .. },
            } => {
                assert_eq!(user, "alice");
                assert_eq!(hours, 4);
                assert!(gpu.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_register_mode_default_and_rejects_unknown() {
        let cli = Cli::try_parse_from(["gpulease", "gpu", "register"]).expect("parse failed");
        assert!(matches!(
            cli.command,
            Commands::Gpu {
                command: GpuCommands::Register {
                    mode: RegistrationMode::Replace
                }
            }
        ));

        assert!(Cli::try_parse_from(["gpulease", "gpu", "register", "--mode", "append"]).is_err());
        assert!(Cli::try_parse_from(["gpulease", "gpu", "transition", "g1", "broken"]).is_err());
    }
}

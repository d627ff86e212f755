//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::inventory::{GpuState, GpuStatus, PhysicalGpu};
use crate::lifecycle::{OrderState, RegistrationReport, RentOutcome, RentalOrder};
use crate::storage::{EndpointHealth, InventorySnapshot, SnapshotHasher, StorageHealth};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// GPU row for table display.
#[derive(Tabled)]
struct GpuRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Assigned To")]
    assigned_to: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "VRAM")]
    vram: String,
}

/// Status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Assigned To")]
    assigned_to: String,
}

/// Order row for table display.
#[derive(Tabled)]
struct OrderRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "GPU")]
    gpu: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Rate")]
    rate: String,
    #[tabled(rename = "Hours")]
    hours: u32,
    #[tabled(rename = "Total")]
    total: String,
}

/// Endpoint row for table display.
#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Available")]
    available: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the status view of every GPU.
    #[must_use]
    pub fn format_status(&self, statuses: &[GpuStatus]) -> String {
        match self.format {
            OutputFormat::Json => to_json(statuses),
            OutputFormat::Text => Self::format_status_text(statuses),
        }
    }

    /// Formats status as text.
    fn format_status_text(statuses: &[GpuStatus]) -> String {
        if statuses.is_empty() {
            return String::from("\nNo GPUs registered.\n");
        }

        let mut output = String::from("\nGPU inventory\n\n");

        let rows: Vec<StatusRow> = statuses
            .iter()
            .map(|s| StatusRow {
                id: s.id.clone(),
                state: Self::format_gpu_state(s.state),
                assigned_to: s.assigned_to.clone().unwrap_or_else(|| String::from("-")),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let count = |state: GpuState| statuses.iter().filter(|s| s.state == state).count();
        let _ = write!(
            output,
            "\n{} GPUs: {} available, {} allocated, {} maintenance, {} offline\n",
            statuses.len(),
            count(GpuState::Available).to_string().green(),
            count(GpuState::Allocated).to_string().cyan(),
            count(GpuState::Maintenance).to_string().yellow(),
            count(GpuState::Offline).to_string().red()
        );

        output
    }

    /// Formats full GPU records.
    #[must_use]
    pub fn format_gpus(&self, gpus: &[PhysicalGpu]) -> String {
        match self.format {
            OutputFormat::Json => to_json(gpus),
            OutputFormat::Text => {
                if gpus.is_empty() {
                    return String::from("No matching GPUs.\n");
                }

                let rows: Vec<GpuRow> = gpus
                    .iter()
                    .map(|g| GpuRow {
                        id: g.id.clone(),
                        state: Self::format_gpu_state(g.state),
                        assigned_to: g.assigned_to.clone().unwrap_or_else(|| String::from("-")),
                        model: g.model.clone().unwrap_or_else(|| String::from("-")),
                        vram: g.vram_gb.map_or_else(|| String::from("-"), |v| format!("{v} GB")),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats a single GPU after a change.
    #[must_use]
    pub fn format_gpu(&self, gpu: &PhysicalGpu) -> String {
        match self.format {
            OutputFormat::Json => to_json(gpu),
            OutputFormat::Text => {
                let assignee = gpu
                    .assigned_to
                    .as_deref()
                    .map_or_else(String::new, |a| format!(" -> {a}"));
                format!(
                    "{} GPU {} is {}{assignee}\n",
                    "✓".green(),
                    gpu.id.bold(),
                    Self::format_gpu_state(gpu.state)
                )
            }
        }
    }

    /// Formats the result of an inventory import.
    #[must_use]
    pub fn format_registration(&self, report: &RegistrationReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Registered {} GPUs ({} mode)\n",
                    "✓".green(),
                    report.total,
                    report.mode
                );
                let _ = writeln!(output, "   Added: {}", report.added);
                let _ = writeln!(output, "   Refreshed: {}", report.refreshed);

                if !report.cancelled_orders.is_empty() {
                    let _ = write!(
                        output,
                        "\n{} Cancelled {} orders holding reset GPUs:\n",
                        "⚠".yellow(),
                        report.cancelled_orders.len()
                    );
                    for id in &report.cancelled_orders {
                        let _ = writeln!(output, "   - {id}");
                    }
                }

                output
            }
        }
    }

    /// Formats a list of orders.
    #[must_use]
    pub fn format_orders(&self, orders: &[RentalOrder]) -> String {
        match self.format {
            OutputFormat::Json => to_json(orders),
            OutputFormat::Text => {
                if orders.is_empty() {
                    return String::from("No orders.\n");
                }

                let rows: Vec<OrderRow> = orders
                    .iter()
                    .map(|o| OrderRow {
                        id: Self::truncate(&o.id, 12),
                        user: o.user_id.clone(),
                        gpu: o.gpu_id.clone().unwrap_or_else(|| String::from("-")),
                        state: Self::format_order_state(o.state),
                        rate: format!("{:.2}", o.rate),
                        hours: o.duration_hours,
                        total: format!("{:.2}", o.total_cost()),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                let open = orders.iter().filter(|o| o.is_open()).count();
                let _ = write!(output, "\n\n{} orders ({open} open)\n", orders.len());
                output
            }
        }
    }

    /// Formats a single order.
    #[must_use]
    pub fn format_order(&self, order: &RentalOrder) -> String {
        match self.format {
            OutputFormat::Json => to_json(order),
            OutputFormat::Text => Self::format_order_text(order),
        }
    }

    /// Formats an order as text.
    fn format_order_text(order: &RentalOrder) -> String {
        let mut output = format!("\nOrder {}\n\n", order.id.bold());
        let _ = writeln!(output, "   User: {}", order.user_id);
        let _ = writeln!(output, "   State: {}", Self::format_order_state(order.state));
        let _ = writeln!(output, "   GPU: {}", order.gpu_id.as_deref().unwrap_or("-"));
        let _ = writeln!(
            output,
            "   Rate: {:.2}/h for {}h ({:.2} total)",
            order.rate,
            order.duration_hours,
            order.total_cost()
        );
        let _ = writeln!(
            output,
            "   Created: {}",
            order.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(
            output,
            "   Updated: {}",
            order.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        output
    }

    /// Formats the outcome of a rent request.
    #[must_use]
    pub fn format_rent(&self, outcome: &RentOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(&RentJson::from(outcome)),
            OutputFormat::Text => {
                let mut output = Self::format_order_text(outcome.order());
                match outcome {
                    RentOutcome::Matched(order) => {
                        let _ = write!(
                            output,
                            "\n{} Matched to {}\n",
                            "✓".green(),
                            order.gpu_id.as_deref().unwrap_or("-")
                        );
                    }
                    RentOutcome::Pending { reason, .. } => {
                        let _ = write!(output, "\n{} Left pending: {reason}\n", "⚠".yellow());
                    }
                }
                output
            }
        }
    }

    /// Formats storage health.
    #[must_use]
    pub fn format_health(&self, health: &StorageHealth) -> String {
        match self.format {
            OutputFormat::Json => to_json(health),
            OutputFormat::Text => {
                let mut output = String::from("\nSnapshot storage\n\n");

                let rows = [&health.primary, &health.backup].map(Self::endpoint_row);
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let active = health.active.map_or_else(
                    || "none".red().to_string(),
                    |role| role.to_string().green().to_string(),
                );
                let _ = write!(output, "\nActive endpoint: {active}\n");

                if let Some(since) = health.failover_since {
                    let _ = writeln!(
                        output,
                        "{} Failed over to backup since {}",
                        "⚠".yellow(),
                        since.format("%Y-%m-%d %H:%M:%S")
                    );
                }

                output
            }
        }
    }

    /// Builds a table row for one endpoint.
    fn endpoint_row(endpoint: &EndpointHealth) -> EndpointRow {
        EndpointRow {
            role: endpoint.role.to_string(),
            backend: endpoint.backend.to_string(),
            location: endpoint.location.clone(),
            available: if endpoint.available {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            },
        }
    }

    /// Formats a persisted snapshot.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &InventorySnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(snapshot),
            OutputFormat::Text => {
                let mut output = String::from("\nSnapshot\n\n");
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(
                    output,
                    "   Checksum: {}",
                    SnapshotHasher::short_hash(&snapshot.checksum)
                );
                let _ = writeln!(
                    output,
                    "   Saved at: {}",
                    snapshot.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
                let _ = writeln!(output, "   GPUs: {}", snapshot.gpus.len());
                let _ = writeln!(output, "   Orders: {}", snapshot.orders.len());
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: result.warnings.clone(),
            }),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    let mut out = format!(
                        "{} Configuration has {} errors:\n",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(out, "   - {error}");
                    }
                    out
                };

                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output
            }
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": "success", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": "warning", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "⚠".yellow()),
        }
    }

    /// Formats a GPU state with color.
    fn format_gpu_state(state: GpuState) -> String {
        match state {
            GpuState::Available => "available".green().to_string(),
            GpuState::Allocated => "allocated".cyan().to_string(),
            GpuState::Maintenance => "maintenance".yellow().to_string(),
            GpuState::Offline => "offline".red().to_string(),
        }
    }

    /// Formats an order state with color.
    fn format_order_state(state: OrderState) -> String {
        match state {
            OrderState::Pending => "pending".yellow().to_string(),
            OrderState::Matched => "matched".cyan().to_string(),
            OrderState::Active => "active".green().to_string(),
            OrderState::Completed => "completed".dimmed().to_string(),
            OrderState::Cancelled => "cancelled".red().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// Pretty JSON, or an empty string if serialization fails.
fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct RentJson<'a> {
    matched: bool,
    order: &'a RentalOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl<'a> From<&'a RentOutcome> for RentJson<'a> {
    fn from(outcome: &'a RentOutcome) -> Self {
        Self {
            matched: outcome.is_matched(),
            order: outcome.order(),
            reason: match outcome {
                RentOutcome::Matched(_) => None,
                RentOutcome::Pending { reason, .. } => Some(reason.to_string()),
            },
        }
    }
}

#[derive(Serialize)]
struct ValidationJson {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocationError;
    use crate::inventory::GpuRecord;
    use crate::lifecycle::RentRequest;
    use chrono::Utc;

    fn order() -> RentalOrder {
        RentalOrder::new(RentRequest::new("alice", 2.5, 4), Utc::now())
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 12), "short");
        assert_eq!(
            OutputFormatter::truncate("0123456789abcdef", 12),
            "012345678..."
        );
    }

    #[test]
    fn test_status_json_lists_every_gpu() {
        let now = Utc::now();
        let statuses: Vec<GpuStatus> = ["g1", "g2"]
            .iter()
            .map(|id| PhysicalGpu::from_record(GpuRecord::new(*id), now).status())
            .collect();

        let output = OutputFormatter::new(OutputFormat::Json).format_status(&statuses);
        let value: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(value[0]["state"], "available");
    }

    #[test]
    fn test_pending_rent_json_carries_reason() {
        let outcome = RentOutcome::Pending {
            order: order(),
            reason: AllocationError::NoCapacity,
        };

        let output = OutputFormatter::new(OutputFormat::Json).format_rent(&outcome);
        let value: serde_json::Value = serde_json::from_str(&output).expect("invalid json");
        assert_eq!(value["matched"], false);
        assert_eq!(value["order"]["state"], "pending");
        assert!(value["reason"].is_string());
    }

    #[test]
    fn test_text_order_mentions_total() {
        let output = OutputFormatter::new(OutputFormat::Text).format_order(&order());
        assert!(output.contains("alice"));
        assert!(output.contains("10.00 total"));
    }

    #[test]
    fn test_empty_status_text() {
        let output = OutputFormatter::new(OutputFormat::Text).format_status(&[]);
        assert!(output.contains("No GPUs registered"));
    }
}

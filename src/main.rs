//! gpulease CLI entrypoint.
//!
//! This is the main entrypoint for the gpulease command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use gpulease::cli::{
    Cli, Commands, GpuCommands, LogFormat, OrderCommands, OutputFormatter, StorageCommands,
};
use gpulease::clock::SystemClock;
use gpulease::config::{
    ConfigParser, ConfigValidator, EndpointConfig, EventSinkKind, LeaseConfig, StorageBackend,
    find_config_file,
};
use gpulease::error::{ConfigError, LeaseError, Result};
use gpulease::events::{ChannelEventSink, EventSink, NoopEventSink, TracingEventSink};
use gpulease::lifecycle::{LifecycleManager, RentRequest};
use gpulease::monitor::StorageMonitor;
use gpulease::storage::{
    EndpointRole, InventorySnapshot, LocalSnapshotStore, PersistenceGuard, S3SnapshotStore,
    SNAPSHOT_FILE, STATE_DIR, SnapshotStore,
};

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_storage_unavailable() {
                eprintln!("Run 'gpulease storage init' if the snapshots were never created.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, &formatter),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        command => {
            let app = App::load(cli.config.as_ref()).await?;
            let result = dispatch(&app, command, &formatter).await;
            app.finish().await;
            result
        }
    }
}

/// Runs a command that needs the manager.
async fn dispatch(app: &App, command: Commands, formatter: &OutputFormatter) -> Result<()> {
    match command {
        Commands::Status => {
            app.manager.restore().await?;
            let statuses = app.manager.get_status().await;
            println!("{}", formatter.format_status(&statuses));
            Ok(())
        }
        Commands::Gpu { command } => cmd_gpu(app, command, formatter).await,
        Commands::Order { command } => cmd_order(app, command, formatter).await,
        Commands::Storage { command } => cmd_storage(app, command, formatter).await,
        Commands::Monitor { interval } => cmd_monitor(app, interval, formatter).await,
        Commands::Init { .. } | Commands::Validate { .. } => Err(LeaseError::internal(
            "command does not need a lifecycle manager",
        )),
    }
}

/// Write a starter configuration.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<()> {
    info!("Initializing gpulease configuration in: {}", path.display());

    let config_path = path.join("gpulease.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!(
            "{}",
            formatter.warning(&format!(
                "Configuration file already exists: {}. Use --force to overwrite.",
                config_path.display()
            ))
        );
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/gpulease.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    // Keep snapshots and secrets out of version control
    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# gpulease")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\n{}", formatter.success("Configuration initialized"));
    eprintln!("Next steps:");
    eprintln!("  1. Edit gpulease.yaml with your storage endpoints and GPUs");
    eprintln!("  2. Run 'gpulease validate' to check your configuration");
    eprintln!("  3. Run 'gpulease storage init' to create the snapshots");
    eprintln!("  4. Run 'gpulease gpu register' to import the inventory");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if let Some(first) = result.errors.first() {
        return Err(LeaseError::Config(ConfigError::validation(
            first.message.clone(),
            first.field.clone(),
        )));
    }

    eprintln!("Configuration summary:");
    eprintln!("  Fleet: {}", config.qualified_name());
    eprintln!("  Primary: {}", config.storage.primary.describe());
    eprintln!("  Backup: {}", config.storage.backup.describe());
    eprintln!("  GPUs: {}", config.inventory.gpus.len());

    Ok(())
}

/// Inventory commands.
async fn cmd_gpu(app: &App, command: GpuCommands, formatter: &OutputFormatter) -> Result<()> {
    let manager = &app.manager;
    manager.restore().await?;

    match command {
        GpuCommands::Register { mode } => {
            let report = manager
                .register_inventory(app.config.inventory.gpus.clone(), mode)
                .await?;
            println!("{}", formatter.format_registration(&report));
        }
        GpuCommands::Allocate { consumer } => {
            let gpu = manager.allocate(&consumer).await?;
            println!("{}", formatter.format_gpu(&gpu));
        }
        GpuCommands::Release { gpu_id } => {
            if manager.release(&gpu_id).await? {
                println!("{}", formatter.success(&format!("Released {gpu_id}")));
            } else {
                println!(
                    "{}",
                    formatter.warning(&format!("GPU {gpu_id} was not allocated"))
                );
            }
        }
        GpuCommands::Transition { gpu_id, target } => {
            let gpu = manager.transition_gpu(&gpu_id, target).await?;
            println!("{}", formatter.format_gpu(&gpu));
        }
        GpuCommands::Decommission { gpu_id } => {
            manager.decommission(&gpu_id).await?;
            println!("{}", formatter.success(&format!("Decommissioned {gpu_id}")));
        }
        GpuCommands::List { state } => {
            let gpus = match state {
                Some(state) => manager.registry().list_by_state(state).await,
                None => manager.registry().list_all().await,
            };
            println!("{}", formatter.format_gpus(&gpus));
        }
    }

    ensure_saved(manager).await
}

/// Rental order commands.
async fn cmd_order(app: &App, command: OrderCommands, formatter: &OutputFormatter) -> Result<()> {
    let manager = &app.manager;
    manager.restore().await?;

    match command {
        OrderCommands::Rent {
            user,
            rate,
            hours,
            gpu,
        } => {
            let outcome = manager.rent(rent_request(user, rate, hours, gpu)).await?;
            println!("{}", formatter.format_rent(&outcome));
        }
        OrderCommands::Create {
            user,
            rate,
            hours,
            gpu,
        } => {
            let order = manager
                .create_order(rent_request(user, rate, hours, gpu))
                .await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::Transition { order_id, target } => {
            let order = manager.transition_order(&order_id, target).await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::Pay { order_id } => {
            let order = manager.confirm_payment(&order_id).await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::Complete { order_id } => {
            let order = manager.complete(&order_id).await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::Cancel { order_id } => {
            let order = manager.cancel(&order_id).await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::Show { order_id } => {
            let order = manager.get_order(&order_id).await?;
            println!("{}", formatter.format_order(&order));
        }
        OrderCommands::List { user } => {
            let orders = manager.list_orders(user.as_deref()).await;
            println!("{}", formatter.format_orders(&orders));
        }
    }

    ensure_saved(manager).await
}

/// Storage commands.
async fn cmd_storage(
    app: &App,
    command: StorageCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let guard = &app.guard;

    match command {
        StorageCommands::Init => {
            let empty = InventorySnapshot::empty(chrono::Utc::now())?;
            let created = guard.initialize(&empty).await?;
            if created.is_empty() {
                println!(
                    "{}",
                    formatter.warning("Both endpoints already have a snapshot")
                );
            } else {
                let roles: Vec<String> = created.iter().map(ToString::to_string).collect();
                println!(
                    "{}",
                    formatter.success(&format!("Created snapshot on {}", roles.join(", ")))
                );
            }
        }
        StorageCommands::Health => {
            let health = guard.health().await;
            println!("{}", formatter.format_health(&health));
        }
        StorageCommands::Recover => {
            app.manager.restore().await?;
            let role = guard.attempt_recovery().await?.role();
            if role == EndpointRole::Primary {
                app.manager.persist().await?;
                println!(
                    "{}",
                    formatter.success("Primary endpoint is active and up to date")
                );
            } else {
                println!(
                    "{}",
                    formatter.warning("Primary endpoint is still unavailable, using backup")
                );
            }
        }
        StorageCommands::Show => match guard.read_snapshot().await? {
            Some(snapshot) => println!("{}", formatter.format_snapshot(&snapshot)),
            None => println!("{}", formatter.warning("No snapshot found")),
        },
    }

    Ok(())
}

/// Watch storage until interrupted.
async fn cmd_monitor(app: &App, interval: Option<u64>, formatter: &OutputFormatter) -> Result<()> {
    app.manager.restore().await?;

    let interval = interval.map_or_else(|| app.config.health_check_interval(), Duration::from_secs);
    let handle = StorageMonitor::new(Arc::clone(&app.manager), interval.max(Duration::from_secs(1)))?
        .spawn();

    eprintln!("Monitoring storage, press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    handle.shutdown().await?;
    app.manager.flush_if_dirty().await?;
    eprintln!("{}", formatter.success("Monitor stopped"));
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a manager-backed command needs.
struct App {
    config: LeaseConfig,
    manager: Arc<LifecycleManager>,
    guard: Arc<PersistenceGuard>,
    event_drain: Option<JoinHandle<()>>,
}

impl App {
    /// Loads configuration and wires storage, events, and the manager.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let base_dir = config_dir(&config_file);
        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;

        let config = parser.load_with_env(&config_file)?;

        let validation = ConfigValidator::new().validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let (events, event_drain) = build_event_sink(&config);

        let state_dir = base_dir.join(STATE_DIR);
        let primary = build_store(
            &config.storage.primary,
            &base_dir,
            state_dir.join(SNAPSHOT_FILE),
        )
        .await?;
        let backup = build_store(
            &config.storage.backup,
            &base_dir,
            state_dir.join("backup").join(SNAPSHOT_FILE),
        )
        .await?;

        let clock = Arc::new(SystemClock);
        let guard = Arc::new(
            PersistenceGuard::new(primary, backup)
                .with_probe_timeout(config.probe_timeout())
                .with_clock(clock.clone())
                .with_events(Arc::clone(&events)),
        );

        let manager = Arc::new(
            LifecycleManager::new(clock)
                .with_guard(Arc::clone(&guard))
                .with_events(events),
        );

        info!("Fleet {} ready", config.qualified_name());

        Ok(Self {
            config,
            manager,
            guard,
            event_drain,
        })
    }

    /// Drops the event sources and waits for queued events to be written.
    async fn finish(self) {
        let Self {
            manager,
            guard,
            event_drain,
            ..
        } = self;
        drop(manager);
        drop(guard);

        if let Some(drain) = event_drain {
            if let Err(e) = drain.await {
                warn!("Event drain task failed: {e}");
            }
        }
    }
}

/// Builds the configured event sink.
///
/// The channel sink is drained by a task that writes one JSON line per event
/// to stderr.
fn build_event_sink(config: &LeaseConfig) -> (Arc<dyn EventSink>, Option<JoinHandle<()>>) {
    match config.events.sink {
        EventSinkKind::Tracing => (Arc::new(TracingEventSink), None),
        EventSinkKind::None => (Arc::new(NoopEventSink), None),
        EventSinkKind::Channel => {
            let (sink, mut receiver) = ChannelEventSink::new(config.events.channel_capacity);
            let drain = tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{line}"),
                        Err(e) => warn!("Failed to encode {}: {e}", event.name()),
                    }
                }
            });
            (Arc::new(sink), Some(drain))
        }
    }
}

/// Creates a snapshot store for one endpoint.
///
/// Relative local paths are resolved against the configuration directory.
async fn build_store(
    endpoint: &EndpointConfig,
    base_dir: &Path,
    default_path: PathBuf,
) -> Result<Arc<dyn SnapshotStore>> {
    match endpoint.backend {
        StorageBackend::Local => {
            let path = endpoint
                .path
                .as_ref()
                .map_or(default_path, |p| base_dir.join(p));
            Ok(Arc::new(LocalSnapshotStore::with_snapshot_path(path)))
        }
        StorageBackend::S3 => {
            let bucket = endpoint
                .bucket
                .as_deref()
                .ok_or_else(|| LeaseError::internal("S3 bucket not configured"))?;
            let prefix = endpoint.prefix.as_deref();
            let region = endpoint.region.as_deref();
            Ok(Arc::new(S3SnapshotStore::new(bucket, prefix, region).await))
        }
    }
}

/// Fails if a mutation could not be written to either endpoint.
async fn ensure_saved(manager: &LifecycleManager) -> Result<()> {
    if manager.flush_if_dirty().await? {
        info!("Pending changes saved on retry");
    }
    Ok(())
}

/// Builds a rent request from CLI arguments.
fn rent_request(user: String, rate: f64, hours: u32, gpu: Option<String>) -> RentRequest {
    let request = RentRequest::new(user, rate, hours);
    match gpu {
        Some(gpu_id) => request.for_gpu(gpu_id),
        None => request,
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

//! Offsync CLI - Command line interface for the offline action log.
//!
//! This tool queues actions, inspects the log and runs the sync engine
//! against a remote service.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use offsync_common::{ActionId, ActionType, HttpMethod, Priority};
use offsync_storage::{ActionLog, LogConfig, NewAction, OfflineAction};
use offsync_sync::{
    ConnectivityNotifier, EngineMode, HttpTransport, ManualConnectivity, ReachabilityProbe,
    SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - Offline action queue and sync engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the action log database.
    #[arg(long, env = "OFFSYNC_DB", global = true)]
    db: Option<PathBuf>,

    /// Base URL of the remote service.
    #[arg(long, env = "OFFSYNC_URL", global = true)]
    url: Option<String>,

    /// JSON settings file with `sync` and `log` sections.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an action.
    Enqueue {
        /// Module the action belongs to (e.g. "customers").
        #[arg(short, long)]
        module: String,

        /// Endpoint, relative to the base URL.
        #[arg(short, long)]
        endpoint: String,

        /// Action kind: create, update or delete.
        #[arg(short = 't', long = "type", default_value = "create")]
        action_type: ActionType,

        /// HTTP method.
        #[arg(short = 'X', long, default_value = "POST")]
        method: HttpMethod,

        /// JSON payload.
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header as "Name: value". Repeatable.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Priority: critical, high, normal, low or 1-4.
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Action that must sync first. Repeatable.
        #[arg(long = "after")]
        dependencies: Vec<ActionId>,
    },

    /// List pending actions.
    Pending,

    /// Show one action and its audit trail.
    Show {
        /// Action id.
        id: ActionId,
    },

    /// Run one sync pass now.
    Sync {
        /// Override the configured engine mode.
        #[arg(long)]
        mode: Option<EngineMode>,
    },

    /// Run the engine until interrupted.
    Run {
        /// host:port used to detect connectivity (default: the base URL).
        #[arg(long)]
        probe: Option<String>,

        /// Seconds between connectivity probes.
        #[arg(long, default_value_t = 10)]
        probe_interval: u64,

        /// Override the configured engine mode.
        #[arg(long)]
        mode: Option<EngineMode>,
    },

    /// Show the audit trail.
    Logs {
        /// Number of newest entries to show.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Only entries for this action.
        #[arg(short, long)]
        action: Option<ActionId>,
    },

    /// Print a cached response.
    CacheGet {
        /// Cache key (usually the endpoint).
        key: String,
    },

    /// Mark an action failed without sending it.
    Fail {
        /// Action id.
        id: ActionId,

        /// Reason recorded on the action.
        #[arg(short, long, default_value = "Abandoned by operator")]
        reason: String,
    },

    /// Purge entries older than the retention window.
    Cleanup,

    /// Show log statistics.
    Stats,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Settings file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    sync: SyncConfig,
    log: LogConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the verbosity flag.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "offsync", &mut std::io::stdout());
        return Ok(());
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let db = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let log = open_log(&db, settings.log).await?;

    let result = match cli.command {
        Commands::Enqueue {
            module,
            endpoint,
            action_type,
            method,
            data,
            headers,
            priority,
            dependencies,
        } => {
            let mut action = NewAction::new(action_type, module, endpoint, method)
                .with_priority(priority)
                .with_dependencies(dependencies);
            if let Some(data) = data {
                action = action.with_data(serde_json::from_str(&data).context("Invalid --data JSON")?);
            }
            for header in &headers {
                let (name, value) = parse_header(header)?;
                action = action.with_header(name, value);
            }
            cmd_enqueue(&log, action).await
        }

        Commands::Pending => cmd_pending(&log).await,

        Commands::Show { id } => cmd_show(&log, id).await,

        Commands::Sync { mode } => {
            let config = with_mode(settings.sync, mode);
            cmd_sync(log.clone(), cli.url.as_deref(), config).await
        }

        Commands::Run {
            probe,
            probe_interval,
            mode,
        } => {
            let config = with_mode(settings.sync, mode);
            cmd_run(
                log.clone(),
                cli.url.as_deref(),
                config,
                probe,
                Duration::from_secs(probe_interval),
            )
            .await
        }

        Commands::Logs { limit, action } => cmd_logs(&log, limit, action).await,

        Commands::CacheGet { key } => cmd_cache_get(&log, &key).await,

        Commands::Fail { id, reason } => cmd_fail(&log, id, &reason).await,

        Commands::Cleanup => cmd_cleanup(&log).await,

        Commands::Stats => cmd_stats(&log).await,

        Commands::Completions { .. } => Ok(()),
    };

    log.close().await.context("Failed to close action log")?;
    result
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("No data directory on this platform; pass --db")?
        .join("offsync");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join("actions.db"))
}

async fn open_log(path: &Path, config: LogConfig) -> Result<Arc<ActionLog>> {
    let log = ActionLog::open(path).with_config(config);
    log.init()
        .await
        .with_context(|| format!("Failed to open action log at {}", path.display()))?;
    Ok(Arc::new(log))
}

fn with_mode(config: SyncConfig, mode: Option<EngineMode>) -> SyncConfig {
    match mode {
        Some(mode) => config.with_mode(mode),
        None => config,
    }
}

/// Split a "Name: value" header argument.
fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("Header must look like \"Name: value\": {}", header))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header name is empty: {}", header);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn build_engine(
    log: Arc<ActionLog>,
    url: Option<&str>,
    config: SyncConfig,
    connectivity: Arc<dyn ConnectivityNotifier>,
) -> Result<SyncEngine> {
    let url = url.context("Remote base URL required: pass --url or set OFFSYNC_URL")?;
    let transport = HttpTransport::new(url, config.request_timeout)?;
    Ok(SyncEngine::new(log, Arc::new(transport), connectivity, config)?)
}

fn print_action(action: &OfflineAction) {
    println!(
        "  #{:<5} {:<8} {:<6} {:<7} {} ({}, retries: {})",
        action.id,
        action.priority,
        action.method,
        action.action_type,
        action.endpoint,
        action.module,
        action.retry_count
    );
}

/// Queue an action.
async fn cmd_enqueue(log: &ActionLog, action: NewAction) -> Result<()> {
    let id = log.add_offline_action(action).await?;
    println!("Queued action {}", id);
    Ok(())
}

/// List pending actions.
async fn cmd_pending(log: &ActionLog) -> Result<()> {
    let mut actions = log.get_pending_actions().await?;
    if actions.is_empty() {
        println!("No pending actions.");
        return Ok(());
    }

    actions.sort_by_key(|a| (a.priority, a.timestamp, a.id));
    println!("Pending actions ({}):", actions.len());
    for action in &actions {
        print_action(action);
    }
    Ok(())
}

/// Show one action with its audit trail.
async fn cmd_show(log: &ActionLog, id: ActionId) -> Result<()> {
    let action = log.get_action(id).await?;
    println!("{}", serde_json::to_string_pretty(&action)?);

    let entries = log.logs_for_action(id).await?;
    if !entries.is_empty() {
        println!("\nAudit trail:");
        for entry in entries {
            println!(
                "  {} [{}] {}: {}",
                entry.timestamp.to_rfc3339(),
                entry.status,
                entry.action,
                entry.message
            );
        }
    }
    Ok(())
}

/// Run one pass against the remote service.
async fn cmd_sync(log: Arc<ActionLog>, url: Option<&str>, config: SyncConfig) -> Result<()> {
    let connectivity = Arc::new(ManualConnectivity::new(true));
    let engine = build_engine(log, url, config, connectivity)?;

    let report = engine.force_sync().await.context("Sync failed")?;
    println!(
        "Sync complete: {} synced, {} failed ({} permanently), {} deferred, {} conflicts resolved",
        report.success_count,
        report.failure_count,
        report.failed_permanently,
        report.deferred_count,
        report.conflicts_resolved
    );
    if report.manual_count > 0 {
        println!("  {} action(s) need manual conflict resolution", report.manual_count);
    }
    Ok(())
}

/// Run the engine until Ctrl-C.
async fn cmd_run(
    log: Arc<ActionLog>,
    url: Option<&str>,
    config: SyncConfig,
    probe: Option<String>,
    probe_interval: Duration,
) -> Result<()> {
    let target = match probe {
        Some(target) => target,
        None => {
            let base = url.context("Remote base URL required: pass --url or set OFFSYNC_URL")?;
            probe_target(base)?
        }
    };

    let cleanup = log.cleanup().await?;
    info!(
        "Startup cleanup: {} actions, {} cache entries, {} log entries removed",
        cleanup.actions_removed, cleanup.cache_removed, cleanup.logs_removed
    );

    let probe = Arc::new(ReachabilityProbe::new(target, probe_interval));
    probe.check().await;

    let engine = Arc::new(build_engine(log, url, config, probe.clone())?);
    let probe_shutdown = CancellationToken::new();
    let probe_task = probe.clone().spawn(probe_shutdown.clone());

    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                "Pass finished: {} synced, {} failed",
                event.success_count(),
                event.failure_count()
            );
        }
    });

    let handle = engine.start()?;
    if probe.is_online() {
        // Drain whatever is already queued.
        if let Err(e) = engine.sync_pending().await {
            warn!("Initial sync failed: {}", e);
        }
    }

    println!("Sync engine running against {}. Press Ctrl-C to stop.", probe.target());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    handle.shutdown().await;
    probe_shutdown.cancel();
    let _ = probe_task.await;
    reporter.abort();
    Ok(())
}

/// Derive a host:port probe target from the base URL.
fn probe_target(base: &str) -> Result<String> {
    let url = Url::parse(base).with_context(|| format!("Invalid base URL: {}", base))?;
    let host = url.host_str().context("Base URL has no host")?;
    let port = url
        .port_or_known_default()
        .context("Base URL has no port")?;
    Ok(format!("{}:{}", host, port))
}

/// Show the audit trail.
async fn cmd_logs(log: &ActionLog, limit: usize, action: Option<ActionId>) -> Result<()> {
    let entries = match action {
        Some(id) => log.logs_for_action(id).await?,
        None => log.sync_logs(Some(limit)).await?,
    };
    if entries.is_empty() {
        println!("No log entries.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} [{:<7}] {}: {}",
            entry.timestamp.to_rfc3339(),
            entry.status,
            entry.action,
            entry.message
        );
    }
    Ok(())
}

/// Print a cached response.
async fn cmd_cache_get(log: &ActionLog, key: &str) -> Result<()> {
    match log.get_cached_data(key).await? {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("No fresh cache entry for {}", key),
    }
    Ok(())
}

/// Mark an action failed.
async fn cmd_fail(log: &ActionLog, id: ActionId, reason: &str) -> Result<()> {
    log.fail_action(id, reason).await?;
    println!("Action {} marked failed", id);
    Ok(())
}

/// Purge old entries.
async fn cmd_cleanup(log: &ActionLog) -> Result<()> {
    let report = log.cleanup().await?;
    println!("Cleanup complete:");
    println!("  Actions removed: {}", report.actions_removed);
    println!("  Cache entries removed: {}", report.cache_removed);
    println!("  Log entries removed: {}", report.logs_removed);
    Ok(())
}

/// Show statistics.
async fn cmd_stats(log: &ActionLog) -> Result<()> {
    let stats = log.stats().await?;
    println!("Action log statistics:");
    println!("  Pending: {}", stats.pending);
    println!("  Completed: {}", stats.completed);
    println!("  Failed: {}", stats.failed);
    println!("  Cached responses: {}", stats.cached);
    println!("  Log entries: {}", stats.logs);
    Ok(())
}

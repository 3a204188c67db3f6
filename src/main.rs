// ABOUTME: CLI entry point for monday-replicator
// ABOUTME: Parses commands, wires source, sinks and watermark store, and routes to handlers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use monday_replicator::clock::SystemClock;
use monday_replicator::config::{parse_board_ids, Config};
use monday_replicator::daemon::{CycleStats, DaemonConfig, SyncDaemon};
use monday_replicator::planner::{PlannerSettings, SyncPlanner};
use monday_replicator::remote::{HttpTransport, RequestClient};
use monday_replicator::sink::{postgres, Emitter, JsonlSink, PostgresSink};
use monday_replicator::source::{MondaySource, ObjectType};
use monday_replicator::watermark::{watermark_key, FileWatermarkStore, WatermarkStore};

#[derive(Parser)]
#[command(name = "monday-replicator")]
#[command(about = "Incremental Monday.com replication CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct StateArgs {
    /// Path to monday-replicator.toml (defaults to ./monday-replicator.toml, then ~/.monday-replicator/config.toml)
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// Watermark file (overrides [sync] state_path)
    #[arg(long)]
    state_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync objects from Monday.com into JSONL files or PostgreSQL
    ///
    /// The first run of each object takes a full snapshot. Later runs of boards
    /// and items read the activity log and fetch only what changed.
    Sync {
        #[command(flatten)]
        state: StateArgs,
        /// Monday.com API token
        #[arg(long, env = "MONDAY_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,
        /// Objects to sync (comma-separated, default: all)
        #[arg(long, value_delimiter = ',')]
        objects: Option<Vec<String>>,
        /// Restrict board-scoped objects to these boards (comma-separated)
        #[arg(long)]
        board_ids: Option<String>,
        /// Write one <object>.jsonl file per object into this directory (default: ./monday-data)
        #[arg(long, conflicts_with = "target")]
        output: Option<PathBuf>,
        /// Upsert into monday_<object> JSONB tables of this PostgreSQL database
        #[arg(long)]
        target: Option<String>,
        /// Rows per PostgreSQL upsert statement
        #[arg(long, default_value_t = postgres::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// API endpoint (overrides [connection] endpoint)
        #[arg(long)]
        endpoint: Option<String>,
        /// Concurrent requests per run (overrides [sync] workers)
        #[arg(long)]
        workers: Option<usize>,
        /// Seconds subtracted from the watermark before reading the activity log
        #[arg(long)]
        lookback_secs: Option<u64>,
        /// Run continuously, starting a cycle every N seconds
        #[arg(long)]
        interval: Option<u64>,
        /// Run a single sync cycle and exit (default)
        #[arg(long, conflicts_with = "interval")]
        once: bool,
        /// Discard stored watermarks of the selected objects first
        #[arg(long)]
        full_refresh: bool,
    },
    /// List the objects that can be synced
    Objects,
    /// Inspect or reset stored watermarks
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Show stored watermarks
    Show {
        #[command(flatten)]
        state: StateArgs,
    },
    /// Delete stored watermarks so the next run takes a full snapshot
    Reset {
        #[command(flatten)]
        state: StateArgs,
        /// Only reset this object (all of its board scopes)
        #[arg(long)]
        object: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Sync {
            state,
            api_token,
            objects,
            board_ids,
            output,
            target,
            batch_size,
            endpoint,
            workers,
            lookback_secs,
            interval,
            once,
            full_refresh,
        } => {
            let mut config = Config::discover(state.config_path.as_deref())?;
            if let Some(endpoint) = endpoint {
                config.connection.endpoint = endpoint;
            }
            if let Some(workers) = workers {
                config.sync.workers = workers;
            }
            if let Some(lookback_secs) = lookback_secs {
                config.sync.lookback_secs = lookback_secs;
            }
            if let Some(path) = state.state_path {
                config.sync.state_path = path;
            }

            let objects = parse_objects(objects)?;
            if let Some(raw) = board_ids {
                let ids = parse_board_ids(&raw);
                for object in objects.iter().filter(|o| o.is_board_scoped()) {
                    config.options_mut(*object).board_ids = Some(ids.clone());
                }
            }
            config.validate()?;

            let api_token = api_token.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
                anyhow::anyhow!(
                    "Monday.com API token not provided. Use `--api-token` or set MONDAY_API_TOKEN."
                )
            })?;

            let emitter: Arc<dyn Emitter> = match target {
                Some(url) => Arc::new(PostgresSink::connect(&url, batch_size).await?),
                None => Arc::new(
                    JsonlSink::create(output.unwrap_or_else(|| PathBuf::from("monday-data"))).await?,
                ),
            };

            let interval = if once { None } else { interval };
            run_sync(config, api_token, objects, emitter, interval, full_refresh).await
        }
        Commands::Objects => {
            print_objects();
            Ok(())
        }
        Commands::State { command } => match command {
            StateCommands::Show { state } => show_state(&state).await,
            StateCommands::Reset { state, object } => reset_state(&state, object.as_deref()).await,
        },
    }
}

fn parse_objects(objects: Option<Vec<String>>) -> Result<Vec<ObjectType>> {
    let Some(names) = objects else {
        return Ok(ObjectType::ALL.to_vec());
    };
    let mut parsed = Vec::new();
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let object: ObjectType = name.parse()?;
        if !parsed.contains(&object) {
            parsed.push(object);
        }
    }
    if parsed.is_empty() {
        bail!("No objects selected. Use `monday-replicator objects` to list them.");
    }
    Ok(parsed)
}

fn state_store(state: &StateArgs) -> Result<FileWatermarkStore> {
    let path = match &state.state_path {
        Some(path) => path.clone(),
        None => Config::discover(state.config_path.as_deref())?.sync.state_path,
    };
    Ok(FileWatermarkStore::new(path))
}

async fn run_sync(
    config: Config,
    api_token: String,
    objects: Vec<ObjectType>,
    emitter: Arc<dyn Emitter>,
    interval: Option<u64>,
    full_refresh: bool,
) -> Result<()> {
    let transport = HttpTransport::new(
        &config.connection.endpoint,
        api_token,
        config.connection.api_version.clone(),
        config.timeout(),
    )?;
    let client = RequestClient::new(Arc::new(transport), config.backoff_policy());
    let source = Arc::new(MondaySource::new(client, config.source_settings()));

    let store = Arc::new(FileWatermarkStore::new(config.sync.state_path.clone()));
    tracing::info!("Watermarks stored in {}", store.path().display());

    if full_refresh {
        for &object in &objects {
            let key = watermark_key(object, config.options_for(object).board_ids.as_deref());
            if store.remove(&key).await?.is_some() {
                tracing::info!("Discarded watermark '{}' (full refresh)", key);
            }
        }
    }

    let planner = Arc::new(SyncPlanner::new(
        source,
        store,
        emitter,
        Arc::new(SystemClock),
        PlannerSettings {
            lookback: config.lookback(),
            differ: config.differ_settings(),
        },
    ));

    let daemon_config = DaemonConfig {
        objects,
        sync_interval: Duration::from_secs(interval.unwrap_or(0).max(1)),
    };
    let daemon = SyncDaemon::new(planner, Arc::new(config), daemon_config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    if interval.is_some() {
        tracing::info!("Starting continuous sync, press Ctrl+C to stop");
        return daemon.run(shutdown_rx).await;
    }

    match daemon.run_once(shutdown_rx).await {
        Some(stats) => report(&stats),
        None => bail!("Sync interrupted; watermarks of unfinished runs were not committed"),
    }
}

fn report(stats: &CycleStats) -> Result<()> {
    println!();
    println!("{:<14} {:<10} {:<14} {:>16}", "OBJECT", "STATUS", "MODE", "EMITTED");
    for run in &stats.runs {
        println!("{}", run);
    }
    for key in &stats.skipped {
        println!("{:<14} SKIPPED (run already in progress)", key);
    }
    println!();
    println!(
        "{} run(s), {} record(s) in {:.1}s",
        stats.runs.len(),
        stats.records_emitted(),
        stats.duration_ms as f64 / 1000.0
    );

    if !stats.is_success() {
        bail!("{} of {} sync run(s) failed", stats.failed(), stats.runs.len());
    }
    Ok(())
}

fn print_objects() {
    println!(
        "{:<14} {:<10} {:<14} {}",
        "OBJECT", "INGESTION", "PRIMARY KEY", "SCOPE"
    );
    for object in ObjectType::ALL {
        println!(
            "{:<14} {:<10} {:<14} {}",
            object.as_str(),
            object.ingestion_type(),
            object.primary_keys().join(","),
            if object.is_board_scoped() { "board" } else { "account" }
        );
    }
}

async fn show_state(state: &StateArgs) -> Result<()> {
    let store = state_store(state)?;
    let watermarks = store.list().await?;
    if watermarks.is_empty() {
        println!("No watermarks stored in {}", store.path().display());
        return Ok(());
    }

    println!("Watermarks in {}:", store.path().display());
    for (key, watermark) in watermarks {
        let emitted = watermark
            .cursor_metadata
            .as_ref()
            .and_then(|m| m.get("records_emitted"))
            .and_then(|v| v.as_u64());
        println!(
            "  {:<30} {}  {:<14} {}",
            key,
            watermark.last_sync_timestamp.to_rfc3339(),
            watermark.mode_used,
            emitted
                .map(|n| format!("{} record(s)", n))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn reset_state(state: &StateArgs, object: Option<&str>) -> Result<()> {
    let store = state_store(state)?;
    let object: Option<ObjectType> = object.map(str::parse).transpose()?;

    let prefix = object.map(|o| format!("{}:", o.as_str()));
    let mut removed = 0usize;
    for (key, _) in store.list().await.context("Failed to read watermarks")? {
        let matches = match (object, &prefix) {
            (Some(object), Some(prefix)) => key == object.as_str() || key.starts_with(prefix),
            _ => true,
        };
        if matches && store.remove(&key).await?.is_some() {
            removed += 1;
        }
    }

    match object {
        Some(object) => println!("Removed {} watermark(s) for {}", removed, object),
        None => println!("Removed {} watermark(s)", removed),
    }
    Ok(())
}

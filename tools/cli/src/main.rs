//! Tandem CLI - offline-first record sync from the command line.
//!
//! Records live in a local directory; every command works without a
//! network connection and queues writes until the remote is reachable.

mod config;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tandem_common::{EntityType, Record};
use tandem_store::{create_default_registry, FileLocalStore, StaticCredentials};
use tandem_sync::{
    ChangeNotifier, ConflictResolution, SyncEngine, SyncMode, SyncProgress, SyncRequest, SyncResult,
    SyncScheduler,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem - offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to tandem.json.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, last sync time, queue and conflicts.
    Status,

    /// Upload every local record to a fresh remote account.
    InitSync,

    /// Push queued writes, then pull remote changes.
    Sync,

    /// Pull remote changes only.
    Pull {
        /// Pull changes accepted after this RFC 3339 time instead of the
        /// last sync time.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Replay queued writes only.
    PushQueue,

    /// Inspect and manage queued writes.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// List outstanding conflicts.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        /// Conflict id.
        id: Uuid,

        #[arg(value_enum)]
        resolution: Resolution,
    },

    /// Read and write records.
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Keep syncing in the foreground until interrupted.
    Watch {
        /// Sync every N seconds in addition to the configured mode.
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued writes in replay order.
    List,
    /// Re-arm a write held after too many failures.
    Retry { id: Uuid },
    /// Drop a queued write without sending it.
    Discard { id: Uuid },
    /// Drop every queued write.
    Clear,
}

#[derive(Subcommand)]
enum RecordAction {
    /// Create a record from a JSON payload.
    Add { entity_type: String, data: String },
    /// List records of a type.
    List { entity_type: String },
    /// Show one record.
    Get { entity_type: String, id: Uuid },
    /// Replace a record's payload.
    Update {
        entity_type: String,
        id: Uuid,
        data: String,
    },
    /// Delete a record.
    Delete { entity_type: String, id: Uuid },
}

#[derive(Clone, Copy, ValueEnum)]
enum Resolution {
    KeepLocal,
    KeepServer,
    Merge,
}

impl From<Resolution> for ConflictResolution {
    fn from(value: Resolution) -> Self {
        match value {
            Resolution::KeepLocal => ConflictResolution::KeepLocal,
            Resolution::KeepServer => ConflictResolution::KeepServer,
            Resolution::Merge => ConflictResolution::Merge,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;
    let engine = open_engine(&config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Status => cmd_status(&engine, json).await,
        Commands::InitSync => report(engine.perform_initial_sync().await, json),
        Commands::Sync => report(engine.sync_changes().await, json),
        Commands::Pull { since } => report(engine.pull_changes(since).await, json),
        Commands::PushQueue => report(engine.process_offline_queue().await, json),
        Commands::Queue { action } => cmd_queue(&engine, action, json).await,
        Commands::Conflicts => cmd_conflicts(&engine, json).await,
        Commands::Resolve { id, resolution } => {
            report(engine.resolve_conflict(id, resolution.into()).await, json)
        }
        Commands::Record { action } => cmd_record(&engine, action).await,
        Commands::Watch { interval } => cmd_watch(engine, interval).await,
    }
}

async fn open_engine(config: &CliConfig) -> Result<SyncEngine> {
    let records_dir = config.records_dir()?;
    let state_dir = config.state_dir()?;
    debug!("Records in {}, sync state in {}", records_dir.display(), state_dir.display());

    let local = Arc::new(FileLocalStore::new(&records_dir).context("Failed to open local records")?);
    let credentials = Arc::new(StaticCredentials::new(config.access_token.clone()));
    let remote = create_default_registry()
        .resolve(&config.remote.provider, config.remote.config.clone(), credentials.clone())
        .with_context(|| format!("Failed to set up remote '{}'", config.remote.provider))?;

    let engine = SyncEngine::open(config.sync.clone(), local, remote, credentials, &state_dir)
        .await
        .context("Failed to open sync engine")?;

    engine.on_progress(Arc::new(|progress: &SyncProgress| {
        if progress.total_items > 0 {
            eprintln!(
                "  [{}/{}] {}",
                progress.processed_items, progress.total_items, progress.message
            );
        }
    }));

    Ok(engine)
}

/// Print a sync result; a failed pass makes the process fail.
fn report(result: SyncResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "{} ({} synced, {} conflicts)",
            if result.success { "Done" } else { "Failed" },
            result.items_synced,
            result.conflicts
        );
        for message in &result.messages {
            println!("  - {}", message);
        }
    }

    match result.error {
        Some(error) if !result.success => anyhow::bail!(error),
        _ => Ok(()),
    }
}

async fn cmd_status(engine: &SyncEngine, json: bool) -> Result<()> {
    let available = engine.is_sync_available().await;
    let last_sync = engine.last_sync_time().await;
    let pending = engine.pending_operations().await.len();
    let conflicts = engine.get_conflicts().await.len();

    if json {
        let status = serde_json::json!({
            "status": engine.status(),
            "available": available,
            "lastSyncTime": last_sync,
            "pendingOperations": pending,
            "conflicts": conflicts,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Sync Status:");
    println!("  Status: {}", engine.status());
    println!(
        "  Last sync: {}",
        last_sync.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    );
    println!("  Pending operations: {}", pending);
    println!("  Conflicts: {}", conflicts);

    Ok(())
}

async fn cmd_queue(engine: &SyncEngine, action: QueueAction, json: bool) -> Result<()> {
    match action {
        QueueAction::List => {
            let pending = engine.pending_operations().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("Queue is empty.");
            } else {
                let max_retries = engine.config().max_retries;
                for op in pending {
                    let held = if op.is_exhausted(max_retries) { " [held]" } else { "" };
                    println!(
                        "  {} {} {}/{} at {} (retries: {}){}",
                        op.id,
                        op.kind,
                        op.entity_type,
                        op.entity_id,
                        op.timestamp.to_rfc3339(),
                        op.retry_count,
                        held
                    );
                    if let Some(error) = &op.last_error {
                        println!("      last error: {}", error);
                    }
                }
            }
            Ok(())
        }
        QueueAction::Retry { id } => report(engine.retry_operation(id).await, json),
        QueueAction::Discard { id } => report(engine.discard_operation(id).await, json),
        QueueAction::Clear => report(engine.clear_queue().await, json),
    }
}

async fn cmd_conflicts(engine: &SyncEngine, json: bool) -> Result<()> {
    let conflicts = engine.get_conflicts().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    for conflict in conflicts {
        println!("Conflict {}", conflict.id);
        println!("  Record: {}/{}", conflict.entity_type, conflict.entity_id);
        println!("  Local modified:  {}", conflict.local_modified_at.to_rfc3339());
        println!("  Server modified: {}", conflict.server_modified_at.to_rfc3339());
        if conflict.server_version.is_none() {
            println!("  Server deleted this record.");
        }
    }
    Ok(())
}

fn parse_payload(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).context("Record data must be valid JSON")
}

async fn cmd_record(engine: &SyncEngine, action: RecordAction) -> Result<()> {
    match action {
        RecordAction::Add { entity_type, data } => {
            let entity_type = EntityType::new(entity_type)?;
            let repo = engine.repository(&entity_type)?;
            let record = repo
                .add(Record::new(entity_type, parse_payload(&data)?))
                .await
                .context("Failed to add record")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RecordAction::List { entity_type } => {
            let repo = engine.repository(&EntityType::new(entity_type)?)?;
            let records = repo.get_all().await.context("Failed to list records")?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        RecordAction::Get { entity_type, id } => {
            let repo = engine.repository(&EntityType::new(entity_type)?)?;
            match repo.get_by_id(id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("Record {} not found", id),
            }
        }
        RecordAction::Update {
            entity_type,
            id,
            data,
        } => {
            let repo = engine.repository(&EntityType::new(entity_type)?)?;
            let mut record = repo
                .get_by_id(id)
                .await?
                .with_context(|| format!("Record {} not found", id))?;
            record.data = parse_payload(&data)?;
            let record = repo.update(record).await.context("Failed to update record")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RecordAction::Delete { entity_type, id } => {
            let repo = engine.repository(&EntityType::new(entity_type)?)?;
            if !repo.delete(id).await.context("Failed to delete record")? {
                anyhow::bail!("Record {} not found", id);
            }
            println!("Record deleted: {}", id);
        }
    }

    if !engine.pending_operations().await.is_empty() {
        info!("Changes queued until the remote is reachable");
    }
    Ok(())
}

async fn cmd_watch(engine: SyncEngine, interval: Option<u64>) -> Result<()> {
    let engine = Arc::new(engine);

    let (notifier, batches, _debounce) = ChangeNotifier::spawn(engine.config().debounce_window());
    engine.set_notifier(notifier);

    let mode = match interval {
        Some(interval_secs) => SyncMode::Hybrid { interval_secs },
        None => engine.config().sync_mode.clone(),
    };
    let (scheduler, handle) = SyncScheduler::new(mode.clone());

    let worker = engine.clone();
    let runner = tokio::spawn(handle.run(
        move |request| {
            let engine = worker.clone();
            async move {
                match request {
                    SyncRequest::Initial => engine.perform_initial_sync().await,
                    SyncRequest::Incremental => engine.sync_changes().await,
                    SyncRequest::OfflineQueue => engine.process_offline_queue().await,
                    SyncRequest::Shutdown => SyncResult::ok(),
                }
            }
        },
        Some(batches),
    ));

    println!("Watching ({:?}). Press Ctrl+C to stop.", mode);
    let mut status = engine.subscribe_status();
    let first = scheduler.request_incremental().await?;
    if !first.success {
        println!("Initial pass failed: {}", first.error.as_deref().unwrap_or("unknown error"));
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("Status: {}", *status.borrow_and_update());
            }
        }
    }

    scheduler.shutdown().await;
    runner.await.context("Scheduler task failed")?;
    println!("Stopped.");
    Ok(())
}

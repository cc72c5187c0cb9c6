use anyhow::Context;
use clap::{Parser, Subcommand};

use fleetsync::model::{KindQueueStats, ReferenceKind};
use fleetsync::storage::repository;
use fleetsync::{
    Breakdown, EngineConfig, FleetSync, FuelDotation, RentalBon, StockExit, SyncStatus,
    TransactionalEntity, TransactionalKind, TransactionalRecord, TransportBon,
};

#[derive(Parser)]
#[command(name = "fleetsync", about = "Offline-first sync engine for fleet records")]
struct Cli {
    /// Database path (default: ~/.fleetsync/fleetsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Work offline: never contact the server
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that prints each finished report.
struct ReportPrinter;

impl fleetsync::SyncProgress for ReportPrinter {
    fn on_complete(&self, report: &fleetsync::SyncReport) {
        print_report(report);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, queue and cache status
    Status,
    /// List queued items awaiting sync
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records of a kind (merged with the server when online)
    List {
        /// fuel_dotation, stock_exit, transport_bon, rental_bon or breakdown
        kind: TransactionalKind,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a record from a JSON body
    Create {
        kind: TransactionalKind,
        /// Record fields as JSON (camelCase)
        body: String,
    },
    /// Replace a record's fields from a JSON body
    Update {
        kind: TransactionalKind,
        local_id: i64,
        body: String,
    },
    /// Delete a record
    Delete {
        kind: TransactionalKind,
        local_id: i64,
    },
    /// Show aggregates for a kind
    Stats { kind: TransactionalKind },
    /// Drain the sync queue now
    Sync {
        /// Include parked items
        #[arg(long)]
        force: bool,
    },
    /// Make failed items eligible again and replay them
    RetryFailed,
    /// Permanently discard failed items and their unsent records
    ClearFailed {
        /// Confirm that unsent data will be lost
        #[arg(long)]
        yes: bool,
    },
    /// Refresh reference data from the server
    Refresh {
        /// Only this kind (default: all)
        kind: Option<ReferenceKind>,
    },
    /// Show cached reference data
    References {
        kind: ReferenceKind,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the engine in the foreground until Ctrl-C
    Run,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

/// Run a generic helper for the entity type behind a kind.
macro_rules! for_kind {
    ($kind:expr, $helper:ident ( $($arg:expr),* )) => {
        match $kind {
            TransactionalKind::FuelDotation => $helper::<FuelDotation>($($arg),*).await,
            TransactionalKind::StockExit => $helper::<StockExit>($($arg),*).await,
            TransactionalKind::TransportBon => $helper::<TransportBon>($($arg),*).await,
            TransactionalKind::RentalBon => $helper::<RentalBon>($($arg),*).await,
            TransactionalKind::Breakdown => $helper::<Breakdown>($($arg),*).await,
        }
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => fleetsync::Database::open_at(path).await?,
        None => fleetsync::Database::open().await?,
    };

    match cli.command {
        Commands::Status => print_status(&db).await?,
        Commands::Queue { json } => print_queue(&db, json).await?,
        Commands::Config { action } => handle_config(&db, action).await?,
        Commands::References { kind, json } => {
            let rows = db
                .read(move |conn| repository::list_references(conn, kind))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No cached {kind}. Run: fleetsync refresh {kind}");
            } else {
                for row in rows {
                    let id = row.remote_id.as_deref().unwrap_or("-");
                    let flag = if row.active { "" } else { " (inactive)" };
                    println!("{:>6}  {:<12}  {}{flag}", row.local_id, id, row.label);
                }
            }
        }
        command => {
            let engine = connect(db, cli.offline).await?;
            run_engine_command(&engine, command).await?;
            engine.shutdown();
        }
    }

    Ok(())
}

async fn connect(db: fleetsync::Database, offline: bool) -> anyhow::Result<FleetSync> {
    let engine = FleetSync::connect(db).await?;
    if offline {
        engine.force_offline(true);
    } else if !engine.probe_now().await {
        eprintln!("Server unreachable; working offline.");
    }
    Ok(engine)
}

async fn run_engine_command(engine: &FleetSync, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List { kind, json } => for_kind!(kind, list_records(engine, json)),
        Commands::Create { kind, body } => for_kind!(kind, create_record(engine, &body)),
        Commands::Update {
            kind,
            local_id,
            body,
        } => for_kind!(kind, update_record(engine, local_id, &body)),
        Commands::Delete { kind, local_id } => for_kind!(kind, delete_record(engine, local_id)),
        Commands::Stats { kind } => for_kind!(kind, print_stats(engine)),
        Commands::Sync { force } => {
            let report = if force {
                engine.state().force_sync_now().await?
            } else {
                engine.state().sync_now().await?
            };
            print_report(&report);
            Ok(())
        }
        Commands::RetryFailed => {
            let report = engine.state().retry_failed().await?;
            print_report(&report);
            Ok(())
        }
        Commands::ClearFailed { yes } => {
            let outcome = engine.state().clear_failed(yes).await?;
            println!(
                "Discarded {} queue items and {} unsent records.",
                outcome.items, outcome.records
            );
            Ok(())
        }
        Commands::Refresh { kind } => {
            match kind {
                Some(kind) => print_report(&engine.references().refresh(kind).await?),
                None => {
                    engine.references().refresh_all(&ReportPrinter).await?;
                }
            }
            Ok(())
        }
        Commands::Run => {
            engine.start().await?;
            eprintln!("Sync engine running. Press Ctrl-C to stop.");
            let mut rx = engine.state().subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = rx.borrow_and_update().clone();
                        log::info!(
                            "online={} syncing={} pending={} failed={}",
                            state.is_online,
                            state.is_syncing,
                            state.pending_count,
                            state.failed_count
                        );
                    }
                }
            }
            engine.shutdown();
            Ok(())
        }
        Commands::Status
        | Commands::Queue { .. }
        | Commands::Config { .. }
        | Commands::References { .. } => Ok(()),
    }
}

async fn list_records<T>(engine: &FleetSync, json: bool) -> anyhow::Result<()>
where
    T: TransactionalEntity,
{
    let records = engine.facade::<T>().list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No {} records.", T::KIND);
    }
    for record in &records {
        print_record_line(record);
    }
    Ok(())
}

fn print_record_line<T>(record: &TransactionalRecord<T>) {
    let reference = record.reference.as_deref().unwrap_or("-");
    let remote = record.remote_id.as_deref().unwrap_or("-");
    let state = if record.pending_sync { "pending" } else { "synced" };
    println!(
        "{:>6}  {:<22}  {:<12}  {:<8}  {}",
        record.local_id,
        reference,
        remote,
        state,
        record.created_at.format("%Y-%m-%d %H:%M")
    );
}

fn parse_body<T: TransactionalEntity>(body: &str) -> anyhow::Result<T> {
    serde_json::from_str(body).with_context(|| format!("invalid {} body", T::KIND))
}

async fn create_record<T>(engine: &FleetSync, body: &str) -> anyhow::Result<()>
where
    T: TransactionalEntity,
{
    let input = parse_body::<T>(body)?;
    let record = engine.facade::<T>().create(input).await?;
    if record.pending_sync {
        println!("Saved offline as {} (queued for sync).", describe(&record));
    } else {
        println!("Created {}.", describe(&record));
    }
    Ok(())
}

async fn update_record<T>(engine: &FleetSync, local_id: i64, body: &str) -> anyhow::Result<()>
where
    T: TransactionalEntity,
{
    let input = parse_body::<T>(body)?;
    let record = engine.facade::<T>().update(local_id, input).await?;
    println!("Updated {}.", describe(&record));
    Ok(())
}

async fn delete_record<T>(engine: &FleetSync, local_id: i64) -> anyhow::Result<()>
where
    T: TransactionalEntity,
{
    engine.facade::<T>().delete(local_id).await?;
    println!("Deleted {} {local_id}.", T::KIND);
    Ok(())
}

async fn print_stats<T>(engine: &FleetSync) -> anyhow::Result<()>
where
    T: TransactionalEntity,
{
    let stats = engine.facade::<T>().stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn describe<T>(record: &TransactionalRecord<T>) -> String {
    match &record.reference {
        Some(reference) => format!("#{} ({reference})", record.local_id),
        None => format!("#{}", record.local_id),
    }
}

fn print_report(report: &fleetsync::SyncReport) {
    match report.status {
        SyncStatus::Success => println!(
            "{}: {} synced{}",
            report.scope,
            report.items_synced,
            if report.items_skipped > 0 {
                format!(", {} held back", report.items_skipped)
            } else {
                String::new()
            }
        ),
        SyncStatus::Skipped => println!(
            "{}: skipped ({})",
            report.scope,
            report.error.as_deref().unwrap_or("nothing to do")
        ),
        SyncStatus::PartialFailure | SyncStatus::Failed => println!(
            "{}: {} synced, {} failed ({})",
            report.scope,
            report.items_synced,
            report.items_failed,
            report.error.as_deref().unwrap_or("see queue")
        ),
    }
}

struct KindStatus {
    kind: TransactionalKind,
    cached: u64,
    pending_records: u64,
    queue: KindQueueStats,
}

async fn print_status(db: &fleetsync::Database) -> anyhow::Result<()> {
    let (stats, kinds, meta) = db
        .read(|conn| {
            let stats = repository::queue_stats(conn)?;
            let mut kinds = Vec::new();
            for kind in TransactionalKind::ALL {
                let (cached, pending_records) = repository::count_records(conn, kind)?;
                kinds.push(KindStatus {
                    kind,
                    cached,
                    pending_records,
                    queue: stats.by_kind.get(&kind).copied().unwrap_or_default(),
                });
            }
            let meta = repository::list_meta(conn)?;
            Ok((stats, kinds, meta))
        })
        .await?;

    println!("Queue: {} pending, {} failed, {} parked", stats.pending, stats.failed, stats.parked);
    println!();
    println!("{:<16} {:>8} {:>8} {:>8} {:>8}", "kind", "cached", "unsent", "queued", "failed");
    for k in &kinds {
        println!(
            "{:<16} {:>8} {:>8} {:>8} {:>8}",
            k.kind.as_str(),
            k.cached,
            k.pending_records,
            k.queue.pending,
            k.queue.failed
        );
    }
    if !meta.is_empty() {
        println!();
        println!("Last sync:");
        for (key, value) in meta {
            println!("  {key:<24} {value}");
        }
    }
    Ok(())
}

async fn print_queue(db: &fleetsync::Database, json: bool) -> anyhow::Result<()> {
    let items = db.read(|conn| repository::list_queue(conn, true)).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for item in items {
        let error = item.last_error.as_deref().unwrap_or("");
        let parked = if item.parked { " parked" } else { "" };
        println!(
            "{:>5}  {:<14} {:>6}  {:<6} retries={}{parked}  {error}",
            item.id,
            item.entity_kind.as_str(),
            item.entity_local_id,
            item.action.as_str(),
            item.retry_count
        );
    }
    Ok(())
}

async fn handle_config(db: &fleetsync::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .read({
                    let key = key.clone();
                    move |conn| repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            EngineConfig::validate(&key, &value)?;
            db.write(&[fleetsync::storage::Table::AppConfig], move |conn| {
                repository::set_config(conn, &key, &value)
            })
            .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = db.read(|conn| repository::list_config(conn)).await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

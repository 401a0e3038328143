use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;

use compliance_cache::cache::{CacheManager, SyncOutcome, TableName};
use compliance_cache::config::Config;
use compliance_cache::connectivity::ConnectivityMonitor;
use compliance_cache::migration::{MigrationService, TARGET_VERSION};
use compliance_cache::{logging, open_cache};

#[derive(Parser, Debug)]
#[command(name = "compliance-cache")]
#[command(about = "Local-first cache for privacy-compliance records with remote sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/compliance-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User namespace to operate on
  #[arg(short, long)]
  user: Option<String>,

  /// Do not talk to the remote
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the cached value of a table
  Get { table: TableName },
  /// Store a JSON value for a table ("-" reads stdin)
  Set { table: TableName, value: String },
  /// Delete the cached value of a table
  Remove { table: TableName },
  /// Delete every cached table in the namespace and empty the sync queue
  Clear,
  /// Show sync queue and per-table metadata
  Status,
  /// Flush the sync queue now
  Sync,
  /// Move legacy keys into the cache
  Migrate,
  /// Show whether a migration is needed
  MigrationInfo,
  /// Delete legacy keys after a successful migration
  Cleanup {
    /// Confirm the deletion
    #[arg(long)]
    yes: bool,
  },
  /// Keep syncing in the background until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging)?;

  // Override user if specified on command line
  let user_id = args.user.or_else(|| config.user_id.clone());
  let cache = open_cache(&config)?;
  if args.offline {
    cache.set_online(false);
  }
  let user = user_id.as_deref();

  match args.command {
    Command::Get { table } => {
      let value = cache.get_value(table, user).await;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Set { table, value } => {
      let data = parse_value(&value)?;
      let outcome = cache.set(table, &data, user).await.outcome().await;
      report_outcome(table, outcome)?;
    }
    Command::Remove { table } => {
      let outcome = cache.remove(table, user).await.outcome().await;
      report_outcome(table, outcome)?;
    }
    Command::Clear => {
      let removed = cache.clear(user);
      println!("Removed {} keys", removed);
    }
    Command::Status => print_status(&cache, user),
    Command::Sync => {
      let result = cache.process_sync_queue().await;
      println!(
        "attempted {}, synced {}, requeued {}, dropped {}, deferred {}",
        result.attempted, result.succeeded, result.requeued, result.dropped, result.deferred
      );
    }
    Command::Migrate => {
      let service = MigrationService::new(cache.clone(), user_id.clone());
      let report = service.start_migration().await;
      println!("Migrated {} records", report.migrated);
      for error in &report.errors {
        eprintln!("  {}", error);
      }
      if !report.success {
        return Err(eyre!("Migration finished with {} errors", report.errors.len()));
      }
    }
    Command::MigrationInfo => {
      let service = MigrationService::new(cache.clone(), user_id.clone());
      let info = service.migration_info();
      println!("{}", serde_json::to_string_pretty(&info)?);
    }
    Command::Cleanup { yes } => {
      let service = MigrationService::new(cache.clone(), user_id.clone());
      if !service.check_migration_status().is_current(TARGET_VERSION) {
        return Err(eyre!("Migration has not completed; refusing to delete legacy data"));
      }
      if !yes {
        return Err(eyre!("Pass --yes to delete legacy data"));
      }
      let removed = service.cleanup_old_data()?;
      println!("Removed {} legacy keys", removed);
    }
    Command::Watch => {
      let monitor = ConnectivityMonitor::new(cache.clone())
        .with_probe(config.cache.probe_offline)
        .spawn();
      println!("Watching, press Ctrl-C to stop");
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
      monitor.shutdown().await;
    }
  }

  Ok(())
}

fn parse_value(raw: &str) -> Result<Value> {
  let raw = if raw == "-" {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .map_err(|e| eyre!("Failed to read stdin: {}", e))?;
    buf
  } else {
    raw.to_string()
  };
  serde_json::from_str(&raw).map_err(|e| eyre!("Invalid JSON value: {}", e))
}

fn report_outcome(table: TableName, outcome: SyncOutcome) -> Result<()> {
  match outcome {
    SyncOutcome::Pushed => println!("{}: saved and synced", table),
    SyncOutcome::Deferred => println!("{}: saved, sync queued", table),
    SyncOutcome::Failed(e) => println!("{}: saved, sync failed ({}), will retry", table, e),
    SyncOutcome::Dropped => return Err(eyre!("{}: local write failed, see log", table)),
  }
  Ok(())
}

fn print_status(cache: &CacheManager, user: Option<&str>) {
  let status = cache.sync_status();
  println!(
    "{} | pending {} | errors {} | dropped {}",
    if status.offline { "offline" } else { "online" },
    status.pending,
    status.errors,
    status.dropped
  );

  match cache.storage_usage() {
    Ok(usage) => println!(
      "storage {} / {} bytes",
      usage.used_bytes, usage.capacity_bytes
    ),
    Err(e) => println!("storage usage unavailable: {}", e),
  }

  for table in TableName::ALL {
    if let Some(meta) = cache.metadata(table, user) {
      println!(
        "  {:<20} v{:<4} {:?} modified {}",
        table.as_str(),
        meta.version,
        meta.sync_status,
        meta.last_modified.format("%Y-%m-%d %H:%M:%S")
      );
    }
  }

  let items = cache.queue_snapshot();
  if !items.is_empty() {
    println!("queue:");
    for item in items {
      println!(
        "  {:<16} {:?} {} retries {}",
        item.id, item.operation, item.key, item.retry_count
      );
    }
  }
}

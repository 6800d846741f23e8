use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use troopsync::cache::{CacheManager, GroupSelector};
use troopsync::config::Config;
use troopsync::queue::OfflineQueue;
use troopsync::store::{SqliteStore, StoreHandle};
use troopsync::sync::{HttpTransport, MemoryPointsView, SyncCoordinator};

#[derive(Parser, Debug)]
#[command(name = "troopsync")]
#[command(about = "Inspect and drive the offline sync store of a troop client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/troopsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Store file, overriding storage.path
  #[arg(short, long)]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue and cache counts
  Status,
  /// List queued offline mutations, oldest first
  Queue,
  /// Replay the offline queue against the server
  Drain,
  /// Drop a named cache group, or every key with a prefix ending in '*'
  Invalidate { group: String },
  /// Remove expired cache entries
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = troopsync::logging::init(&config.logging)?;

  // Nothing works without durable storage, so no degraded mode here
  let store: StoreHandle = match args.store.as_ref().or(config.storage.path.as_ref()) {
    Some(path) => Arc::new(SqliteStore::open_at(path)?),
    None => Arc::new(SqliteStore::open()?),
  };

  let transport = HttpTransport::from_config(&config.server)?;
  let coordinator = SyncCoordinator::new(
    config.sync.clone(),
    CacheManager::new(store.clone(), config.cache.groups()),
    OfflineQueue::new(store),
    Arc::new(transport),
    Arc::new(MemoryPointsView::new()),
  );

  match args.command {
    Command::Status => print_status(&config, &coordinator)?,
    Command::Queue => {
      let items = coordinator.queue().drain_all();
      if items.is_empty() {
        println!("offline queue is empty");
      }
      for item in items {
        println!(
          "{:>6}  {}  {:<16} {}",
          item.id,
          item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          item.action,
          item.payload
        );
      }
    }
    Command::Drain => {
      let replayed = coordinator.drain_offline().await?;
      println!("replayed {} queued mutation(s)", replayed);
    }
    Command::Invalidate { group } => {
      let cache = coordinator.cache();
      let selector = match group.strip_suffix('*') {
        Some(prefix) => GroupSelector::Prefix(prefix.to_string()),
        None => {
          if cache.groups().members(&group).is_none() {
            let known: Vec<&str> = cache.groups().names().collect();
            return Err(eyre!(
              "Unknown cache group '{}' (known: {})",
              group,
              known.join(", ")
            ));
          }
          GroupSelector::named(group.as_str())
        }
      };
      let removed = cache.invalidate_group(&selector)?;
      println!("removed {} cache entries", removed);
    }
    Command::Purge => {
      let removed = coordinator.cache().purge_expired()?;
      println!("purged {} expired cache entries", removed);
    }
  }

  Ok(())
}

fn print_status(config: &Config, coordinator: &SyncCoordinator) -> Result<()> {
  let status = coordinator.status();
  let cache = coordinator.cache();
  let keys = cache.keys()?;
  let fresh = keys
    .iter()
    .filter(|key| cache.get::<Value>(key).is_some())
    .count();

  println!("server:  {}", config.server.url);
  println!("queued:  {}", status.queued);
  println!("cached:  {} ({} fresh)", keys.len(), fresh);
  for name in cache.groups().names() {
    let count = keys
      .iter()
      .filter(|key| cache.groups().contains(name, key))
      .count();
    println!("  {:<12} {}", name, count);
  }
  Ok(())
}

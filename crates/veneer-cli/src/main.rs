//! `veneer`: replay harness for the Veneer overlay engine.
//!
//! Reads `veneer.toml` (or the path given with `--config`), opens the
//! reconciliation queue (SQLite when a path is configured, in-memory
//! otherwise), runs the drain and GC timers, and executes newline-delimited
//! JSON commands from stdin until end of input or Ctrl-C.
//!
//! ```text
//! veneer --queue ~/.local/state/veneer/queue.sqlite < script.ndjson
//! ```

mod cache;
mod replay;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use veneer_core::{
  EngineBuilder,
  cache::TracingNotifier,
  config::EngineConfig,
  queue::{MemoryQueueStore, QueueStore},
};
use veneer_store_sqlite::SqliteQueueStore;

use crate::cache::{HarnessCache, entity_targets};

#[derive(Parser)]
#[command(author, version, about = "Veneer overlay replay harness")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "veneer.toml")]
  config: PathBuf,

  /// SQLite file for the reconciliation queue; overrides `queue_path`.
  #[arg(long, value_name = "FILE")]
  queue: Option<PathBuf>,

  /// Actor whose own changes are announced as successes.
  #[arg(long)]
  actor: Option<String>,
}

/// Shape of the configuration file.
#[derive(Deserialize, Default)]
struct HarnessConfig {
  #[serde(default)]
  queue_path:    Option<PathBuf>,
  #[serde(default)]
  current_actor: Option<String>,
  #[serde(default)]
  engine:        EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Logs go to stderr; stdout carries command output.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("VENEER")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?;

  let mut harness_cfg: HarnessConfig = settings
    .try_deserialize()
    .context("failed to deserialise HarnessConfig")?;

  // CLI flags override the file.
  if cli.queue.is_some() {
    harness_cfg.queue_path = cli.queue;
  }
  if cli.actor.is_some() {
    harness_cfg.current_actor = cli.actor;
  }

  let queue_path = harness_cfg.queue_path.as_deref().map(expand_tilde);
  match queue_path {
    Some(path) => {
      let store = SqliteQueueStore::open(&path)
        .await
        .with_context(|| format!("failed to open queue at {path:?}"))?;
      tracing::info!(path = %path.display(), "using durable reconciliation queue");
      serve(harness_cfg, store).await
    }
    None => {
      tracing::info!("using in-memory reconciliation queue");
      serve(harness_cfg, MemoryQueueStore::new()).await
    }
  }
}

async fn serve<S: QueueStore>(harness_cfg: HarnessConfig, store: S) -> anyhow::Result<()> {
  let mut builder = EngineBuilder::new(harness_cfg.engine).notifier(Arc::new(TracingNotifier));
  if let Some(actor) = harness_cfg.current_actor {
    builder = builder.current_actor(actor);
  }
  let engine = builder
    .build(HarnessCache::default(), store, Box::new(entity_targets))
    .context("invalid engine configuration")?;

  let lines = BufReader::new(tokio::io::stdin()).lines();

  tokio::select! {
    () = engine.run(std::future::pending()) => Ok(()),
    res = replay::replay(&engine, lines) => {
      tracing::info!(invalidations = engine.cache().invalidations(), "input exhausted");
      res
    }
    res = tokio::signal::ctrl_c() => {
      res.context("failed to listen for ctrl-c")?;
      tracing::info!("interrupted");
      Ok(())
    }
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

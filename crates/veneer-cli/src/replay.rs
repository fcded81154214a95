//! Newline-delimited JSON commands driving the engine.
//!
//! One command per line, tagged by `op`. Blank lines and lines starting with
//! `#` are ignored; malformed lines are logged and skipped.
//!
//! ```text
//! {"op":"truth","target":["booking","b42"],"record":{"status":"none"}}
//! {"op":"set","category":"booking","key":"b42","fields":{"status":"pending"},
//!  "reconcile":{"expected":{"field":"status","value":"pending"}}}
//! {"op":"resolve","category":"booking","key":"b42"}
//! {"op":"events","events":[{"kind":"updated","entity":{"category":"booking","key":"b42"}}]}
//! {"op":"drain"}
//! ```

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, Lines};
use tracing::warn;
use veneer_core::{
  Engine,
  config::millis,
  entity::{Category, EntityRef, InvalidationTarget, Record},
  listener::ChangeEvent,
  overlay::OverlayWrite,
  queue::QueueStore,
  reconcile::{Expected, NewReconciliation},
};

use crate::cache::{HarnessCache, entity_lookup};

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
  /// Write an overlay entry, with an optional safety-net reconciliation.
  Set {
    category:  Category,
    key:       String,
    fields:    Record,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    pending:   Option<bool>,
    #[serde(default)]
    reconcile: Option<Reconcile>,
  },
  Complete {
    category: Category,
    key:      String,
  },
  Clear {
    category: Category,
    key:      String,
  },
  Enqueue {
    id:       String,
    category: Category,
    targets:  Vec<InvalidationTarget>,
    #[serde(default)]
    expected: Option<Expected>,
  },
  Remove {
    id: String,
  },
  Suppress {
    active:      bool,
    #[serde(default)]
    duration_ms: Option<u64>,
  },
  Events {
    events: Vec<ChangeEvent>,
  },
  /// Replace the harness's authoritative snapshot for `target`.
  Truth {
    target: InvalidationTarget,
    record: Record,
  },
  Resolve {
    category: Category,
    key:      String,
  },
  Drain,
  Gc,
}

/// The reconciliation half of a `set`. Targets default to the entity's own
/// lookup; an expected assertion defaults to that lookup as well.
#[derive(Debug, Default, Deserialize)]
pub struct Reconcile {
  #[serde(default)]
  targets:  Vec<InvalidationTarget>,
  #[serde(default)]
  expected: Option<ExpectedField>,
}

#[derive(Debug, Deserialize)]
pub struct ExpectedField {
  #[serde(default)]
  lookup: Option<InvalidationTarget>,
  field:  String,
  value:  Value,
}

// ─── Loop ────────────────────────────────────────────────────────────────────

/// Execute commands from `lines` until end of input.
pub async fn replay<S, R>(engine: &Engine<HarnessCache, S>, mut lines: Lines<R>) -> anyhow::Result<()>
where
  S: QueueStore,
  R: AsyncBufRead + Unpin,
{
  while let Some(line) = lines.next_line().await.context("failed to read command")? {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let command: Command = match serde_json::from_str(line) {
      Ok(command) => command,
      Err(e) => {
        warn!(error = %e, "skipping malformed command");
        continue;
      }
    };
    if let Some(output) = execute(engine, command).await? {
      println!("{output}");
    }
  }
  Ok(())
}

/// Run one command, returning the JSON line to print, if any.
pub async fn execute<S: QueueStore>(
  engine: &Engine<HarnessCache, S>,
  command: Command,
) -> anyhow::Result<Option<Value>> {
  let output = match command {
    Command::Set { category, key, fields, operation, pending, reconcile } => {
      let write = OverlayWrite { fields, operation, pending };
      let entity = EntityRef::new(category.clone(), key.as_str());
      let reconciliation = reconcile.map(|r| reconciliation_for(&entity, r));
      engine.speculate(&category, &key, write, reconciliation).await?;
      None
    }
    Command::Complete { category, key } => {
      let found = engine.complete_overlay(&category, &key);
      Some(json!({ "completed": found }))
    }
    Command::Clear { category, key } => {
      engine.clear_overlay(&category, &key).await?;
      None
    }
    Command::Enqueue { id, category, targets, expected } => {
      let queued = engine
        .enqueue_reconciliation(NewReconciliation {
          id,
          category,
          invalidation_targets: targets,
          expected,
        })
        .await?;
      Some(json!({ "queued": queued }))
    }
    Command::Remove { id } => {
      let removed = engine.remove_reconciliation(&id).await?;
      Some(json!({ "removed": removed }))
    }
    Command::Suppress { active, duration_ms } => {
      engine.set_suppression(active, duration_ms.map(millis));
      Some(json!({ "suppressed": engine.is_suppressed() }))
    }
    Command::Events { events } => {
      let r = engine.handle_events(events).await;
      Some(json!({
        "processed": r.processed,
        "invalidated": r.invalidated,
        "duplicates": r.duplicates,
        "suppressed": r.suppressed,
      }))
    }
    Command::Truth { target, record } => {
      engine.cache().put(&target, record);
      None
    }
    Command::Resolve { category, key } => {
      let entity = EntityRef::new(category.clone(), key.as_str());
      let authoritative = engine.cache().get(&entity_lookup(&entity)).unwrap_or_default();
      let overlay = engine.overlay(&category, &key);
      let record = engine.resolve(&category, &key, authoritative);
      Some(json!({
        "entity": entity.to_string(),
        "record": record,
        "pending": overlay.as_ref().map(|o| o.is_pending),
      }))
    }
    Command::Drain => {
      let r = engine.drain().await?;
      Some(json!({
        "resolved": r.resolved,
        "invalidated": r.invalidated,
        "rescheduled": r.rescheduled,
        "exhausted": r.exhausted,
        "skipped": r.skipped,
      }))
    }
    Command::Gc => {
      let r = engine.collect_garbage().await?;
      Some(json!({
        "pending_expired": r.pending_expired,
        "settled_expired": r.settled_expired,
        "queue_expired": r.queue_expired,
      }))
    }
  };
  Ok(output)
}

fn reconciliation_for(entity: &EntityRef, reconcile: Reconcile) -> NewReconciliation {
  let lookup = entity_lookup(entity);
  let targets = if reconcile.targets.is_empty() {
    vec![lookup.clone()]
  } else {
    reconcile.targets
  };
  NewReconciliation {
    invalidation_targets: targets,
    expected: reconcile.expected.map(|e| Expected {
      lookup: e.lookup.unwrap_or(lookup),
      field:  e.field,
      value:  e.value,
    }),
    ..NewReconciliation::for_entity(entity.category.clone(), &entity.key)
  }
}

//! The reconciliation queue: storage abstraction and the drain pass.
//!
//! Entries live in a [`QueueStore`] so they survive restarts. The queue never
//! holds its own copy; every drain reads the store afresh and writes back with
//! compare-and-set semantics, so an entry cleared or replaced while a drain is
//! awaiting the cache is not resurrected.

use std::{
  future::Future,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::{
  Error, Result,
  cache::AuthoritativeCache,
  clock::Clock,
  entity::InvalidateOptions,
  reconcile::{BackoffSchedule, NewReconciliation, NextAttempt, ReconciliationEntry},
  sync::lock,
};

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a durable reconciliation-queue backend.
///
/// Entries are keyed by id. `reschedule` and `retire` only act on the entry
/// generation identified by `(id, created_at)`; a newer entry enqueued under
/// the same id is left alone.
pub trait QueueStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// All entries, oldest insertion first.
  fn load_all(
    &self,
  ) -> impl Future<Output = Result<Vec<ReconciliationEntry>, Self::Error>> + Send + '_;

  /// Insert `entry`, replacing any entry with the same id. The replacement
  /// moves to the end of the insertion order.
  fn upsert(
    &self,
    entry: ReconciliationEntry,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Delete the entry with `id`. Returns `false` if there was none.
  fn remove<'a>(
    &'a self,
    id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Record a failed attempt on the given generation of an entry.
  fn reschedule<'a>(
    &'a self,
    id: &'a str,
    created_at: DateTime<Utc>,
    attempt_index: u32,
    next_attempt_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Delete the given generation of an entry.
  fn retire<'a>(
    &'a self,
    id: &'a str,
    created_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  fn count(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}

// ─── In-memory backend ───────────────────────────────────────────────────────

/// A non-durable [`QueueStore`], useful for testing and for callers that do
/// not need the queue to outlive the process.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
  entries: Mutex<Vec<ReconciliationEntry>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self { Self::default() }
}

impl QueueStore for MemoryQueueStore {
  type Error = std::convert::Infallible;

  async fn load_all(&self) -> Result<Vec<ReconciliationEntry>, Self::Error> {
    Ok(lock(&self.entries).clone())
  }

  async fn upsert(&self, entry: ReconciliationEntry) -> Result<(), Self::Error> {
    let mut entries = lock(&self.entries);
    entries.retain(|e| e.id != entry.id);
    entries.push(entry);
    Ok(())
  }

  async fn remove(&self, id: &str) -> Result<bool, Self::Error> {
    let mut entries = lock(&self.entries);
    let before = entries.len();
    entries.retain(|e| e.id != id);
    Ok(entries.len() != before)
  }

  async fn reschedule(
    &self,
    id: &str,
    created_at: DateTime<Utc>,
    attempt_index: u32,
    next_attempt_at: DateTime<Utc>,
  ) -> Result<bool, Self::Error> {
    let mut entries = lock(&self.entries);
    match entries
      .iter_mut()
      .find(|e| e.id == id && e.created_at == created_at)
    {
      Some(entry) => {
        entry.attempt_index = attempt_index;
        entry.next_attempt_at = next_attempt_at;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn retire(&self, id: &str, created_at: DateTime<Utc>) -> Result<bool, Self::Error> {
    let mut entries = lock(&self.entries);
    let before = entries.len();
    entries.retain(|e| !(e.id == id && e.created_at == created_at));
    Ok(entries.len() != before)
  }

  async fn count(&self) -> Result<usize, Self::Error> {
    Ok(lock(&self.entries).len())
  }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// The outcome of one [`ReconciliationQueue::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Entries dropped because truth already matched the prediction.
  pub resolved:    usize,
  /// Invalidation calls issued.
  pub invalidated: usize,
  /// Entries kept for another attempt.
  pub rescheduled: usize,
  /// Entries dropped because their schedule ran out.
  pub exhausted:   usize,
  /// Entries not yet due.
  pub skipped:     usize,
}

// ─── Queue ───────────────────────────────────────────────────────────────────

pub struct ReconciliationQueue<S> {
  store:    S,
  schedule: BackoffSchedule,
  clock:    Arc<dyn Clock>,
}

impl<S: QueueStore> ReconciliationQueue<S> {
  pub fn new(store: S, schedule: BackoffSchedule, clock: Arc<dyn Clock>) -> Self {
    Self { store, schedule, clock }
  }

  /// Insert or replace (by id) an entry, due on the next drain.
  ///
  /// Returns `Ok(false)` without enqueuing when the entry has no id or no
  /// invalidation targets.
  pub async fn enqueue(&self, new: NewReconciliation) -> Result<bool> {
    if !new.is_valid() {
      debug!(id = %new.id, "skipping invalid reconciliation entry");
      return Ok(false);
    }
    let entry = new.into_entry(self.clock.now());
    debug!(id = %entry.id, category = %entry.category, "reconciliation enqueued");
    self.store.upsert(entry).await.map_err(Error::store)?;
    Ok(true)
  }

  /// Delete by id; a missing entry is not an error.
  pub async fn remove(&self, id: &str) -> Result<bool> {
    self.store.remove(id).await.map_err(Error::store)
  }

  pub async fn entries(&self) -> Result<Vec<ReconciliationEntry>> {
    self.store.load_all().await.map_err(Error::store)
  }

  pub async fn len(&self) -> Result<usize> {
    self.store.count().await.map_err(Error::store)
  }

  /// Make one attempt on every due entry.
  ///
  /// Cache failures never abort the pass: a failed snapshot counts as a
  /// mismatch and a failed invalidation is logged and skipped.
  pub async fn drain<C: AuthoritativeCache>(&self, cache: &C) -> Result<DrainReport> {
    let now = self.clock.now();
    let entries = self.entries().await?;
    let mut report = DrainReport::default();

    for entry in entries {
      if !entry.is_due(now) {
        report.skipped += 1;
        continue;
      }

      if already_converged(&entry, cache).await {
        debug!(id = %entry.id, "truth already matches; reconciliation resolved");
        self.retire(&entry).await?;
        report.resolved += 1;
        continue;
      }

      for target in &entry.invalidation_targets {
        match cache.invalidate(target, InvalidateOptions::EXACT).await {
          Ok(()) => report.invalidated += 1,
          Err(e) => warn!(id = %entry.id, %target, error = %e, "invalidation failed"),
        }
      }

      match self.schedule.after_attempt(&entry) {
        NextAttempt::Retry { attempt_index, at } => {
          debug!(id = %entry.id, attempt = attempt_index, next = %at, "reconciliation rescheduled");
          self
            .store
            .reschedule(&entry.id, entry.created_at, attempt_index, at)
            .await
            .map_err(Error::store)?;
          report.rescheduled += 1;
        }
        NextAttempt::GiveUp => {
          info!(
            id = %entry.id,
            attempts = self.schedule.attempts(),
            "reconciliation retries exhausted"
          );
          self.retire(&entry).await?;
          report.exhausted += 1;
        }
      }
    }

    Ok(report)
  }

  /// Retire every entry older than `max_age`, returning how many went.
  pub async fn expire_older_than(&self, max_age: TimeDelta) -> Result<usize> {
    let now = self.clock.now();
    let mut expired = 0;
    for entry in self.entries().await? {
      if entry.age(now) > max_age && self.retire(&entry).await? {
        info!(id = %entry.id, "reconciliation entry expired");
        expired += 1;
      }
    }
    Ok(expired)
  }

  async fn retire(&self, entry: &ReconciliationEntry) -> Result<bool> {
    self
      .store
      .retire(&entry.id, entry.created_at)
      .await
      .map_err(Error::store)
  }
}

/// Whether the authoritative snapshot already carries the expected value.
async fn already_converged<C: AuthoritativeCache>(entry: &ReconciliationEntry, cache: &C) -> bool {
  let Some(expected) = &entry.expected else {
    return false;
  };
  match cache.snapshot(&expected.lookup).await {
    Ok(Some(snapshot)) => expected.is_met_by(&snapshot),
    Ok(None) => false,
    Err(e) => {
      warn!(id = %entry.id, lookup = %expected.lookup, error = %e, "snapshot lookup failed");
      false
    }
  }
}

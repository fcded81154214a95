//! The optimistic overlay store and the effective-state resolver.
//!
//! An overlay entry is one caller's speculative claim about one entity. At
//! most one entry exists per `(category, key)`; writes replace the entry
//! wholesale, and merging only happens when resolving against an
//! authoritative record.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  clock::Clock,
  entity::{Category, Record},
  sync::lock,
};

// ─── Entry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayEntry {
  pub category:   Category,
  pub key:        String,
  /// Speculative attribute values, merged over the authoritative record.
  pub fields:     Record,
  /// `true` while the operation is in flight; `false` once confirmed but kept
  /// for display continuity.
  pub is_pending: bool,
  /// Free-form label for the action (e.g. "listing"). Display and logs only.
  pub operation:  Option<String>,
  /// Last write time.
  pub timestamp:  DateTime<Utc>,
}

impl OverlayEntry {
  pub fn age(&self, now: DateTime<Utc>) -> TimeDelta { now - self.timestamp }
}

// ─── Write ───────────────────────────────────────────────────────────────────

/// Input to [`OverlayStore::set`]. The timestamp is always set by the store.
#[derive(Debug, Clone, Default)]
pub struct OverlayWrite {
  pub fields:    Record,
  pub operation: Option<String>,
  /// Overrides the default of `true`.
  pub pending:   Option<bool>,
}

impl OverlayWrite {
  pub fn new(fields: Record) -> Self {
    Self { fields, ..Self::default() }
  }

  pub fn operation(mut self, operation: impl Into<String>) -> Self {
    self.operation = Some(operation.into());
    self
  }

  /// Write the entry as already confirmed.
  pub fn settled(mut self) -> Self {
    self.pending = Some(false);
    self
  }

  pub fn is_pending(&self) -> bool { self.pending.unwrap_or(true) }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Merge `overlay` over `authoritative`: every overlay field wins, every other
/// authoritative field is kept.
pub fn resolve(mut authoritative: Record, overlay: Option<&OverlayEntry>) -> Record {
  if let Some(entry) = overlay {
    for (field, value) in &entry.fields {
      authoritative.insert(field.clone(), value.clone());
    }
  }
  authoritative
}

// ─── Store ───────────────────────────────────────────────────────────────────

type Slot = (Category, String);

/// Process-wide overlay state. Only the operations below touch the map.
pub struct OverlayStore {
  entries: Mutex<HashMap<Slot, OverlayEntry>>,
  clock:   Arc<dyn Clock>,
}

impl OverlayStore {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self { entries: Mutex::new(HashMap::new()), clock }
  }

  /// Replace the entry for `(category, key)`, stamping the current time.
  pub fn set(&self, category: &Category, key: &str, write: OverlayWrite) {
    let entry = OverlayEntry {
      category:   category.clone(),
      key:        key.to_owned(),
      is_pending: write.is_pending(),
      fields:     write.fields,
      operation:  write.operation,
      timestamp:  self.clock.now(),
    };
    tracing::debug!(
      %category,
      key,
      pending = entry.is_pending,
      operation = entry.operation.as_deref(),
      "overlay set"
    );
    lock(&self.entries).insert(slot(category, key), entry);
  }

  /// Mark the entry settled and refresh its timestamp. Returns `false` if
  /// there was no entry.
  pub fn complete(&self, category: &Category, key: &str) -> bool {
    let now = self.clock.now();
    let mut entries = lock(&self.entries);
    match entries.get_mut(&slot(category, key)) {
      Some(entry) => {
        entry.is_pending = false;
        entry.timestamp = now;
        tracing::debug!(%category, key, "overlay completed");
        true
      }
      None => false,
    }
  }

  /// Delete the entry, returning it if there was one.
  pub fn remove(&self, category: &Category, key: &str) -> Option<OverlayEntry> {
    lock(&self.entries).remove(&slot(category, key))
  }

  pub fn get(&self, category: &Category, key: &str) -> Option<OverlayEntry> {
    lock(&self.entries).get(&slot(category, key)).cloned()
  }

  /// The effective record for `(category, key)`.
  pub fn resolve(&self, category: &Category, key: &str, authoritative: Record) -> Record {
    let entries = lock(&self.entries);
    resolve(authoritative, entries.get(&slot(category, key)))
  }

  pub fn len(&self) -> usize { lock(&self.entries).len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Remove every entry for which `expired` returns `true`.
  pub(crate) fn evict(&self, mut expired: impl FnMut(&OverlayEntry) -> bool) -> Vec<OverlayEntry> {
    let mut entries = lock(&self.entries);
    let doomed: Vec<Slot> = entries
      .iter()
      .filter(|(_, entry)| expired(entry))
      .map(|(slot, _)| slot.clone())
      .collect();
    doomed
      .into_iter()
      .filter_map(|slot| entries.remove(&slot))
      .collect()
  }

  pub(crate) fn now(&self) -> DateTime<Utc> { self.clock.now() }
}

fn slot(category: &Category, key: &str) -> Slot {
  (category.clone(), key.to_owned())
}

//! Reconciliation entries and the retry schedule they follow.
//!
//! A reconciliation entry is a promise to double-check an overlay entry
//! against truth: on each attempt it either finds the authoritative cache
//! already agreeing, or invalidates its targets so the next read re-fetches.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  Error, Result,
  clock::saturating_add,
  entity::{Category, InvalidationTarget, Record},
};

/// The conventional reconciliation id for an entity: `"{category}:{key}"`.
///
/// Clearing an overlay entry removes the reconciliation entry with this id.
pub fn reconciliation_id(category: &Category, key: &str) -> String {
  format!("{category}:{key}")
}

// ─── Expected ────────────────────────────────────────────────────────────────

/// A prediction about one field of one authoritative lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expected {
  pub lookup: InvalidationTarget,
  pub field:  String,
  pub value:  Value,
}

impl Expected {
  pub fn new(lookup: InvalidationTarget, field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self { lookup, field: field.into(), value: value.into() }
  }

  /// Whether `snapshot` already carries the predicted value.
  pub fn is_met_by(&self, snapshot: &Record) -> bool {
    snapshot.get(&self.field) == Some(&self.value)
  }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
  pub id:                   String,
  /// Mirrors the overlay category; grouping and logs only.
  pub category:             Category,
  /// Lookups to invalidate on each attempt, in order.
  pub invalidation_targets: Vec<InvalidationTarget>,
  pub expected:             Option<Expected>,
  /// Number of attempts already made.
  pub attempt_index:        u32,
  pub created_at:           DateTime<Utc>,
  pub next_attempt_at:      DateTime<Utc>,
}

impl ReconciliationEntry {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool { now >= self.next_attempt_at }

  pub fn age(&self, now: DateTime<Utc>) -> TimeDelta { now - self.created_at }
}

/// Input to [`crate::queue::ReconciliationQueue::enqueue`].
/// The attempt bookkeeping is always set by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReconciliation {
  pub id:                   String,
  pub category:             Category,
  pub invalidation_targets: Vec<InvalidationTarget>,
  pub expected:             Option<Expected>,
}

impl NewReconciliation {
  /// An entry for `(category, key)` using the conventional id.
  pub fn for_entity(category: Category, key: &str) -> Self {
    Self {
      id: reconciliation_id(&category, key),
      category,
      invalidation_targets: Vec::new(),
      expected: None,
    }
  }

  pub fn target(mut self, target: InvalidationTarget) -> Self {
    self.invalidation_targets.push(target);
    self
  }

  pub fn expect(mut self, expected: Expected) -> Self {
    self.expected = Some(expected);
    self
  }

  /// Entries without an id or without targets are never enqueued.
  pub fn is_valid(&self) -> bool {
    !self.id.trim().is_empty() && !self.invalidation_targets.is_empty()
  }

  pub(crate) fn into_entry(self, now: DateTime<Utc>) -> ReconciliationEntry {
    ReconciliationEntry {
      id:                   self.id,
      category:             self.category,
      invalidation_targets: self.invalidation_targets,
      expected:             self.expected,
      attempt_index:        0,
      created_at:           now,
      next_attempt_at:      now,
    }
  }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// What happens to an entry after an attempt that did not resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
  Retry {
    attempt_index: u32,
    at:            DateTime<Utc>,
  },
  /// The schedule is used up; the overlay's own TTL is the final backstop.
  GiveUp,
}

/// Offsets from an entry's creation at which successive attempts fall due.
///
/// Anchoring to `created_at` rather than to the previous attempt keeps the
/// total time from creation fixed, however many drains were skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule(Vec<TimeDelta>);

impl BackoffSchedule {
  pub fn new(offsets: Vec<TimeDelta>) -> Result<Self> {
    if offsets.is_empty() {
      return Err(Error::Config("backoff schedule must not be empty".into()));
    }
    if offsets.windows(2).any(|w| w[1] < w[0]) {
      return Err(Error::Config("backoff schedule must be non-decreasing".into()));
    }
    Ok(Self(offsets))
  }

  /// The number of attempts an entry gets.
  pub fn attempts(&self) -> usize { self.0.len() }

  pub fn after_attempt(&self, entry: &ReconciliationEntry) -> NextAttempt {
    let next = entry.attempt_index.saturating_add(1);
    match self.0.get(next as usize) {
      Some(offset) => NextAttempt::Retry {
        attempt_index: next,
        at:            saturating_add(entry.created_at, *offset),
      },
      None => NextAttempt::GiveUp,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;
  use crate::testing::record;

  fn entry(attempt_index: u32) -> ReconciliationEntry {
    let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    ReconciliationEntry {
      id: "booking:b42".into(),
      category: Category::new("booking"),
      invalidation_targets: vec![InvalidationTarget::new(json!(["booking", "b42"]))],
      expected: None,
      attempt_index,
      created_at: created,
      next_attempt_at: created,
    }
  }

  fn schedule(secs: &[i64]) -> BackoffSchedule {
    BackoffSchedule::new(secs.iter().copied().map(TimeDelta::seconds).collect()).unwrap()
  }

  #[test]
  fn retries_are_anchored_to_creation() {
    let s = schedule(&[0, 10, 30]);
    let e = entry(0);
    assert_eq!(
      s.after_attempt(&e),
      NextAttempt::Retry { attempt_index: 1, at: e.created_at + TimeDelta::seconds(10) }
    );
    assert_eq!(
      s.after_attempt(&entry(1)),
      NextAttempt::Retry { attempt_index: 2, at: e.created_at + TimeDelta::seconds(30) }
    );
  }

  #[test]
  fn gives_up_after_last_offset() {
    let s = schedule(&[0, 10, 30]);
    assert_eq!(s.after_attempt(&entry(2)), NextAttempt::GiveUp);
    assert_eq!(s.after_attempt(&entry(u32::MAX)), NextAttempt::GiveUp);
  }

  #[test]
  fn huge_offset_saturates_instead_of_overflowing() {
    let s = BackoffSchedule::new(vec![TimeDelta::zero(), TimeDelta::MAX]).unwrap();
    assert_eq!(
      s.after_attempt(&entry(0)),
      NextAttempt::Retry { attempt_index: 1, at: crate::clock::end_of_time() }
    );
  }

  #[test]
  fn single_offset_schedule_allows_one_attempt() {
    assert_eq!(schedule(&[0]).after_attempt(&entry(0)), NextAttempt::GiveUp);
  }

  #[test]
  fn rejects_decreasing_offsets() {
    let offsets = vec![TimeDelta::seconds(10), TimeDelta::seconds(5)];
    assert!(BackoffSchedule::new(offsets).is_err());
    assert!(BackoffSchedule::new(vec![]).is_err());
  }

  #[test]
  fn derived_id_joins_category_and_key() {
    let n = NewReconciliation::for_entity(Category::new("listing"), "lab-7");
    assert_eq!(n.id, "listing:lab-7");
    assert!(!n.is_valid(), "no targets yet");
    let n = n.target(InvalidationTarget::new(json!(["lab", 7])));
    assert!(n.is_valid());
  }

  #[test]
  fn expected_compares_a_single_field() {
    let exp = Expected::new(InvalidationTarget::new(json!(["lab", 7])), "isListed", true);
    assert!(exp.is_met_by(&record(json!({ "isListed": true, "price": 1 }))));
    assert!(!exp.is_met_by(&record(json!({ "isListed": false }))));
    assert!(!exp.is_met_by(&record(json!({ "price": 1 }))));
  }
}

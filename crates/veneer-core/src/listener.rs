//! Consumes change notifications and invalidates the authoritative cache.
//!
//! The listener never touches the overlay: only the overlay's owner knows
//! whether a given confirmation is for its own speculative action.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
  cache::{AuthoritativeCache, Notifier, Severity},
  clock::Clock,
  entity::{EntityRef, InvalidateOptions, InvalidationTarget},
  suppression::Suppression,
  sync::lock,
};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  Added,
  Removed,
  Updated,
  /// Anything the transport reports that is not one of the above.
  Other(String),
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Added => f.write_str("added"),
      Self::Removed => f.write_str("removed"),
      Self::Updated => f.write_str("updated"),
      Self::Other(kind) => f.write_str(kind),
    }
  }
}

/// One asynchronous change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub kind:   EventKind,
  pub entity: EntityRef,
  /// Who caused the change, when the transport says.
  #[serde(default)]
  pub actor:  Option<String>,
}

impl ChangeEvent {
  pub fn new(kind: EventKind, entity: EntityRef) -> Self {
    Self { kind, entity, actor: None }
  }

  pub fn by(mut self, actor: impl Into<String>) -> Self {
    self.actor = Some(actor.into());
    self
  }

  fn dedup_key(&self) -> DedupKey { (self.kind.clone(), self.entity.clone()) }
}

type DedupKey = (EventKind, EntityRef);

/// Maps a change to the authoritative lookups it makes stale. Supplied by the
/// caller so the listener stays agnostic of entity shapes.
pub type InvalidationMap =
  Box<dyn Fn(&EventKind, &EntityRef) -> Vec<InvalidationTarget> + Send + Sync>;

/// The outcome of one [`EventListener::handle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerReport {
  /// Distinct changes acted on.
  pub processed:   usize,
  /// Invalidation calls issued.
  pub invalidated: usize,
  /// Notifications dropped as repeats, within the batch or the window.
  pub duplicates:  usize,
  /// Notifications dropped because suppression was active.
  pub suppressed:  usize,
}

// ─── Listener ────────────────────────────────────────────────────────────────

pub struct EventListener {
  mapping:       InvalidationMap,
  notifier:      Arc<dyn Notifier>,
  current_actor: Option<String>,
  options:       InvalidateOptions,
  dedup_window:  TimeDelta,
  /// When each change was last acted on.
  seen:          Mutex<HashMap<DedupKey, DateTime<Utc>>>,
  clock:         Arc<dyn Clock>,
}

impl EventListener {
  pub fn new(
    mapping: InvalidationMap,
    notifier: Arc<dyn Notifier>,
    dedup_window: TimeDelta,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      mapping,
      notifier,
      current_actor: None,
      options: InvalidateOptions::default(),
      dedup_window,
      seen: Mutex::new(HashMap::new()),
      clock,
    }
  }

  /// Changes caused by `actor` are announced as [`Severity::Success`].
  pub fn with_current_actor(mut self, actor: Option<String>) -> Self {
    self.current_actor = actor;
    self
  }

  pub fn with_options(mut self, options: InvalidateOptions) -> Self {
    self.options = options;
    self
  }

  /// Process one delivered batch.
  ///
  /// Repeats of a `(kind, entity)` pair, within the batch or within the dedup
  /// window, are dropped. While `suppression` is active nothing is
  /// invalidated, and the dropped changes are not remembered as seen.
  pub async fn handle<C: AuthoritativeCache>(
    &self,
    batch: Vec<ChangeEvent>,
    suppression: &Suppression,
    cache: &C,
  ) -> ListenerReport {
    let mut report = ListenerReport::default();
    let accepted = self.admit(batch, suppression, &mut report);

    let mut issued: Vec<InvalidationTarget> = Vec::new();
    for event in &accepted {
      for target in (self.mapping)(&event.kind, &event.entity) {
        if issued.contains(&target) {
          continue;
        }
        match cache.invalidate(&target, self.options).await {
          Ok(()) => report.invalidated += 1,
          Err(e) => warn!(entity = %event.entity, %target, error = %e, "invalidation failed"),
        }
        issued.push(target);
      }
      self.announce(event);
    }

    report.processed = accepted.len();
    report
  }

  /// Filter the batch down to the changes that should be acted on, marking
  /// them seen. No lock is held past this point.
  fn admit(
    &self,
    batch: Vec<ChangeEvent>,
    suppression: &Suppression,
    report: &mut ListenerReport,
  ) -> Vec<ChangeEvent> {
    let now = self.clock.now();
    let mut seen = lock(&self.seen);
    seen.retain(|_, at| now - *at < self.dedup_window);

    let mut in_batch: HashSet<DedupKey> = HashSet::new();
    let mut accepted = Vec::new();

    for event in batch {
      let key = event.dedup_key();
      if !in_batch.insert(key.clone()) || seen.contains_key(&key) {
        debug!(kind = %event.kind, entity = %event.entity, "duplicate change dropped");
        report.duplicates += 1;
        continue;
      }
      if suppression.is_suppressed() {
        debug!(kind = %event.kind, entity = %event.entity, "change dropped during suppression");
        report.suppressed += 1;
        continue;
      }
      seen.insert(key, now);
      accepted.push(event);
    }

    accepted
  }

  fn announce(&self, event: &ChangeEvent) {
    let own = matches!(
      (&event.actor, &self.current_actor),
      (Some(actor), Some(current)) if actor == current
    );
    let severity = if own { Severity::Success } else { Severity::Info };
    let message = format!("{} {}", event.entity, event.kind);
    self.notifier.notify(severity, &message);
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    cache::NoopNotifier,
    clock::ManualClock,
    testing::{RecordingCache, RecordingNotifier, clock},
  };

  fn target_for(entity: &EntityRef) -> InvalidationTarget {
    InvalidationTarget::new(json!([entity.category.as_str(), entity.key]))
  }

  fn listener(clock: Arc<ManualClock>) -> EventListener {
    EventListener::new(
      Box::new(|_: &EventKind, entity: &EntityRef| vec![target_for(entity)]),
      Arc::new(NoopNotifier),
      TimeDelta::seconds(3),
      clock,
    )
  }

  fn updated(key: &str) -> ChangeEvent {
    ChangeEvent::new(EventKind::Updated, EntityRef::new("booking", key))
  }

  #[tokio::test]
  async fn duplicates_inside_window_invalidate_once() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    l.handle(vec![updated("b42")], &suppression, &cache).await;
    clock.advance(TimeDelta::seconds(2));
    let report = l.handle(vec![updated("b42")], &suppression, &cache).await;

    assert_eq!(report.duplicates, 1);
    assert_eq!(cache.invalidations().len(), 1);
  }

  #[tokio::test]
  async fn repeat_after_window_invalidates_again() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    l.handle(vec![updated("b42")], &suppression, &cache).await;
    clock.advance(TimeDelta::seconds(3));
    l.handle(vec![updated("b42")], &suppression, &cache).await;

    assert_eq!(cache.invalidations().len(), 2);
  }

  #[tokio::test]
  async fn batch_is_collapsed_per_entity_and_kind() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    let removed = ChangeEvent::new(EventKind::Removed, EntityRef::new("booking", "b1"));
    let report = l
      .handle(
        vec![updated("b1"), updated("b1"), updated("b2"), removed, updated("b1")],
        &suppression,
        &cache,
      )
      .await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.duplicates, 2);
    // `updated b1` and `removed b1` map to the same lookup.
    assert_eq!(report.invalidated, 2);
    assert_eq!(
      cache.invalidations(),
      vec![
        (InvalidationTarget::new(json!(["booking", "b1"])), InvalidateOptions::PREFIX),
        (InvalidationTarget::new(json!(["booking", "b2"])), InvalidateOptions::PREFIX),
      ]
    );
  }

  #[tokio::test]
  async fn suppression_blocks_until_it_expires() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    suppression.set(true, TimeDelta::seconds(5));
    let report = l.handle(vec![updated("b42")], &suppression, &cache).await;
    assert_eq!(report.suppressed, 1);
    assert!(cache.invalidations().is_empty());

    clock.advance(TimeDelta::seconds(5));
    let report = l.handle(vec![updated("b42")], &suppression, &cache).await;
    assert_eq!(report.invalidated, 1);
    assert_eq!(cache.invalidations().len(), 1);
  }

  #[tokio::test]
  async fn suppressed_change_is_not_remembered_as_seen() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    suppression.set(true, TimeDelta::seconds(1));
    l.handle(vec![updated("b42")], &suppression, &cache).await;
    clock.advance(TimeDelta::seconds(1));

    // Still inside the dedup window, but the first delivery was never acted on.
    let report = l.handle(vec![updated("b42")], &suppression, &cache).await;
    assert_eq!(report.duplicates, 0);
    assert_eq!(cache.invalidations().len(), 1);
  }

  #[tokio::test]
  async fn failed_invalidation_is_absorbed() {
    let clock = clock();
    let l = listener(clock.clone());
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();
    cache.fail_invalidations();

    let report = l.handle(vec![updated("b1"), updated("b2")], &suppression, &cache).await;
    assert_eq!(report.processed, 2);
    assert_eq!(report.invalidated, 0);
  }

  #[tokio::test]
  async fn own_changes_are_announced_as_success() {
    let clock = clock();
    let notifier = Arc::new(RecordingNotifier::default());
    let l = EventListener::new(
      Box::new(|_: &EventKind, entity: &EntityRef| vec![target_for(entity)]),
      notifier.clone(),
      TimeDelta::seconds(3),
      clock.clone(),
    )
    .with_current_actor(Some("0xabc".into()));
    let suppression = Suppression::new(clock.clone());
    let cache = RecordingCache::default();

    l.handle(
      vec![updated("mine").by("0xabc"), updated("theirs").by("0xdef"), updated("anon")],
      &suppression,
      &cache,
    )
    .await;

    assert_eq!(
      notifier.notices(),
      vec![
        (Severity::Success, "booking:mine updated".to_owned()),
        (Severity::Info, "booking:theirs updated".to_owned()),
        (Severity::Info, "booking:anon updated".to_owned()),
      ]
    );
  }

  #[test]
  fn events_deserialize_from_transport_json() {
    let event: ChangeEvent = serde_json::from_value(json!({
      "kind": "updated",
      "entity": { "category": "booking", "key": "b42" }
    }))
    .unwrap();
    assert_eq!(event, updated("b42"));

    let other: EventKind = serde_json::from_value(json!({ "other": "listed" })).unwrap();
    assert_eq!(other.to_string(), "listed");
  }
}

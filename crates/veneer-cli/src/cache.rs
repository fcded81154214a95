//! In-process stand-in for the authoritative cache.
//!
//! Snapshots are fed by `truth` commands. Invalidations are logged and
//! counted; a real application would mark the lookup stale and refetch.

use std::{
  collections::HashMap,
  convert::Infallible,
  sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
  },
};

use serde_json::json;
use veneer_core::{
  cache::AuthoritativeCache,
  entity::{EntityRef, InvalidateOptions, InvalidationTarget, Record},
  listener::EventKind,
};

/// The lookup descriptor the harness uses for a single entity.
pub fn entity_lookup(entity: &EntityRef) -> InvalidationTarget {
  InvalidationTarget::new(json!([entity.category.as_str(), entity.key]))
}

/// Event-to-invalidation mapping: the entity itself and its category listing.
pub fn entity_targets(_kind: &EventKind, entity: &EntityRef) -> Vec<InvalidationTarget> {
  vec![
    entity_lookup(entity),
    InvalidationTarget::new(json!([entity.category.as_str()])),
  ]
}

#[derive(Default)]
pub struct HarnessCache {
  snapshots:     Mutex<HashMap<String, Record>>,
  invalidations: AtomicUsize,
}

impl HarnessCache {
  pub fn put(&self, target: &InvalidationTarget, record: Record) {
    self
      .snapshots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(target.to_string(), record);
  }

  pub fn get(&self, target: &InvalidationTarget) -> Option<Record> {
    self
      .snapshots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&target.to_string())
      .cloned()
  }

  pub fn invalidations(&self) -> usize { self.invalidations.load(Ordering::Relaxed) }
}

impl AuthoritativeCache for HarnessCache {
  type Error = Infallible;

  async fn invalidate(
    &self,
    target: &InvalidationTarget,
    options: InvalidateOptions,
  ) -> Result<(), Infallible> {
    self.invalidations.fetch_add(1, Ordering::Relaxed);
    tracing::info!(
      %target,
      exact = options.exact,
      refetch_active = options.refetch_active,
      "invalidated"
    );
    Ok(())
  }

  async fn snapshot(&self, target: &InvalidationTarget) -> Result<Option<Record>, Infallible> {
    Ok(self.get(target))
  }
}

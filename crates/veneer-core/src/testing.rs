//! Fakes shared by the unit tests in this crate.

use std::{
  collections::HashMap,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::{
  cache::{AuthoritativeCache, Notifier, Severity},
  clock::ManualClock,
  entity::{InvalidateOptions, InvalidationTarget, Record},
  sync::lock,
};

pub fn clock() -> Arc<ManualClock> {
  Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()))
}

pub fn record(value: Value) -> Record {
  match value {
    Value::Object(map) => map,
    other => panic!("expected a JSON object, got {other}"),
  }
}

#[derive(Debug, thiserror::Error)]
#[error("authoritative cache unavailable")]
pub struct Unavailable;

/// An [`AuthoritativeCache`] that records invalidations and serves canned
/// snapshots.
#[derive(Default)]
pub struct RecordingCache {
  invalidations:      Mutex<Vec<(InvalidationTarget, InvalidateOptions)>>,
  snapshots:          Mutex<HashMap<String, Record>>,
  fail_snapshots:     AtomicBool,
  fail_invalidations: AtomicBool,
}

impl RecordingCache {
  pub fn put_snapshot(&self, target: &InvalidationTarget, record: Record) {
    lock(&self.snapshots).insert(target.to_string(), record);
  }

  pub fn invalidations(&self) -> Vec<(InvalidationTarget, InvalidateOptions)> {
    lock(&self.invalidations).clone()
  }

  pub fn fail_snapshots(&self) { self.fail_snapshots.store(true, Ordering::SeqCst); }

  pub fn fail_invalidations(&self) { self.fail_invalidations.store(true, Ordering::SeqCst); }
}

impl AuthoritativeCache for RecordingCache {
  type Error = Unavailable;

  async fn invalidate(
    &self,
    target: &InvalidationTarget,
    options: InvalidateOptions,
  ) -> Result<(), Unavailable> {
    if self.fail_invalidations.load(Ordering::SeqCst) {
      return Err(Unavailable);
    }
    lock(&self.invalidations).push((target.clone(), options));
    Ok(())
  }

  async fn snapshot(&self, target: &InvalidationTarget) -> Result<Option<Record>, Unavailable> {
    if self.fail_snapshots.load(Ordering::SeqCst) {
      return Err(Unavailable);
    }
    Ok(lock(&self.snapshots).get(&target.to_string()).cloned())
  }
}

#[derive(Default)]
pub struct RecordingNotifier {
  notices: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
  pub fn notices(&self) -> Vec<(Severity, String)> { lock(&self.notices).clone() }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, severity: Severity, message: &str) {
    lock(&self.notices).push((severity, message.to_owned()));
  }
}

//! Timing configuration for the engine.
//!
//! Every field has a default, so an empty TOML table (or no file at all)
//! yields a working configuration. Durations are integer milliseconds.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, entity::InvalidateOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// How often the reconciliation queue is drained.
  pub drain_interval_ms:      u64,
  /// How often the garbage collector sweeps.
  pub gc_interval_ms:         u64,
  /// Offsets from an entry's creation at which each attempt becomes due.
  /// The length is the number of attempts before the entry is given up.
  pub backoff_schedule_ms:    Vec<u64>,
  /// Maximum age of an overlay entry that is still pending.
  pub pending_ttl_ms:         u64,
  /// Maximum age of an overlay entry that has been completed.
  pub settled_ttl_ms:         u64,
  /// Maximum age of a reconciliation entry, whatever its attempt count.
  pub queue_ttl_ms:           u64,
  /// Window within which identical change events are treated as one.
  pub dedup_window_ms:        u64,
  /// Suppression length used when a caller does not pick one.
  pub default_suppression_ms: u64,
  /// Options the event listener invalidates with.
  pub listener_invalidate:    InvalidateOptions,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      drain_interval_ms:      20_000,
      gc_interval_ms:         10_000,
      backoff_schedule_ms:    vec![0, 10_000, 30_000, 60_000, 120_000, 300_000],
      pending_ttl_ms:         5 * 60_000,
      settled_ttl_ms:         30 * 60_000,
      queue_ttl_ms:           30 * 60_000,
      dedup_window_ms:        3_000,
      default_suppression_ms: 5_000,
      listener_invalidate:    InvalidateOptions::PREFIX,
    }
  }
}

impl EngineConfig {
  /// Reject configurations the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.drain_interval_ms == 0 || self.gc_interval_ms == 0 {
      return Err(Error::Config("timer intervals must be non-zero".into()));
    }
    if self.backoff_schedule_ms.is_empty() {
      return Err(Error::Config("backoff schedule must not be empty".into()));
    }
    if self.backoff_schedule_ms.windows(2).any(|w| w[1] < w[0]) {
      return Err(Error::Config(format!(
        "backoff schedule must be non-decreasing: {:?}",
        self.backoff_schedule_ms
      )));
    }
    if self.settled_ttl_ms < self.pending_ttl_ms {
      return Err(Error::Config(
        "settled_ttl_ms must not be shorter than pending_ttl_ms".into(),
      ));
    }
    Ok(())
  }

  pub fn drain_interval(&self) -> Duration {
    Duration::from_millis(self.drain_interval_ms)
  }

  pub fn gc_interval(&self) -> Duration {
    Duration::from_millis(self.gc_interval_ms)
  }

  pub fn backoff_schedule(&self) -> Vec<TimeDelta> {
    self.backoff_schedule_ms.iter().copied().map(millis).collect()
  }

  pub fn pending_ttl(&self) -> TimeDelta { millis(self.pending_ttl_ms) }

  pub fn settled_ttl(&self) -> TimeDelta { millis(self.settled_ttl_ms) }

  pub fn queue_ttl(&self) -> TimeDelta { millis(self.queue_ttl_ms) }

  pub fn dedup_window(&self) -> TimeDelta { millis(self.dedup_window_ms) }

  pub fn default_suppression(&self) -> TimeDelta {
    millis(self.default_suppression_ms)
  }
}

/// Convert configured milliseconds, saturating at the largest delta.
pub fn millis(ms: u64) -> TimeDelta {
  i64::try_from(ms)
    .ok()
    .and_then(TimeDelta::try_milliseconds)
    .unwrap_or(TimeDelta::MAX)
}

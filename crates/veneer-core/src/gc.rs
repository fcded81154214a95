//! Periodic sweep of overlay and queue entries whose confirmation never came.
//!
//! Pending overlay entries get a short life: one that never settles means a
//! lost confirmation and must not mislead readers for long. Settled entries
//! live longer so a slow authoritative refresh does not flicker the display
//! back to its pre-action state.

use chrono::TimeDelta;
use tracing::info;

use crate::{
  Result,
  config::EngineConfig,
  overlay::OverlayStore,
  queue::{QueueStore, ReconciliationQueue},
};

/// The outcome of one [`GarbageCollector::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
  pub pending_expired: usize,
  pub settled_expired: usize,
  pub queue_expired:   usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GarbageCollector {
  pub pending_ttl: TimeDelta,
  pub settled_ttl: TimeDelta,
  pub queue_ttl:   TimeDelta,
}

impl GarbageCollector {
  pub fn from_config(config: &EngineConfig) -> Self {
    Self {
      pending_ttl: config.pending_ttl(),
      settled_ttl: config.settled_ttl(),
      queue_ttl:   config.queue_ttl(),
    }
  }

  pub async fn sweep<S: QueueStore>(
    &self,
    overlays: &OverlayStore,
    queue: &ReconciliationQueue<S>,
  ) -> Result<GcReport> {
    let now = overlays.now();
    let expired = overlays.evict(|entry| {
      let ttl = if entry.is_pending { self.pending_ttl } else { self.settled_ttl };
      entry.age(now) > ttl
    });

    let mut report = GcReport::default();
    for entry in &expired {
      info!(
        category = %entry.category,
        key = %entry.key,
        pending = entry.is_pending,
        "overlay entry expired"
      );
      if entry.is_pending {
        report.pending_expired += 1;
      } else {
        report.settled_expired += 1;
      }
    }

    report.queue_expired = queue.expire_older_than(self.queue_ttl).await?;
    Ok(report)
  }
}

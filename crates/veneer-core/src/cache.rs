//! Collaborators consumed by Veneer: the authoritative cache and the optional
//! notification sink.

use std::future::Future;

use crate::entity::{InvalidateOptions, InvalidationTarget, Record};

// ─── Authoritative cache ─────────────────────────────────────────────────────

/// The cache holding the last-known authoritative records.
///
/// Veneer only ever marks lookups stale and peeks at snapshots. Fetching,
/// storing and refetching are the implementor's business. Failures are logged
/// and absorbed by the caller; no method here is allowed to stall a drain pass
/// or a listener batch on error.
pub trait AuthoritativeCache: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Mark `target` stale so the next read re-fetches truth.
  fn invalidate<'a>(
    &'a self,
    target: &'a InvalidationTarget,
    options: InvalidateOptions,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// The currently cached value for `target`, if any.
  fn snapshot<'a>(
    &'a self,
    target: &'a InvalidationTarget,
  ) -> impl Future<Output = Result<Option<Record>, Self::Error>> + Send + 'a;
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  /// The change concerns the current actor's own entity.
  Success,
  Info,
}

/// A sink for user- or log-facing notices raised by the event listener.
pub trait Notifier: Send + Sync {
  fn notify(&self, severity: Severity, message: &str);
}

/// Discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
  fn notify(&self, _severity: Severity, _message: &str) {}
}

/// Forwards notices to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn notify(&self, severity: Severity, message: &str) {
    tracing::info!(?severity, "{message}");
  }
}

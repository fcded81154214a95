//! [`Engine`], the public surface of the overlay, bundling every component
//! behind one process-wide handle.
//!
//! Callers write speculative state through the engine, read effective state
//! through [`Engine::resolve`], and feed it change events. The engine's own
//! timers drain the reconciliation queue and sweep stale entries.

use std::{future::Future, sync::Arc};

use chrono::TimeDelta;
use tokio::{
  sync::mpsc,
  time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

use crate::{
  Result,
  cache::{AuthoritativeCache, NoopNotifier, Notifier},
  clock::{Clock, SystemClock},
  config::EngineConfig,
  entity::{Category, Record},
  gc::{GarbageCollector, GcReport},
  listener::{ChangeEvent, EventListener, InvalidationMap, ListenerReport},
  overlay::{OverlayEntry, OverlayStore, OverlayWrite},
  queue::{DrainReport, QueueStore, ReconciliationQueue},
  reconcile::{BackoffSchedule, NewReconciliation, ReconciliationEntry, reconciliation_id},
  suppression::Suppression,
};

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct EngineBuilder {
  config:        EngineConfig,
  clock:         Arc<dyn Clock>,
  notifier:      Arc<dyn Notifier>,
  current_actor: Option<String>,
}

impl EngineBuilder {
  pub fn new(config: EngineConfig) -> Self {
    Self {
      config,
      clock: Arc::new(SystemClock),
      notifier: Arc::new(NoopNotifier),
      current_actor: None,
    }
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// The actor whose own changes are announced as successes.
  pub fn current_actor(mut self, actor: impl Into<String>) -> Self {
    self.current_actor = Some(actor.into());
    self
  }

  /// Validate the configuration and assemble the engine.
  pub fn build<C, S>(self, cache: C, store: S, mapping: InvalidationMap) -> Result<Engine<C, S>>
  where
    C: AuthoritativeCache,
    S: QueueStore,
  {
    self.config.validate()?;
    let schedule = BackoffSchedule::new(self.config.backoff_schedule())?;

    let listener = EventListener::new(
      mapping,
      self.notifier,
      self.config.dedup_window(),
      self.clock.clone(),
    )
    .with_current_actor(self.current_actor)
    .with_options(self.config.listener_invalidate);

    Ok(Engine {
      cache,
      overlays: OverlayStore::new(self.clock.clone()),
      queue: ReconciliationQueue::new(store, schedule, self.clock.clone()),
      suppression: Suppression::new(self.clock),
      listener,
      gc: GarbageCollector::from_config(&self.config),
      config: self.config,
    })
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Engine<C, S> {
  cache:       C,
  overlays:    OverlayStore,
  queue:       ReconciliationQueue<S>,
  suppression: Suppression,
  listener:    EventListener,
  gc:          GarbageCollector,
  config:      EngineConfig,
}

impl<C, S> Engine<C, S>
where
  C: AuthoritativeCache,
  S: QueueStore,
{
  pub fn cache(&self) -> &C { &self.cache }

  // ── Overlay ─────────────────────────────────────────────────────────────

  pub fn set_overlay(&self, category: &Category, key: &str, write: OverlayWrite) {
    self.overlays.set(category, key, write);
  }

  /// Mark the overlay entry confirmed while keeping it in front of a
  /// not-yet-refreshed authoritative record. No-op if absent.
  pub fn complete_overlay(&self, category: &Category, key: &str) -> bool {
    self.overlays.complete(category, key)
  }

  /// Drop the overlay entry and its reconciliation entry. Idempotent.
  pub async fn clear_overlay(&self, category: &Category, key: &str) -> Result<()> {
    self.overlays.remove(category, key);
    self.queue.remove(&reconciliation_id(category, key)).await?;
    Ok(())
  }

  pub fn overlay(&self, category: &Category, key: &str) -> Option<OverlayEntry> {
    self.overlays.get(category, key)
  }

  /// The record readers should see: `authoritative` with any overlay fields
  /// merged over it.
  pub fn resolve(&self, category: &Category, key: &str, authoritative: Record) -> Record {
    self.overlays.resolve(category, key, authoritative)
  }

  /// Write an overlay entry and, when it is pending, its safety-net
  /// reconciliation entry. The overlay is written before the queue.
  pub async fn speculate(
    &self,
    category: &Category,
    key: &str,
    write: OverlayWrite,
    reconciliation: Option<NewReconciliation>,
  ) -> Result<()> {
    let pending = write.is_pending();
    self.overlays.set(category, key, write);
    if let Some(new) = reconciliation.filter(|_| pending) {
      self.queue.enqueue(new).await?;
    }
    Ok(())
  }

  // ── Reconciliation ──────────────────────────────────────────────────────

  pub async fn enqueue_reconciliation(&self, new: NewReconciliation) -> Result<bool> {
    self.queue.enqueue(new).await
  }

  pub async fn remove_reconciliation(&self, id: &str) -> Result<bool> {
    self.queue.remove(id).await
  }

  pub async fn reconciliations(&self) -> Result<Vec<ReconciliationEntry>> {
    self.queue.entries().await
  }

  pub async fn drain(&self) -> Result<DrainReport> { self.queue.drain(&self.cache).await }

  // ── Suppression ─────────────────────────────────────────────────────────

  /// Raise (for `duration`, or the configured default) or lower the
  /// suppression flag.
  pub fn set_suppression(&self, active: bool, duration: Option<TimeDelta>) {
    let duration = duration.unwrap_or_else(|| self.config.default_suppression());
    self.suppression.set(active, duration);
  }

  pub fn is_suppressed(&self) -> bool { self.suppression.is_suppressed() }

  // ── Events ──────────────────────────────────────────────────────────────

  pub async fn handle_events(&self, batch: Vec<ChangeEvent>) -> ListenerReport {
    self.listener.handle(batch, &self.suppression, &self.cache).await
  }

  /// Handle batches from `rx` until every sender is dropped.
  pub async fn listen(&self, mut rx: mpsc::Receiver<Vec<ChangeEvent>>) {
    while let Some(batch) = rx.recv().await {
      let report = self.handle_events(batch).await;
      debug!(?report, "change batch handled");
    }
  }

  // ── Housekeeping ────────────────────────────────────────────────────────

  pub async fn collect_garbage(&self) -> Result<GcReport> {
    self.gc.sweep(&self.overlays, &self.queue).await
  }

  /// Drive the drain and garbage-collection timers until `shutdown` resolves.
  ///
  /// A failing pass is logged and retried on the next tick.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) {
    let mut drain_timer = interval(self.config.drain_interval());
    let mut gc_timer = interval(self.config.gc_interval());
    drain_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    gc_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        _ = drain_timer.tick() => match self.drain().await {
          Ok(report) => debug!(?report, "drain pass finished"),
          Err(e) => warn!(error = %e, "drain pass failed"),
        },
        _ = gc_timer.tick() => match self.collect_garbage().await {
          Ok(report) => debug!(?report, "garbage collection finished"),
          Err(e) => warn!(error = %e, "garbage collection failed"),
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::json;

  use super::*;
  use crate::{
    clock::ManualClock,
    entity::{EntityRef, InvalidateOptions, InvalidationTarget},
    listener::EventKind,
    queue::MemoryQueueStore,
    reconcile::Expected,
    testing::{RecordingCache, clock, record},
  };

  fn booking(key: &str) -> InvalidationTarget { InvalidationTarget::new(json!(["booking", key])) }

  fn engine(
    clock: Arc<ManualClock>,
    config: EngineConfig,
  ) -> Engine<RecordingCache, MemoryQueueStore> {
    EngineBuilder::new(config)
      .clock(clock)
      .build(
        RecordingCache::default(),
        MemoryQueueStore::new(),
        Box::new(|_: &EventKind, entity: &EntityRef| vec![booking(&entity.key)]),
      )
      .unwrap()
  }

  #[tokio::test]
  async fn booking_confirmation_end_to_end() {
    let clock = clock();
    let e = engine(clock.clone(), EngineConfig::default());
    let cat = Category::new("booking");

    e.speculate(
      &cat,
      "b42",
      OverlayWrite::new(record(json!({ "status": "pending" }))).operation("booking"),
      Some(
        NewReconciliation::for_entity(cat.clone(), "b42")
          .target(booking("b42"))
          .expect(Expected::new(booking("b42"), "status", "pending")),
      ),
    )
    .await
    .unwrap();

    // Readers see the guess even though truth still says otherwise.
    e.cache().put_snapshot(&booking("b42"), record(json!({ "status": "none" })));
    let shown = e.resolve(&cat, "b42", record(json!({ "status": "none", "lab": 7 })));
    assert_eq!(shown, record(json!({ "status": "pending", "lab": 7 })));

    // A push notification arrives and invalidates the authoritative lookup.
    clock.advance(TimeDelta::seconds(10));
    let report = e
      .handle_events(vec![ChangeEvent::new(EventKind::Updated, EntityRef::new("booking", "b42"))])
      .await;
    assert_eq!(report.invalidated, 1);
    assert_eq!(e.cache().invalidations(), vec![(booking("b42"), InvalidateOptions::PREFIX)]);

    // The refetch agrees with the guess, so the drain resolves quietly.
    e.cache().put_snapshot(&booking("b42"), record(json!({ "status": "pending" })));
    let report = e.drain().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(e.cache().invalidations().len(), 1);
    assert!(e.reconciliations().await.unwrap().is_empty());

    assert!(e.complete_overlay(&cat, "b42"));
    assert!(!e.overlay(&cat, "b42").unwrap().is_pending);

    e.clear_overlay(&cat, "b42").await.unwrap();
    let truth = record(json!({ "status": "pending", "lab": 7 }));
    assert_eq!(e.resolve(&cat, "b42", truth.clone()), truth);
  }

  #[tokio::test]
  async fn clearing_cancels_the_paired_reconciliation() {
    let e = engine(clock(), EngineConfig::default());
    let cat = Category::new("listing");

    e.speculate(
      &cat,
      "lab-7",
      OverlayWrite::new(record(json!({ "isListed": true }))),
      Some(NewReconciliation::for_entity(cat.clone(), "lab-7").target(booking("x"))),
    )
    .await
    .unwrap();
    assert_eq!(e.reconciliations().await.unwrap().len(), 1);

    e.clear_overlay(&cat, "lab-7").await.unwrap();
    e.clear_overlay(&cat, "lab-7").await.unwrap();

    assert!(e.overlay(&cat, "lab-7").is_none());
    assert!(e.reconciliations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn settled_writes_get_no_reconciliation() {
    let e = engine(clock(), EngineConfig::default());
    let cat = Category::new("listing");

    e.speculate(
      &cat,
      "lab-7",
      OverlayWrite::new(record(json!({ "isListed": false }))).settled(),
      Some(NewReconciliation::for_entity(cat.clone(), "lab-7").target(booking("x"))),
    )
    .await
    .unwrap();

    assert!(e.overlay(&cat, "lab-7").is_some());
    assert!(e.reconciliations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn suppression_defaults_to_configured_length() {
    let clock = clock();
    let e = engine(clock.clone(), EngineConfig { default_suppression_ms: 2_000, ..Default::default() });

    e.set_suppression(true, None);
    assert!(e.is_suppressed());
    clock.advance(TimeDelta::seconds(2));
    assert!(!e.is_suppressed());

    e.set_suppression(true, Some(TimeDelta::minutes(1)));
    e.set_suppression(false, None);
    assert!(!e.is_suppressed());
  }

  #[tokio::test]
  async fn out_of_range_durations_do_not_panic() {
    let clock = clock();
    let config = EngineConfig { backoff_schedule_ms: vec![0, u64::MAX], ..Default::default() };
    let e = engine(clock.clone(), config);

    e.set_suppression(true, Some(crate::config::millis(u64::MAX)));
    assert!(e.is_suppressed());
    e.set_suppression(false, None);

    e.enqueue_reconciliation(
      NewReconciliation::for_entity(Category::new("booking"), "b9").target(booking("b9")),
    )
    .await
    .unwrap();
    let report = e.drain().await.unwrap();
    assert_eq!(report.rescheduled, 1);

    let entries = e.reconciliations().await.unwrap();
    assert_eq!(entries[0].next_attempt_at, crate::clock::end_of_time());

    clock.advance(TimeDelta::days(30));
    assert_eq!(e.drain().await.unwrap().skipped, 1);
  }

  #[tokio::test]
  async fn invalid_config_is_rejected() {
    let result = EngineBuilder::new(EngineConfig { backoff_schedule_ms: vec![], ..Default::default() })
      .build(
        RecordingCache::default(),
        MemoryQueueStore::new(),
        Box::new(|_: &EventKind, _: &EntityRef| Vec::new()),
      );
    assert!(matches!(result, Err(crate::Error::Config(_))));
  }

  #[tokio::test]
  async fn run_drains_until_shutdown() {
    let config = EngineConfig {
      drain_interval_ms: 5,
      gc_interval_ms: 5,
      backoff_schedule_ms: vec![0],
      ..Default::default()
    };
    let e = engine(clock(), config);
    e.enqueue_reconciliation(
      NewReconciliation::for_entity(Category::new("booking"), "b1").target(booking("b1")),
    )
    .await
    .unwrap();

    e.run(tokio::time::sleep(Duration::from_millis(50))).await;

    assert_eq!(e.cache().invalidations(), vec![(booking("b1"), InvalidateOptions::EXACT)]);
    assert!(e.reconciliations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn listen_consumes_until_senders_drop() {
    let e = engine(clock(), EngineConfig::default());
    let (tx, rx) = mpsc::channel(4);

    tx.send(vec![ChangeEvent::new(EventKind::Added, EntityRef::new("booking", "b1"))])
      .await
      .unwrap();
    tx.send(vec![ChangeEvent::new(EventKind::Removed, EntityRef::new("booking", "b2"))])
      .await
      .unwrap();
    drop(tx);

    e.listen(rx).await;
    assert_eq!(e.cache().invalidations().len(), 2);
  }
}

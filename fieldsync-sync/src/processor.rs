//! Sync queue processor.
//!
//! A drain takes a snapshot of the queue, drops items the discard policy
//! rejects, re-queues mutations the reconcilers find missing, and replays the
//! rest in enqueue order. Only one drain runs at a time per processor,
//! whatever triggered it.

use crate::aggregate::DependentAggregate;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityState;
use crate::error::{ReplayError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::handlers::{HandlerRegistry, ReplayContext, ReplayHandler, ReplayOutcome};
use crate::reconcile::{Reconciler, VisitOutcomeReconciler};
use crate::remote::RemoteService;
use crate::status_cache::DerivedStatusCache;
use fieldsync_storage::{LocalStore, StorageResult};
use fieldsync_types::time::now_millis;
use fieldsync_types::{DiscardReason, NewQueueItem, QueueItem};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What asked for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    ConnectivityRestored,
    /// One of the delayed drains scheduled after a reconnect.
    ScheduledRetry,
    VisibilityChanged,
    WindowFocused,
    Manual,
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConnectivityRestored => "connectivity_restored",
            Self::ScheduledRetry => "scheduled_retry",
            Self::VisibilityChanged => "visibility_changed",
            Self::WindowFocused => "window_focused",
            Self::Manual => "manual",
        })
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub discarded_stale: usize,
    pub discarded_exhausted: usize,
    /// Items synthesized by reconciliation.
    pub reconciled: usize,
}

impl DrainReport {
    pub fn discarded(&self) -> usize {
        self.discarded_stale + self.discarded_exhausted
    }

    fn count_discard(&mut self, reason: DiscardReason) {
        match reason {
            DiscardReason::Stale => self.discarded_stale += 1,
            DiscardReason::RetriesExhausted => self.discarded_exhausted += 1,
        }
    }
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain held the guard.
    AlreadyRunning,
    /// Connectivity was not online.
    Offline,
}

/// Processor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Draining = 1,
}

impl ProcessorState {
    fn from_u8(raw: u8) -> Self {
        if raw == Self::Draining as u8 {
            Self::Draining
        } else {
            Self::Idle
        }
    }
}

/// Resets the processor to idle when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicU8);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(ProcessorState::Idle as u8, Ordering::Release);
    }
}

/// Owns the sync queue and replays it against the remote service.
pub struct SyncProcessor {
    config: SyncConfig,
    ctx: ReplayContext,
    connectivity: watch::Receiver<ConnectivityState>,
    events: EventBus,
    handlers: HandlerRegistry,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    aggregates: Vec<Arc<dyn DependentAggregate>>,
    state: AtomicU8,
}

impl SyncProcessor {
    /// Creates a processor with the built-in handlers and the visit outcome
    /// reconciler.
    pub fn new(
        config: SyncConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        status: Arc<DerivedStatusCache>,
        connectivity: watch::Receiver<ConnectivityState>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            ctx: ReplayContext {
                store,
                remote,
                status,
            },
            connectivity,
            events,
            handlers: HandlerRegistry::with_defaults(),
            reconcilers: vec![Arc::new(VisitOutcomeReconciler)],
            aggregates: Vec::new(),
            state: AtomicU8::new(ProcessorState::Idle as u8),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ReplayHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    pub fn without_reconcilers(mut self) -> Self {
        self.reconcilers.clear();
        self
    }

    pub fn with_aggregate(mut self, aggregate: Arc<dyn DependentAggregate>) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn store(&self) -> &LocalStore {
        &self.ctx.store
    }

    pub fn context(&self) -> &ReplayContext {
        &self.ctx
    }

    /// Appends a mutation to the queue. Never touches the network.
    pub async fn enqueue(&self, action: &str, payload: Value) -> SyncResult<QueueItem> {
        Ok(self.ctx.store.enqueue(NewQueueItem::new(action, payload)).await?)
    }

    pub async fn queue_len(&self) -> SyncResult<usize> {
        Ok(self.ctx.store.queue_len().await?)
    }

    /// Runs one drain if connectivity is online and no drain is in flight.
    pub async fn drain(&self, trigger: DrainTrigger) -> SyncResult<DrainOutcome> {
        let online = *self.connectivity.borrow() == ConnectivityState::Online;
        if !online {
            debug!("Drain ({}) skipped: not online", trigger);
            return Ok(DrainOutcome::Offline);
        }

        if self
            .state
            .compare_exchange(
                ProcessorState::Idle as u8,
                ProcessorState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Drain ({}) skipped: already draining", trigger);
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.state);

        debug!("Drain started ({})", trigger);
        let report = self.run_drain().await?;

        if report.succeeded > 0 {
            info!(
                "Drain ({}) finished: {} synced, {} failed, {} discarded",
                trigger,
                report.succeeded,
                report.failed,
                report.discarded()
            );
            self.events.publish(SyncEvent::SyncCompleted(report.clone()));

            let events = self.events.clone();
            let delay = self.config.follow_up_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                events.publish(SyncEvent::SyncCompletedFollowUp);
            });
        } else {
            debug!("Drain ({}) finished: {:?}", trigger, report);
        }

        Ok(DrainOutcome::Completed(report))
    }

    async fn run_drain(&self) -> SyncResult<DrainReport> {
        let store = &self.ctx.store;
        let mut report = DrainReport::default();
        let now = now_millis();

        // Cleanup
        let mut snapshot = store.queue_items().await?;
        let mut pending = Vec::with_capacity(snapshot.len());
        for item in snapshot.iter().cloned() {
            match item.discard_reason(now, self.config.stale_after(), self.config.max_retries) {
                Some(reason) => {
                    warn!(
                        "Discarding {} (item {}, {} retries): {}",
                        item.action, item.id, item.retry_count, reason
                    );
                    match store.discard_queue_item(&item, reason).await {
                        Ok(()) => report.count_discard(reason),
                        Err(e) => error!("Failed to discard item {}: {}", item.id, e),
                    }
                }
                None => pending.push(item),
            }
        }

        // Reconciliation
        for reconciler in &self.reconcilers {
            let missing = match reconciler.missing_items(store, &snapshot).await {
                Ok(missing) => missing,
                Err(e) => {
                    warn!("Reconciler {} failed: {}", reconciler.name(), e);
                    continue;
                }
            };
            for item in missing {
                let action = item.action.clone();
                let item = match store.enqueue(item).await {
                    Ok(item) => item,
                    Err(e) => {
                        error!("Reconciler {} failed to enqueue {}: {}", reconciler.name(), action, e);
                        continue;
                    }
                };
                report.reconciled += 1;
                snapshot.push(item.clone());
                pending.push(item);
            }
        }
        if report.reconciled > 0 {
            info!("Reconciliation re-queued {} items", report.reconciled);
        }

        // Replay
        let mut transactional_synced = false;
        for item in pending {
            match self.replay_item(item, &mut report).await {
                Ok(true) => transactional_synced = true,
                Ok(false) => {}
                Err(e) => error!("Queue bookkeeping failed: {}", e),
            }
        }

        if transactional_synced {
            for aggregate in &self.aggregates {
                if let Err(e) = aggregate.recompute(&self.ctx).await {
                    warn!("Aggregate {} failed: {}", aggregate.name(), e);
                }
            }
        }

        Ok(report)
    }

    /// Replays one item and updates the queue. Returns whether a
    /// transactional item synced.
    async fn replay_item(&self, mut item: QueueItem, report: &mut DrainReport) -> StorageResult<bool> {
        let handler = self.handlers.get(&item.action);
        let result = match &handler {
            Some(handler) => handler.replay(&item.payload, &self.ctx).await,
            None => Err(ReplayError::UnknownAction(item.action.clone())),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() => ReplayOutcome::AlreadyApplied,
            Err(e) => {
                warn!(
                    "Replay of {} (item {}) failed [{}]: {}",
                    item.action,
                    item.id,
                    e.code(),
                    e
                );
                item.record_failure(format!("{}: {}", e.code(), e));
                report.failed += 1;

                if item.is_exhausted(self.config.max_retries) {
                    warn!("Discarding {} (item {}): retries exhausted", item.action, item.id);
                    self.ctx
                        .store
                        .discard_queue_item(&item, DiscardReason::RetriesExhausted)
                        .await?;
                    report.count_discard(DiscardReason::RetriesExhausted);
                } else {
                    self.ctx.store.update_queue_item(&item).await?;
                }
                return Ok(false);
            }
        };

        debug!("Replayed {} (item {}): {:?}", item.action, item.id, outcome);
        self.ctx.store.remove_queue_item(item.id).await?;
        report.succeeded += 1;
        Ok(handler.is_some_and(|h| h.is_transactional()))
    }

    /// Runs a drain in the background.
    pub fn kick(self: &Arc<Self>, trigger: DrainTrigger) -> JoinHandle<SyncResult<DrainOutcome>> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = processor.drain(trigger).await;
            if let Err(e) = &outcome {
                error!("Drain ({}) failed: {}", trigger, e);
            }
            outcome
        })
    }

    /// Drains whenever connectivity comes back, then again on the retry
    /// schedule.
    pub fn spawn_triggers(self: &Arc<Self>) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        let mut connectivity = self.connectivity.clone();

        tokio::spawn(async move {
            let mut was_online = *connectivity.borrow_and_update() == ConnectivityState::Online;
            if was_online {
                processor.kick(DrainTrigger::ConnectivityRestored);
            }

            while connectivity.changed().await.is_ok() {
                let online = *connectivity.borrow_and_update() == ConnectivityState::Online;
                if online && !was_online {
                    processor.kick(DrainTrigger::ConnectivityRestored);
                    for delay in processor.config.retry_schedule() {
                        let processor = Arc::clone(&processor);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            processor.kick(DrainTrigger::ScheduledRetry);
                        });
                    }
                }
                was_online = online;
            }
            debug!("Connectivity channel closed, drain triggers stopped");
        })
    }
}

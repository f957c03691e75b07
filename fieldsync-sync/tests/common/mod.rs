#![allow(dead_code)]

use async_trait::async_trait;
use fieldsync_storage::LocalStore;
use fieldsync_sync::remote::memory::InMemoryRemote;
use fieldsync_sync::{
    ConnectivityState, DependentAggregate, DerivedStatusCache, EventBus, RemoteError, ReplayContext,
    ReplayError, ReplayHandler, ReplayOutcome, SyncConfig, SyncProcessor, SyncResult,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

pub struct Harness {
    pub store: LocalStore,
    pub remote: Arc<InMemoryRemote>,
    pub events: EventBus,
    pub status: Arc<DerivedStatusCache>,
    pub connectivity: watch::Sender<ConnectivityState>,
    pub processor: Arc<SyncProcessor>,
}

impl Harness {
    pub fn set_online(&self, online: bool) {
        let state = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        self.connectivity.send_replace(state);
    }

    pub fn context(&self) -> ReplayContext {
        self.processor.context().clone()
    }
}

/// Remote with the unique keys the real schema declares.
pub fn remote() -> InMemoryRemote {
    InMemoryRemote::new()
        .with_unique_key("visits", "idempotency_key")
        .with_unique_key("orders", "idempotency_key")
}

pub fn harness() -> Harness {
    build(remote(), SyncConfig::default(), |p| p)
}

/// Builds an online harness, letting the caller customize the processor.
pub fn build(
    remote: InMemoryRemote,
    config: SyncConfig,
    customize: impl FnOnce(SyncProcessor) -> SyncProcessor,
) -> Harness {
    build_with_store(LocalStore::open_in_memory().unwrap(), remote, config, customize)
}

/// Like [`build`], over an existing store.
pub fn build_with_store(
    store: LocalStore,
    remote: InMemoryRemote,
    config: SyncConfig,
    customize: impl FnOnce(SyncProcessor) -> SyncProcessor,
) -> Harness {
    let remote = Arc::new(remote);
    let events = EventBus::default();
    let status = Arc::new(DerivedStatusCache::new(events.clone()));
    let (connectivity, rx) = watch::channel(ConnectivityState::Online);

    let processor = SyncProcessor::new(
        config,
        store.clone(),
        remote.clone(),
        status.clone(),
        rx,
        events.clone(),
    );
    let processor = Arc::new(customize(processor));

    Harness {
        store,
        remote,
        events,
        status,
        connectivity,
        processor,
    }
}

pub fn visit_payload(customer: &str, user: &str, date: &str) -> Value {
    json!({
        "customer_id": customer,
        "user_id": user,
        "visit_date": date,
        "outcome": "sale",
    })
}

/// Handler that always fails with the same error.
pub struct FailingHandler {
    pub action: &'static str,
    pub error: RemoteError,
    pub calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new(action: &'static str, error: RemoteError) -> Arc<Self> {
        Arc::new(Self {
            action,
            error,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplayHandler for FailingHandler {
    fn action(&self) -> &'static str {
        self.action
    }

    async fn replay(&self, _payload: &Value, _ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone().into())
    }
}

/// Aggregate that only counts recomputations.
#[derive(Default)]
pub struct CountingAggregate {
    pub runs: AtomicUsize,
}

impl CountingAggregate {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependentAggregate for CountingAggregate {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn recompute(&self, _ctx: &ReplayContext) -> SyncResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

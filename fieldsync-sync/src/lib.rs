//! Offline-first sync engine for FieldSync.
//!
//! This crate implements:
//! - Connectivity classification from platform signals plus active probes
//! - The sync processor: bounded-retry, idempotent replay of queued mutations
//! - Reconciliation of queue items lost between a local write and its enqueue
//! - Cache warming of scoped reference and transactional collections
//! - The derived status cache and the event bus tying components together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  save / enqueue   ┌────────────────┐
//! │ collaborator │ ────────────────> │   LocalStore   │
//! └──────────────┘                   └────────────────┘
//!                                       ▲          ▲
//!        ConnectivityMonitor ──watch──> SyncProcessor  CacheWarmer
//!                                       │          │
//!                                       ▼          ▼
//!                                    ┌────────────────┐
//!                                    │ RemoteService  │
//!                                    └────────────────┘
//! ```
//!
//! Components talk to collaborators through the [`EventBus`].

pub mod aggregate;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod handlers;
pub mod processor;
pub mod reconcile;
pub mod remote;
pub mod status_cache;
pub mod warmer;

pub use aggregate::{DailyVisitProgress, DependentAggregate};
pub use config::{ConnectivityConfig, SyncConfig, WarmerConfig};
pub use connectivity::{
    ConnectivityMonitor, ConnectivityState, HttpProber, MonitorHandle, PlatformEvent,
    PlatformSignal, Prober,
};
pub use error::{ProbeError, RemoteError, ReplayError, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use handlers::{HandlerRegistry, ReplayContext, ReplayHandler, ReplayOutcome};
pub use processor::{DrainOutcome, DrainReport, DrainTrigger, ProcessorState, SyncProcessor};
pub use reconcile::{Reconciler, VisitOutcomeReconciler};
pub use remote::{Filter, RemoteConfig, RemoteService, RestRemote};
pub use status_cache::DerivedStatusCache;
pub use warmer::{CacheWarmer, StepKind, StepProgress, StepStatus, StepSummary, SyncSummary, WarmStep};

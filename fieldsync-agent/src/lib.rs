//! FieldSync agent: loads configuration and wires the sync components
//! together for the `fieldsync-agent` binary.

use anyhow::{Context, Result};
use fieldsync_storage::LocalStore;
use fieldsync_sync::{
    CacheWarmer, ConnectivityConfig, ConnectivityMonitor, ConnectivityState, DailyVisitProgress,
    DerivedStatusCache, EventBus, HttpProber, Prober, RemoteConfig, RemoteService, RestRemote,
    SyncConfig, SyncProcessor, WarmerConfig,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the local database inside the data directory.
pub const DB_FILE: &str = "fieldsync.db";

/// Agent configuration, read from a JSON file. Missing sections fall back to
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    /// Signed-in field user. Scopes owner-filtered cache steps.
    pub user_id: Option<String>,
    pub remote: RemoteConfig,
    pub connectivity: ConnectivityConfig,
    pub sync: SyncConfig,
    pub warmer: WarmerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("fieldsync-data"),
            user_id: None,
            remote: RemoteConfig::default(),
            connectivity: ConnectivityConfig::default(),
            sync: SyncConfig::default(),
            warmer: WarmerConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

/// The wired-up engine.
pub struct Agent {
    pub store: LocalStore,
    pub events: EventBus,
    pub status: Arc<DerivedStatusCache>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub processor: Arc<SyncProcessor>,
    pub warmer: Arc<CacheWarmer>,
}

impl Agent {
    /// Builds the agent against the configured REST service and probe URL.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let remote = RestRemote::new(config.remote.clone()).context("failed to create remote client")?;
        let prober = HttpProber::from_config(&config.connectivity).context("failed to create prober")?;
        let store = LocalStore::open(&config.db_path())
            .with_context(|| format!("failed to open {}", config.db_path().display()))?;
        Ok(Self::build(config, store, Arc::new(remote), Arc::new(prober)))
    }

    /// Builds the agent from explicit parts.
    pub fn build(
        config: &AgentConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let events = EventBus::default();
        let status = Arc::new(DerivedStatusCache::new(events.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            config.connectivity.clone(),
            prober,
            &ConnectivityState::Unknown,
            events.clone(),
        ));

        let mut processor = SyncProcessor::new(
            config.sync.clone(),
            store.clone(),
            remote.clone(),
            status.clone(),
            monitor.subscribe(),
            events.clone(),
        );
        let mut warmer = CacheWarmer::new(config.warmer.clone(), store.clone(), remote, events.clone());
        if let Some(user_id) = &config.user_id {
            processor = processor.with_aggregate(Arc::new(DailyVisitProgress::new(user_id.clone())));
            warmer = warmer.with_owner(user_id.clone());
        }

        Self {
            store,
            events,
            status,
            monitor,
            processor: Arc::new(processor),
            warmer: Arc::new(warmer),
        }
    }

    /// Runs the background loops until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let monitor = self.monitor.spawn();
        let triggers = self.processor.spawn_triggers();
        let periodic = self.warmer.spawn_periodic(self.monitor.subscribe());

        let warmer = self.warmer.clone();
        let initial_warm = tokio::spawn(async move {
            match warmer.warm_if_stale().await {
                Ok(Some(summary)) => info!("Initial warm: {} records", summary.total_records()),
                Ok(None) => {}
                Err(e) => warn!("Initial warm failed: {}", e),
            }
        });

        shutdown.await;
        info!("Shutting down");

        initial_warm.abort();
        periodic.abort();
        triggers.abort();
        monitor.shutdown().await;
        Ok(())
    }
}

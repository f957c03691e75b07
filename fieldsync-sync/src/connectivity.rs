//! Connectivity classification.
//!
//! The platform's own online/offline signal is only used to seed the state
//! and as a hint to probe again. The state moves on probe results alone.

use crate::config::ConnectivityConfig;
use crate::error::{ProbeError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use async_trait::async_trait;
use fieldsync_types::time::now_millis;
use reqwest::Client;
use reqwest::header::CACHE_CONTROL;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Network state as seen by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Not determined yet. The local cache is served as if offline, but
    /// nothing degrades.
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
        })
    }
}

/// The platform's immediate, unverified view of the network.
pub trait PlatformSignal: Send + Sync {
    fn current(&self) -> ConnectivityState;
}

/// A fixed signal, for hosts without a platform network API.
impl PlatformSignal for ConnectivityState {
    fn current(&self) -> ConnectivityState {
        *self
    }
}

/// Online/offline notification raised by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Online,
    Offline,
}

/// Active reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// Fetches a static resource with a cache-busting query parameter.
pub struct HttpProber {
    client: Client,
    url: String,
}

impl HttpProber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create probe client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &ConnectivityConfig) -> SyncResult<Self> {
        Self::new(config.probe_url.clone(), config.probe_timeout())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("_", now_millis().to_string())])
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Tracks connectivity and notifies subscribers on change.
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    prober: Arc<dyn Prober>,
    state_tx: watch::Sender<ConnectivityState>,
    events: EventBus,
    /// Completed probes since startup.
    probe_count: AtomicU64,
    /// Serializes probes so the first-probe rule sees a consistent count.
    probe_lock: Mutex<()>,
}

impl ConnectivityMonitor {
    /// Creates a monitor seeded from the platform's immediate signal.
    pub fn new(
        config: ConnectivityConfig,
        prober: Arc<dyn Prober>,
        platform: &dyn PlatformSignal,
        events: EventBus,
    ) -> Self {
        let seed = platform.current();
        debug!("Connectivity seeded as {}", seed);
        let (state_tx, _) = watch::channel(seed);
        Self {
            config,
            prober,
            state_tx,
            events,
            probe_count: AtomicU64::new(0),
            probe_lock: Mutex::new(()),
        }
    }

    /// Current classification.
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Number of probes completed so far.
    pub fn probe_count(&self) -> u64 {
        self.probe_count.load(Ordering::SeqCst)
    }

    /// Probes once and applies the result. Returns the resulting state.
    ///
    /// A failure is honored as offline unless it is the very first probe and
    /// the state was not already online.
    pub async fn probe_now(&self) -> ConnectivityState {
        let _guard = self.probe_lock.lock().await;

        let result = match tokio::time::timeout(self.config.probe_timeout(), self.prober.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        };
        let first = self.probe_count.fetch_add(1, Ordering::SeqCst) == 0;

        match result {
            Ok(()) => self.set_state(ConnectivityState::Online),
            Err(e) => {
                let previous = self.state();
                if !first || previous == ConnectivityState::Online {
                    debug!("Probe failed: {}", e);
                    self.set_state(ConnectivityState::Offline);
                } else {
                    debug!("First probe failed ({}), keeping state {}", e, previous);
                }
            }
        }
        self.state()
    }

    /// Handles a platform online/offline notification by probing instead of
    /// trusting it.
    pub async fn notify_platform_event(&self, event: PlatformEvent) -> ConnectivityState {
        debug!("Platform reported {:?}, probing", event);
        self.probe_now().await
    }

    fn set_state(&self, next: ConnectivityState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!("Connectivity changed to {}", next);
            self.events.publish(SyncEvent::ConnectivityChanged(next));
        }
    }

    /// Starts the probe loop: one probe after the startup delay, then one per
    /// interval.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(monitor.config.startup_delay()) => {}
                _ = shutdown_rx.changed() => return,
            }
            monitor.probe_now().await;

            let period = monitor.config.probe_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.probe_now().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Connectivity monitor stopped");
        });

        MonitorHandle { task, shutdown_tx }
    }
}

/// Handle to a running probe loop.
pub struct MonitorHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Connectivity monitor task failed: {}", e);
        }
    }
}

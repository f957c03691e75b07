//! Configuration for the sync components.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only needs to name what it changes.

use crate::warmer::WarmStep;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queue items older than this are dropped without replay.
    pub stale_after_secs: u64,
    /// Failed replays allowed before an item is dropped.
    pub max_retries: u32,
    /// Delay of the follow-up "sync completed" signal (ms).
    pub follow_up_delay_ms: u64,
    /// Extra drains scheduled after connectivity is restored.
    pub retry_schedule_secs: Vec<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60 * 60,
            max_retries: 5,
            follow_up_delay_ms: 200,
            retry_schedule_secs: vec![3, 10, 30],
        }
    }
}

impl SyncConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn follow_up_delay(&self) -> Duration {
        Duration::from_millis(self.follow_up_delay_ms)
    }

    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.retry_schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Static resource fetched by the probe. A cache-busting query parameter
    /// is appended on every request.
    pub probe_url: String,
    /// Delay before the first probe after startup.
    pub startup_delay_secs: u64,
    /// Deadline of a single probe.
    pub probe_timeout_secs: u64,
    /// Interval between periodic probes.
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: "http://localhost:8080/health.txt".to_string(),
            startup_delay_secs: 5,
            probe_timeout_secs: 5,
            probe_interval_secs: 30,
        }
    }
}

impl ConnectivityConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Configuration for the cache warmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    /// A full pass younger than this is considered fresh.
    pub ttl_secs: u64,
    /// Interval of the background refresh.
    pub background_interval_secs: u64,
    /// Collections to warm, in pipeline order.
    pub steps: Vec<WarmStep>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 4 * 60 * 60,
            background_interval_secs: 30 * 60,
            steps: WarmStep::field_plan(),
        }
    }
}

impl WarmerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }
}

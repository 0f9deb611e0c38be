//! Federation configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the federation subsystem.
///
/// Loaded by the host from its own config surface and passed to
/// [`crate::sync::SyncCoordinator::new`]. All defaults mirror the values the
/// collective has been running with: a participant that changes nothing gets
/// sane behavior out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FederationConfig {
    /// Collector endpoint URL. `None` disables federation entirely; the core
    /// still aggregates and selects tactics locally.
    pub endpoint: Option<String>,
    /// Seconds between submit cycles.
    pub submit_interval_secs: u64,
    /// Seconds between download cycles.
    pub download_interval_secs: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Minimum locally aggregated samples before a submit cycle uploads.
    pub min_samples: u32,
    /// Delay before the forced bootstrap download after activation.
    pub bootstrap_download_delay_secs: u64,
    /// Delay before the forced bootstrap upload after activation.
    pub bootstrap_upload_delay_secs: u64,
    /// EMA learning rate for per-episode weight merges.
    pub ema_alpha: f32,
    /// Hard cap on samples recorded per episode.
    pub max_episode_samples: usize,
    /// Episodes with fewer samples than this contribute nothing upstream.
    pub min_episode_samples: usize,
    /// Base backoff for transport retries, in milliseconds.
    pub retry_base_ms: u64,
    /// Maximum transport attempts per request (first try included).
    pub retry_max_attempts: u32,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout.
    pub request_timeout_secs: u64,
    /// Pool eviction and exploration policy.
    pub prune: PruneConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            submit_interval_secs: 300,
            download_interval_secs: 600,
            heartbeat_interval_secs: 300,
            min_samples: 10,
            bootstrap_download_delay_secs: 5,
            bootstrap_upload_delay_secs: 120,
            ema_alpha: 0.05,
            max_episode_samples: 10,
            min_episode_samples: 5,
            retry_base_ms: 1000,
            retry_max_attempts: 3,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            prune: PruneConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Whether an endpoint is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Bounds on the global tactic pool and the exploration policy that
/// probabilistically resurrects pruned entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PruneConfig {
    /// Entries older than this are expired.
    pub ttl_secs: u64,
    /// Entries with an average reward below this are removed.
    pub reward_floor: f32,
    /// Per-agent-type bucket cap; overflow keeps the top-K by reward.
    pub per_agent_cap: usize,
    /// Global pool cap across all buckets.
    pub global_cap: usize,
    /// Probability of running a resurrection pass after a merge.
    pub exploration_rate: f64,
    /// Maximum resurrected tactics per agent type per pass.
    pub exploration_per_agent: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            reward_floor: 1.0,
            per_agent_cap: 50,
            global_cap: 2000,
            exploration_rate: 0.15,
            exploration_per_agent: 5,
        }
    }
}

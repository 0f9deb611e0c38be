//! Local outcome aggregation.
//!
//! Collects per-(agent type, tactic) sufficient statistics from raw combat
//! outcomes until a submit cycle ships them to the collector. Aggregation is
//! key-local and statistical: a snapshot taken mid-update is approximate by
//! design, never inconsistent per key.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Accumulated statistics for one (agent type, tactic) pair.
///
/// Invariant: `sample_count == success_count + failure_count`, maintained by
/// construction — the only mutation path is [`LocalAggregate::add_outcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAggregate {
    pub agent_type: String,
    pub tactic: String,
    pub total_reward: f64,
    pub success_count: u32,
    pub failure_count: u32,
    pub sample_count: u32,
}

impl LocalAggregate {
    fn new(agent_type: &str, tactic: &str) -> Self {
        Self {
            agent_type: agent_type.to_owned(),
            tactic: tactic.to_owned(),
            total_reward: 0.0,
            success_count: 0,
            failure_count: 0,
            sample_count: 0,
        }
    }

    fn add_outcome(&mut self, reward: f64, success: bool) {
        self.total_reward += reward;
        self.sample_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }

    /// Mean reward over all recorded samples.
    pub fn average_reward(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.total_reward / f64::from(self.sample_count)
        }
    }

    /// Fraction of successful samples. An empty aggregate reports the neutral
    /// prior 0.5 rather than dividing by zero.
    pub fn success_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.5
        } else {
            f64::from(self.success_count) / f64::from(self.sample_count)
        }
    }
}

struct AggregatorInner {
    pending: HashMap<(String, String), LocalAggregate>,
    /// Every agent type ever recorded, kept across uploads for heartbeats.
    observed: HashSet<String>,
    last_submitted: Option<Instant>,
}

/// Thread-safe accumulator of combat outcomes awaiting upload.
///
/// Mutated from game-logic threads via [`record_outcome`] and from the sync
/// scheduler via [`remove_confirmed`]; both paths are lock-then-touch-one-key,
/// so contention stays negligible.
///
/// [`record_outcome`]: LocalOutcomeAggregator::record_outcome
/// [`remove_confirmed`]: LocalOutcomeAggregator::remove_confirmed
pub struct LocalOutcomeAggregator {
    inner: RwLock<AggregatorInner>,
}

impl LocalOutcomeAggregator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AggregatorInner {
                pending: HashMap::new(),
                observed: HashSet::new(),
                last_submitted: None,
            }),
        }
    }

    /// Record one combat outcome. Synchronous and non-blocking; never touches
    /// the network. A non-finite reward is dropped silently — a poisoned value
    /// must not take the aggregate's invariants with it.
    pub fn record_outcome(&self, agent_type: &str, tactic: &str, reward: f64, success: bool) {
        if !reward.is_finite() {
            tracing::debug!(agent_type, tactic, "dropping non-finite reward");
            return;
        }

        let mut inner = self.inner.write().expect("aggregator lock poisoned");
        if !inner.observed.contains(agent_type) {
            inner.observed.insert(agent_type.to_owned());
            tracing::info!(agent_type, "first outcome observed for agent type");
        }
        inner
            .pending
            .entry((agent_type.to_owned(), tactic.to_owned()))
            .or_insert_with(|| LocalAggregate::new(agent_type, tactic))
            .add_outcome(reward, success);
    }

    /// True when enough samples have accumulated and enough time has passed
    /// since the last confirmed upload.
    pub fn is_ready_to_submit(&self, min_samples: u32, min_interval: Duration) -> bool {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        let total: u32 = inner.pending.values().map(|a| a.sample_count).sum();
        if total < min_samples {
            return false;
        }
        match inner.last_submitted {
            Some(at) => at.elapsed() >= min_interval,
            None => true,
        }
    }

    /// Total pending sample count across all keys.
    pub fn pending_samples(&self) -> u32 {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        inner.pending.values().map(|a| a.sample_count).sum()
    }

    /// Number of pending (agent type, tactic) keys.
    pub fn pending_keys(&self) -> usize {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        inner.pending.len()
    }

    /// Copy of the current aggregates grouped by agent type, the unit the
    /// collector accepts contributions in. Never grouped per single tactic.
    pub fn snapshot_for_upload(&self) -> HashMap<String, Vec<LocalAggregate>> {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        let mut grouped: HashMap<String, Vec<LocalAggregate>> = HashMap::new();
        for aggregate in inner.pending.values() {
            grouped
                .entry(aggregate.agent_type.clone())
                .or_default()
                .push(aggregate.clone());
        }
        grouped
    }

    /// Drop only the keys whose upload was confirmed and stamp the submit
    /// time. Keys that failed to upload stay queued for the next cycle.
    pub fn remove_confirmed<'a>(&self, keys: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut inner = self.inner.write().expect("aggregator lock poisoned");
        let mut removed = 0usize;
        for (agent_type, tactic) in keys {
            if inner
                .pending
                .remove(&(agent_type.to_owned(), tactic.to_owned()))
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            inner.last_submitted = Some(Instant::now());
            tracing::debug!(removed, remaining = inner.pending.len(), "cleared confirmed uploads");
        }
    }

    /// Every agent type this participant has ever recorded an outcome for.
    pub fn observed_agent_types(&self) -> Vec<String> {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        let mut types: Vec<String> = inner.observed.iter().cloned().collect();
        types.sort();
        types
    }
}

impl Default for LocalOutcomeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalOutcomeAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOutcomeAggregator").finish_non_exhaustive()
    }
}

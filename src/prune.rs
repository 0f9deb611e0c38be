//! Pool eviction and exploration.
//!
//! Runs after every successful download-and-merge. Four ordered passes bound
//! pool memory: TTL expiry, reward floor, per-agent-type top-K, then a global
//! top-N across all buckets (which can shrink a bucket that is individually
//! under its cap). A separate probabilistic pass resurrects tactics the
//! policy previously evicted, so an early local optimum never locks in.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::IteratorRandom as _;

use std::collections::{HashMap, HashSet};

use crate::config::PruneConfig;
use crate::pool::GlobalTactic;
use crate::validate::ValidatedSnapshot;

type PoolEntries = HashMap<String, HashMap<String, GlobalTactic>>;

/// What each pruning pass removed, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub expired: usize,
    pub below_floor: usize,
    pub per_agent_evicted: usize,
    pub global_evicted: usize,
}

impl PruneReport {
    pub fn total_removed(&self) -> usize {
        self.expired + self.below_floor + self.per_agent_evicted + self.global_evicted
    }
}

/// Apply the four eviction passes in order.
pub fn prune_pool(entries: &mut PoolEntries, config: &PruneConfig, now: DateTime<Utc>) -> PruneReport {
    let mut report = PruneReport::default();
    let ttl = Duration::seconds(config.ttl_secs as i64);

    for bucket in entries.values_mut() {
        let before = bucket.len();
        bucket.retain(|_, tactic| now.signed_duration_since(tactic.last_updated) <= ttl);
        report.expired += before - bucket.len();

        let before = bucket.len();
        bucket.retain(|_, tactic| tactic.avg_reward >= config.reward_floor);
        report.below_floor += before - bucket.len();

        if bucket.len() > config.per_agent_cap {
            let mut ranked: Vec<(String, f32)> = bucket
                .iter()
                .map(|(tactic, entry)| (tactic.clone(), entry.avg_reward))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            let keep: HashSet<String> =
                ranked.into_iter().take(config.per_agent_cap).map(|(t, _)| t).collect();
            let before = bucket.len();
            bucket.retain(|tactic, _| keep.contains(tactic));
            report.per_agent_evicted += before - bucket.len();
        }
    }

    let total: usize = entries.values().map(HashMap::len).sum();
    if total > config.global_cap {
        let mut ranked: Vec<(String, String, f32)> = entries
            .iter()
            .flat_map(|(agent_type, bucket)| {
                bucket.iter().map(move |(tactic, entry)| {
                    (agent_type.clone(), tactic.clone(), entry.avg_reward)
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut keep_per_type: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (agent_type, tactic, _) in ranked.iter().take(config.global_cap) {
            keep_per_type
                .entry(agent_type.as_str())
                .or_default()
                .insert(tactic.as_str());
        }
        for (agent_type, bucket) in entries.iter_mut() {
            let keep = keep_per_type.get(agent_type.as_str());
            let before = bucket.len();
            bucket.retain(|tactic, _| keep.is_some_and(|set| set.contains(tactic.as_str())));
            report.global_evicted += before - bucket.len();
        }
        tracing::warn!(total, cap = config.global_cap, "global pool cap exceeded, pruned across buckets");
    }

    entries.retain(|_, bucket| !bucket.is_empty());
    report
}

/// Reinsert up to `exploration_per_agent` tactics per agent type that were
/// present in the latest full download but are no longer retained, with a
/// refreshed timestamp and their original reward.
pub fn resurrect<R: Rng>(
    entries: &mut PoolEntries,
    download: &ValidatedSnapshot,
    config: &PruneConfig,
    rng: &mut R,
) -> usize {
    let now = Utc::now();
    let mut resurrected = 0usize;

    for (agent_type, tactics) in &download.agents {
        let bucket = entries.entry(agent_type.clone()).or_default();
        let pruned: Vec<&str> = tactics
            .keys()
            .filter(|tactic| !bucket.contains_key(tactic.as_str()))
            .map(String::as_str)
            .collect();
        if pruned.is_empty() {
            continue;
        }

        for tactic in pruned
            .into_iter()
            .choose_multiple(rng, config.exploration_per_agent)
        {
            let record = &tactics[tactic];
            bucket.insert(
                tactic.to_owned(),
                GlobalTactic {
                    agent_type: agent_type.clone(),
                    tactic: tactic.to_owned(),
                    avg_reward: record.avg_reward as f32,
                    momentum: 0.0,
                    weighted_avg_reward: record.avg_reward as f32,
                    last_updated: now,
                },
            );
            resurrected += 1;
            tracing::debug!(agent_type, tactic, "resurrected pruned tactic for re-testing");
        }
    }

    if resurrected > 0 {
        tracing::info!(resurrected, "exploration pass reintroduced pruned tactics");
    }
    resurrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WireTacticRecord;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    fn tactic(agent_type: &str, name: &str, reward: f32, age_secs: i64) -> GlobalTactic {
        GlobalTactic {
            agent_type: agent_type.to_owned(),
            tactic: name.to_owned(),
            avg_reward: reward,
            momentum: 0.0,
            weighted_avg_reward: reward,
            last_updated: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn bucket_of(count: usize, agent_type: &str, base_reward: f32) -> HashMap<String, GlobalTactic> {
        (0..count)
            .map(|index| {
                let name = format!("tactic_{index}");
                (
                    name.clone(),
                    tactic(agent_type, &name, base_reward + index as f32, 0),
                )
            })
            .collect()
    }

    fn config() -> PruneConfig {
        PruneConfig::default()
    }

    #[test]
    fn expired_entries_removed() {
        let config = config();
        let mut entries = PoolEntries::from([(
            "zombie".to_owned(),
            HashMap::from([
                ("fresh".to_owned(), tactic("zombie", "fresh", 5.0, 60)),
                (
                    "stale".to_owned(),
                    tactic("zombie", "stale", 5.0, config.ttl_secs as i64 + 1),
                ),
            ]),
        )]);

        let report = prune_pool(&mut entries, &config, Utc::now());
        assert_eq!(report.expired, 1);
        assert!(entries["zombie"].contains_key("fresh"));
    }

    #[test]
    fn below_floor_entries_removed() {
        let mut entries = PoolEntries::from([(
            "zombie".to_owned(),
            HashMap::from([
                ("good".to_owned(), tactic("zombie", "good", 2.0, 0)),
                ("weak".to_owned(), tactic("zombie", "weak", 0.5, 0)),
            ]),
        )]);

        let report = prune_pool(&mut entries, &config(), Utc::now());
        assert_eq!(report.below_floor, 1);
        assert!(!entries["zombie"].contains_key("weak"));
    }

    #[test]
    fn per_agent_cap_keeps_top_k_by_reward() {
        let mut entries = PoolEntries::from([("zombie".to_owned(), bucket_of(60, "zombie", 1.0))]);

        let report = prune_pool(&mut entries, &config(), Utc::now());
        assert_eq!(entries["zombie"].len(), 50);
        assert_eq!(report.per_agent_evicted, 10);
        // The 50 survivors are exactly the 50 highest pre-prune rewards
        // (tactic_10 .. tactic_59 at rewards 11.0 .. 60.0).
        for index in 10..60 {
            assert!(entries["zombie"].contains_key(&format!("tactic_{index}")));
        }
        for index in 0..10 {
            assert!(!entries["zombie"].contains_key(&format!("tactic_{index}")));
        }
    }

    #[test]
    fn global_cap_can_evict_from_under_cap_buckets() {
        let mut config = config();
        config.per_agent_cap = 100;
        config.global_cap = 60;
        // Two buckets under the per-agent cap, jointly over the global cap.
        // "strong" rewards dominate, so evictions land in "weak".
        let mut entries = PoolEntries::from([
            ("strong".to_owned(), bucket_of(40, "strong", 100.0)),
            ("weak".to_owned(), bucket_of(40, "weak", 1.0)),
        ]);

        let report = prune_pool(&mut entries, &config, Utc::now());
        let total: usize = entries.values().map(HashMap::len).sum();
        assert_eq!(total, 60);
        assert_eq!(report.global_evicted, 20);
        assert_eq!(entries["strong"].len(), 40);
        assert_eq!(entries["weak"].len(), 20);
    }

    #[test]
    fn post_prune_invariants_hold() {
        let config = config();
        let mut entries = PoolEntries::new();
        for type_index in 0..50 {
            entries.insert(
                format!("type_{type_index}"),
                bucket_of(60, &format!("type_{type_index}"), 1.0),
            );
        }

        prune_pool(&mut entries, &config, Utc::now());

        let now = Utc::now();
        let total: usize = entries.values().map(HashMap::len).sum();
        assert!(total <= config.global_cap);
        for bucket in entries.values() {
            assert!(bucket.len() <= config.per_agent_cap);
            for entry in bucket.values() {
                assert!(entry.avg_reward >= config.reward_floor);
                assert!(
                    now.signed_duration_since(entry.last_updated)
                        <= Duration::seconds(config.ttl_secs as i64)
                );
            }
        }
    }

    #[test]
    fn resurrect_only_reintroduces_pruned_but_seen() {
        let mut entries = PoolEntries::from([(
            "zombie".to_owned(),
            HashMap::from([("kept".to_owned(), tactic("zombie", "kept", 5.0, 0))]),
        )]);
        let download = ValidatedSnapshot {
            agents: HashMap::from([(
                "zombie".to_owned(),
                HashMap::from([
                    (
                        "kept".to_owned(),
                        WireTacticRecord {
                            action: "kept".into(),
                            avg_reward: 5.0,
                            sample_count: 10,
                            success_count: 5,
                            success_rate: 0.5,
                            last_updated: 0,
                        },
                    ),
                    (
                        "evicted".to_owned(),
                        WireTacticRecord {
                            action: "evicted".into(),
                            avg_reward: 0.4,
                            sample_count: 10,
                            success_count: 2,
                            success_rate: 0.2,
                            last_updated: 0,
                        },
                    ),
                ]),
            )]),
        };

        let mut rng = StdRng::seed_from_u64(7);
        let count = resurrect(&mut entries, &download, &config(), &mut rng);
        assert_eq!(count, 1);
        let revived = &entries["zombie"]["evicted"];
        assert!((revived.avg_reward - 0.4).abs() < f32::EPSILON);
        assert!(Utc::now().signed_duration_since(revived.last_updated) < Duration::seconds(5));
    }

    #[test]
    fn resurrect_respects_per_agent_limit() {
        let mut entries = PoolEntries::new();
        let tactics: HashMap<String, WireTacticRecord> = (0..20)
            .map(|index| {
                let name = format!("tactic_{index}");
                (
                    name.clone(),
                    WireTacticRecord {
                        action: name,
                        avg_reward: 0.1,
                        sample_count: 1,
                        success_count: 0,
                        success_rate: 0.0,
                        last_updated: 0,
                    },
                )
            })
            .collect();
        let download = ValidatedSnapshot {
            agents: HashMap::from([("zombie".to_owned(), tactics)]),
        };

        let mut rng = StdRng::seed_from_u64(7);
        let count = resurrect(&mut entries, &download, &config(), &mut rng);
        assert_eq!(count, 5);
        assert_eq!(entries["zombie"].len(), 5);
    }
}

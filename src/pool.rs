//! Global knowledge store.
//!
//! Holds the tactical weight tables (global and situational) and the pool of
//! downloaded tactic entries. Two merge rules coexist deliberately: local
//! per-episode deltas merge by EMA (fine-grained learning), while
//! cross-participant snapshots merge by simple averaging (coarse
//! reconciliation). Selection is softmax sampling, so every available tactic
//! keeps a nonzero probability and exploration never stops.

use chrono::{DateTime, Utc};
use rand::Rng;

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::PruneConfig;
use crate::episode::{CombatState, Situation};
use crate::prune::{self, PruneReport};
use crate::validate::ValidatedSnapshot;

/// One entry in the global tactic pool, owned exclusively by the store and
/// replaced wholesale on merge.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalTactic {
    pub agent_type: String,
    pub tactic: String,
    pub avg_reward: f32,
    pub momentum: f32,
    pub weighted_avg_reward: f32,
    pub last_updated: DateTime<Utc>,
}

struct StoreInner {
    /// agent type → tactic → weight
    global: HashMap<String, HashMap<String, f32>>,
    /// agent type → situation → tactic → weight
    situational: HashMap<String, HashMap<Situation, HashMap<String, f32>>>,
    /// agent type → tactic → pool entry (pruned, TTL'd, capped)
    entries: HashMap<String, HashMap<String, GlobalTactic>>,
}

/// Shared tactical knowledge, safe to read from game threads while the sync
/// scheduler merges in the background. Snapshots are eventually consistent,
/// never torn per key.
pub struct GlobalKnowledgeStore {
    inner: RwLock<StoreInner>,
    ema_alpha: f32,
}

impl GlobalKnowledgeStore {
    pub fn new(ema_alpha: f32) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                global: HashMap::new(),
                situational: HashMap::new(),
                entries: HashMap::new(),
            }),
            ema_alpha,
        }
    }

    /// Merge one episode's weight deltas: `new = old * (1 - α) + delta * α`,
    /// with absent keys initialized to the delta itself.
    pub fn merge_episode(
        &self,
        agent_type: &str,
        tactic_deltas: &HashMap<String, f64>,
        situational_deltas: &HashMap<Situation, HashMap<String, f64>>,
    ) {
        let alpha = self.ema_alpha;
        let mut inner = self.inner.write().expect("knowledge store lock poisoned");

        let global = inner.global.entry(agent_type.to_owned()).or_default();
        for (tactic, delta) in tactic_deltas {
            ema_merge(global, tactic, *delta as f32, alpha);
        }

        let situational = inner.situational.entry(agent_type.to_owned()).or_default();
        for (situation, tactics) in situational_deltas {
            let table = situational.entry(*situation).or_default();
            for (tactic, delta) in tactics {
                ema_merge(table, tactic, *delta as f32, alpha);
            }
        }
    }

    /// Pick a tactic for the given combat state.
    ///
    /// Lookup order: situational weights for the classified situation, then
    /// the agent type's global weights, then a uniform random choice. The
    /// softmax runs over `available` only, treating tactics absent from the
    /// table as weight 0. Returns `None` only when `available` is empty.
    pub fn select_tactic<R: Rng>(
        &self,
        agent_type: &str,
        state: &CombatState,
        available: &[String],
        rng: &mut R,
    ) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        let situation = Situation::classify(state);
        let inner = self.inner.read().expect("knowledge store lock poisoned");

        let weights = inner
            .situational
            .get(agent_type)
            .and_then(|by_situation| by_situation.get(&situation))
            .filter(|table| !table.is_empty())
            .or_else(|| inner.global.get(agent_type).filter(|table| !table.is_empty()));

        match weights {
            Some(table) => Some(softmax_sample(available, table, rng)),
            None => {
                // No learned data for this type yet.
                let index = rng.gen_range(0..available.len());
                Some(available[index].clone())
            }
        }
    }

    /// Deep copy of the global (non-situational) weight table.
    pub fn export_snapshot(&self) -> HashMap<String, HashMap<String, f32>> {
        let inner = self.inner.read().expect("knowledge store lock poisoned");
        inner.global.clone()
    }

    /// Merge a remote weight snapshot by simple averaging: each present key
    /// becomes `(local + incoming) / 2`; absent keys take the incoming value.
    pub fn import_snapshot(&self, remote: &HashMap<String, HashMap<String, f32>>) {
        let mut inner = self.inner.write().expect("knowledge store lock poisoned");
        for (agent_type, incoming) in remote {
            let local = inner.global.entry(agent_type.clone()).or_default();
            for (tactic, incoming_weight) in incoming {
                local
                    .entry(tactic.clone())
                    .and_modify(|weight| *weight = (*weight + incoming_weight) / 2.0)
                    .or_insert(*incoming_weight);
            }
        }
    }

    /// Apply a validated download: replace pool entries wholesale and average
    /// the downloaded rewards into the global weight table. Returns the
    /// number of records applied; 0 means nothing changed.
    pub fn apply_download(&self, validated: &ValidatedSnapshot) -> usize {
        if validated.agents.is_empty() {
            return 0;
        }
        let now = Utc::now();
        let mut applied = 0usize;
        let mut weight_import: HashMap<String, HashMap<String, f32>> = HashMap::new();

        {
            let mut inner = self.inner.write().expect("knowledge store lock poisoned");
            for (agent_type, tactics) in &validated.agents {
                let bucket = inner.entries.entry(agent_type.clone()).or_default();
                for (tactic, record) in tactics {
                    bucket.insert(
                        tactic.clone(),
                        GlobalTactic {
                            agent_type: agent_type.clone(),
                            tactic: tactic.clone(),
                            avg_reward: record.avg_reward as f32,
                            momentum: 0.0,
                            weighted_avg_reward: record.avg_reward as f32,
                            last_updated: now,
                        },
                    );
                    weight_import
                        .entry(agent_type.clone())
                        .or_default()
                        .insert(tactic.clone(), record.avg_reward as f32);
                    applied += 1;
                }
            }
        }

        self.import_snapshot(&weight_import);
        tracing::info!(applied, agent_types = validated.agents.len(), "applied global snapshot");
        applied
    }

    /// Run the eviction passes and, when `explore` is set, the resurrection
    /// pass against the latest download.
    pub fn prune_and_explore<R: Rng>(
        &self,
        download: &ValidatedSnapshot,
        config: &PruneConfig,
        explore: bool,
        rng: &mut R,
    ) -> (PruneReport, usize) {
        let mut inner = self.inner.write().expect("knowledge store lock poisoned");
        let report = prune::prune_pool(&mut inner.entries, config, Utc::now());
        if report.total_removed() > 0 {
            tracing::info!(
                expired = report.expired,
                below_floor = report.below_floor,
                per_agent = report.per_agent_evicted,
                global = report.global_evicted,
                "pruned global tactic pool"
            );
        }
        let resurrected = if explore {
            prune::resurrect(&mut inner.entries, download, config, rng)
        } else {
            0
        };
        (report, resurrected)
    }

    /// Best pool entries across all agent types, by average reward.
    pub fn best_tactics(&self, limit: usize) -> Vec<GlobalTactic> {
        let inner = self.inner.read().expect("knowledge store lock poisoned");
        let mut all: Vec<GlobalTactic> = inner
            .entries
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect();
        all.sort_by(|a, b| b.avg_reward.total_cmp(&a.avg_reward));
        all.truncate(limit);
        all
    }

    /// Total pool entry count.
    pub fn tactic_count(&self) -> usize {
        let inner = self.inner.read().expect("knowledge store lock poisoned");
        inner.entries.values().map(HashMap::len).sum()
    }

    /// Agent types present in the pool.
    pub fn agent_types(&self) -> Vec<String> {
        let inner = self.inner.read().expect("knowledge store lock poisoned");
        let mut types: Vec<String> = inner.entries.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for GlobalKnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalKnowledgeStore")
            .field("ema_alpha", &self.ema_alpha)
            .finish_non_exhaustive()
    }
}

fn ema_merge(table: &mut HashMap<String, f32>, tactic: &str, delta: f32, alpha: f32) {
    table
        .entry(tactic.to_owned())
        .and_modify(|weight| *weight = *weight * (1.0 - alpha) + delta * alpha)
        .or_insert(delta);
}

/// Sample from `p_i = exp(w_i) / Σ exp(w_j)` over the available tactics.
/// Weights are shifted by their maximum before exponentiation; the
/// distribution is unchanged and the exponentials cannot overflow.
fn softmax_sample<R: Rng>(available: &[String], weights: &HashMap<String, f32>, rng: &mut R) -> String {
    let raw: Vec<f64> = available
        .iter()
        .map(|tactic| f64::from(weights.get(tactic).copied().unwrap_or(0.0)))
        .collect();
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = raw.iter().map(|w| (w - max).exp()).collect();
    let sum: f64 = exps.iter().sum();

    let mut roll = rng.gen_range(0.0..1.0) * sum;
    for (index, exp) in exps.iter().enumerate() {
        roll -= exp;
        if roll <= 0.0 {
            return available[index].clone();
        }
    }
    // Floating point residue: fall through to the last candidate.
    available[available.len() - 1].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WireTacticRecord;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    fn deltas(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(t, d)| ((*t).to_owned(), *d)).collect()
    }

    #[test]
    fn ema_merge_matches_formula() {
        let store = GlobalKnowledgeStore::new(0.05);
        store.merge_episode("zombie", &deltas(&[("rush_player", 2.0)]), &HashMap::new());
        store.merge_episode("zombie", &deltas(&[("rush_player", 4.0)]), &HashMap::new());

        let snapshot = store.export_snapshot();
        // 2.0 * 0.95 + 4.0 * 0.05 = 2.1
        assert!((snapshot["zombie"]["rush_player"] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn absent_key_initializes_to_delta() {
        let store = GlobalKnowledgeStore::new(0.05);
        store.merge_episode("zombie", &deltas(&[("rush_player", 3.0)]), &HashMap::new());

        let snapshot = store.export_snapshot();
        assert!((snapshot["zombie"]["rush_player"] - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn export_then_import_on_empty_store_is_identity() {
        let source = GlobalKnowledgeStore::new(0.05);
        source.merge_episode(
            "zombie",
            &deltas(&[("rush_player", 2.0), ("circle_strafe", -1.0)]),
            &HashMap::new(),
        );
        let exported = source.export_snapshot();

        let target = GlobalKnowledgeStore::new(0.05);
        target.import_snapshot(&exported);
        assert_eq!(target.export_snapshot(), exported);
    }

    #[test]
    fn import_averages_existing_keys() {
        let store = GlobalKnowledgeStore::new(0.05);
        store.merge_episode("zombie", &deltas(&[("rush_player", 2.0)]), &HashMap::new());

        let remote = HashMap::from([(
            "zombie".to_owned(),
            HashMap::from([("rush_player".to_owned(), 4.0f32)]),
        )]);
        store.import_snapshot(&remote);

        let snapshot = store.export_snapshot();
        assert!((snapshot["zombie"]["rush_player"] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn disjoint_imports_commute() {
        let s1 = HashMap::from([(
            "zombie".to_owned(),
            HashMap::from([("rush_player".to_owned(), 2.0f32)]),
        )]);
        let s2 = HashMap::from([(
            "skeleton".to_owned(),
            HashMap::from([("strafe_shoot".to_owned(), 4.0f32)]),
        )]);

        let forward = GlobalKnowledgeStore::new(0.05);
        forward.import_snapshot(&s1);
        forward.import_snapshot(&s2);

        let reverse = GlobalKnowledgeStore::new(0.05);
        reverse.import_snapshot(&s2);
        reverse.import_snapshot(&s1);

        assert_eq!(forward.export_snapshot(), reverse.export_snapshot());
    }

    #[test]
    fn select_with_no_weights_is_uniform_choice() {
        let store = GlobalKnowledgeStore::new(0.05);
        let available = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            let choice = store
                .select_tactic("zombie", &CombatState::default(), &available, &mut rng)
                .unwrap();
            assert!(available.contains(&choice));
        }
    }

    #[test]
    fn select_with_empty_available_is_none() {
        let store = GlobalKnowledgeStore::new(0.05);
        let mut rng = StdRng::seed_from_u64(42);
        assert!(
            store
                .select_tactic("zombie", &CombatState::default(), &[], &mut rng)
                .is_none()
        );
    }

    #[test]
    fn softmax_favors_heavier_weights_but_explores() {
        let store = GlobalKnowledgeStore::new(0.05);
        // Strong preference through repeated merges at the initialization path.
        store.merge_episode(
            "zombie",
            &deltas(&[("strong", 2.0), ("weak", -2.0)]),
            &HashMap::new(),
        );

        let available = vec!["strong".to_owned(), "weak".to_owned()];
        let mut rng = StdRng::seed_from_u64(1);
        let mut strong = 0usize;
        let mut weak = 0usize;
        for _ in 0..1000 {
            match store
                .select_tactic("zombie", &CombatState::default(), &available, &mut rng)
                .unwrap()
                .as_str()
            {
                "strong" => strong += 1,
                _ => weak += 1,
            }
        }
        assert!(strong > weak * 5, "strong={strong} weak={weak}");
        assert!(weak > 0, "every available tactic keeps nonzero probability");
    }

    #[test]
    fn situational_weights_take_priority_over_global() {
        let store = GlobalKnowledgeStore::new(0.05);
        store.merge_episode("zombie", &deltas(&[("global_favorite", 50.0)]), &HashMap::new());
        let situational = HashMap::from([(
            Situation::LowHealth,
            deltas(&[("retreat", 50.0)]),
        )]);
        store.merge_episode("zombie", &HashMap::new(), &situational);

        let state = CombatState {
            self_low_health: true,
            ..CombatState::default()
        };
        let available = vec!["global_favorite".to_owned(), "retreat".to_owned()];
        let mut rng = StdRng::seed_from_u64(9);
        let mut retreats = 0usize;
        for _ in 0..200 {
            if store
                .select_tactic("zombie", &state, &available, &mut rng)
                .unwrap()
                == "retreat"
            {
                retreats += 1;
            }
        }
        assert!(retreats > 190, "retreats={retreats}");
    }

    #[test]
    fn empty_validated_snapshot_applies_nothing() {
        let store = GlobalKnowledgeStore::new(0.05);
        store.merge_episode("zombie", &deltas(&[("rush_player", 2.0)]), &HashMap::new());
        let before = store.export_snapshot();

        assert_eq!(store.apply_download(&ValidatedSnapshot::default()), 0);
        assert_eq!(store.export_snapshot(), before);
        assert_eq!(store.tactic_count(), 0);
    }

    #[test]
    fn apply_download_fills_pool_and_weights() {
        let store = GlobalKnowledgeStore::new(0.05);
        let validated = ValidatedSnapshot {
            agents: HashMap::from([(
                "zombie".to_owned(),
                HashMap::from([(
                    "rush_player".to_owned(),
                    WireTacticRecord {
                        action: "rush_player".into(),
                        avg_reward: 2.5,
                        sample_count: 10,
                        success_count: 7,
                        success_rate: 0.7,
                        last_updated: 0,
                    },
                )]),
            )]),
        };

        assert_eq!(store.apply_download(&validated), 1);
        assert_eq!(store.tactic_count(), 1);
        assert_eq!(store.agent_types(), vec!["zombie".to_owned()]);
        let best = store.best_tactics(10);
        assert_eq!(best.len(), 1);
        assert!((best[0].avg_reward - 2.5).abs() < f32::EPSILON);
        let snapshot = store.export_snapshot();
        assert!((snapshot["zombie"]["rush_player"] - 2.5).abs() < f32::EPSILON);
    }
}

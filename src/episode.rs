//! Episode lifecycle and reduction to weight deltas.
//!
//! An episode is one continuous encounter for one agent: a bounded sequence
//! of (situation, tactic, damage delta) samples recorded at a throttled
//! cadence, finalized into an [`EpisodeOutcome`] and reduced to tactical and
//! situational weight deltas. The episode object itself is discarded after
//! reduction; only the deltas flow upstream.

use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::RwLock;

/// Snapshot of combat state at sample time, provided by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombatState {
    pub self_low_health: bool,
    pub target_low_health: bool,
    pub target_shielding: bool,
    pub nearby_allies: u32,
    /// Distance to the current target, in world units.
    pub distance_to_target: f32,
}

/// Coarse, mutually exclusive classification of combat state.
///
/// Categories are evaluated top-to-bottom; the first match wins, so an agent
/// that is both low on health and in close range classifies as `LowHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    LowHealth,
    TargetLowHealth,
    TargetShielding,
    GroupCombat,
    CloseRange,
    LongRange,
    Neutral,
}

impl Situation {
    /// Classify a combat state by the fixed priority list.
    pub fn classify(state: &CombatState) -> Self {
        if state.self_low_health {
            Self::LowHealth
        } else if state.target_low_health {
            Self::TargetLowHealth
        } else if state.target_shielding {
            Self::TargetShielding
        } else if state.nearby_allies >= 2 {
            Self::GroupCombat
        } else if state.distance_to_target < 3.0 {
            Self::CloseRange
        } else if state.distance_to_target > 8.0 {
            Self::LongRange
        } else {
            Self::Neutral
        }
    }
}

impl std::fmt::Display for Situation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::LowHealth => "low_health",
            Self::TargetLowHealth => "target_low_health",
            Self::TargetShielding => "target_shielding",
            Self::GroupCombat => "group_combat",
            Self::CloseRange => "close_range",
            Self::LongRange => "long_range",
            Self::Neutral => "neutral",
        };
        f.write_str(label)
    }
}

/// One tactical decision within an episode.
#[derive(Debug, Clone)]
struct EpisodeSample {
    situation: Situation,
    tactic: String,
    /// Positive = damage dealt this step, negative = damage taken.
    damage_delta: f32,
}

/// An active encounter for one agent.
#[derive(Debug)]
struct Episode {
    agent_type: String,
    samples: Vec<EpisodeSample>,
    start_tick: u32,
}

/// Terminal summary of a finished episode.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeOutcome {
    pub agent_type: String,
    pub episode_reward: f64,
    pub duration_ticks: u32,
    pub target_defeated: bool,
    pub self_defeated: bool,
    pub sample_count: usize,
    tactic_counts: HashMap<String, u32>,
    situation_tactics: Vec<(Situation, String)>,
}

impl EpisodeOutcome {
    /// Whether the episode is counted as a success upstream.
    pub fn was_successful(&self) -> bool {
        self.episode_reward > 0.0
    }

    /// True when the episode carries enough samples to generalize from.
    /// Sparse episodes are noise, not signal.
    pub fn is_ready_for_learning(&self, min_samples: usize) -> bool {
        self.sample_count >= min_samples
    }

    /// Attribute a share of the episode reward to each tactic, proportional
    /// to how often that tactic was used during the episode.
    pub fn extract_tactical_weights(&self) -> HashMap<String, f64> {
        let total = self.sample_count as f64;
        if total == 0.0 {
            return HashMap::new();
        }
        self.tactic_counts
            .iter()
            .map(|(tactic, count)| {
                (tactic.clone(), self.episode_reward * f64::from(*count) / total)
            })
            .collect()
    }

    /// Per-situation tactic deltas: each use of a tactic in a situation adds
    /// +1.0 for a successful episode, -0.5 for a failed one.
    pub fn extract_situational_weights(&self) -> HashMap<Situation, HashMap<String, f64>> {
        let multiplier = if self.was_successful() { 1.0 } else { -0.5 };
        let mut weights: HashMap<Situation, HashMap<String, f64>> = HashMap::new();
        for (situation, tactic) in &self.situation_tactics {
            *weights
                .entry(*situation)
                .or_default()
                .entry(tactic.clone())
                .or_insert(0.0) += multiplier;
        }
        weights
    }
}

/// Computes the terminal reward for an episode.
///
/// Weighted sum of the win/loss outcome, net damage dealt minus taken, and a
/// quick-win bonus for finishing the target in under 600 ticks.
fn episode_reward(
    target_defeated: bool,
    self_defeated: bool,
    damage_dealt: f64,
    damage_taken: f64,
    duration_ticks: u32,
) -> f64 {
    let mut reward = 0.0;
    if target_defeated {
        reward += 100.0;
    } else if self_defeated {
        reward -= 50.0;
    }
    reward += damage_dealt * 2.0;
    reward -= damage_taken;
    if target_defeated && duration_ticks < 600 {
        reward += 20.0;
    }
    reward
}

/// Tracks active episodes per agent id.
///
/// State machine per agent: idle → active (`start_episode`) → terminal
/// (`end_episode`) → discarded. Sample recording outside the active state is
/// a no-op, as is recording past the sample cap.
pub struct EpisodeRecorder {
    active: RwLock<HashMap<String, Episode>>,
    max_samples: usize,
}

impl EpisodeRecorder {
    pub fn new(max_samples: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            max_samples,
        }
    }

    /// Begin an episode for an agent. Restarting an already-active agent
    /// discards the previous unfinished episode.
    pub fn start_episode(&self, agent_id: &str, agent_type: &str, start_tick: u32) {
        let mut active = self.active.write().expect("episode lock poisoned");
        let previous = active.insert(
            agent_id.to_owned(),
            Episode {
                agent_type: agent_type.to_owned(),
                samples: Vec::new(),
                start_tick,
            },
        );
        if previous.is_some() {
            tracing::debug!(agent_id, "restarted episode, unfinished one discarded");
        }
    }

    /// Record one tactical decision. No-op if the agent has no active episode
    /// or the sample cap is reached.
    pub fn record_sample(&self, agent_id: &str, state: &CombatState, tactic: &str, damage_delta: f32) {
        let mut active = self.active.write().expect("episode lock poisoned");
        let Some(episode) = active.get_mut(agent_id) else {
            return;
        };
        if episode.samples.len() >= self.max_samples {
            return;
        }
        episode.samples.push(EpisodeSample {
            situation: Situation::classify(state),
            tactic: tactic.to_owned(),
            damage_delta,
        });
    }

    /// Finalize an agent's episode into an outcome. Returns `None` when the
    /// agent had no active episode.
    pub fn end_episode(
        &self,
        agent_id: &str,
        target_defeated: bool,
        self_defeated: bool,
        end_tick: u32,
    ) -> Option<EpisodeOutcome> {
        let mut active = self.active.write().expect("episode lock poisoned");
        let episode = active.remove(agent_id)?;

        let damage_dealt: f64 = episode
            .samples
            .iter()
            .map(|s| f64::from(s.damage_delta.max(0.0)))
            .sum();
        let damage_taken: f64 = episode
            .samples
            .iter()
            .map(|s| f64::from((-s.damage_delta).max(0.0)))
            .sum();
        let duration_ticks = end_tick.saturating_sub(episode.start_tick);

        let mut tactic_counts: HashMap<String, u32> = HashMap::new();
        let mut situation_tactics = Vec::with_capacity(episode.samples.len());
        for sample in &episode.samples {
            *tactic_counts.entry(sample.tactic.clone()).or_insert(0) += 1;
            situation_tactics.push((sample.situation, sample.tactic.clone()));
        }

        Some(EpisodeOutcome {
            agent_type: episode.agent_type,
            episode_reward: episode_reward(
                target_defeated,
                self_defeated,
                damage_dealt,
                damage_taken,
                duration_ticks,
            ),
            duration_ticks,
            target_defeated,
            self_defeated,
            sample_count: episode.samples.len(),
            tactic_counts,
            situation_tactics,
        })
    }

    /// Number of currently active episodes.
    pub fn active_count(&self) -> usize {
        self.active.read().expect("episode lock poisoned").len()
    }
}

impl std::fmt::Debug for EpisodeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeRecorder")
            .field("max_samples", &self.max_samples)
            .finish_non_exhaustive()
    }
}

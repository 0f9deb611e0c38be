//! Sanitation of untrusted incoming records.
//!
//! Everything downloaded from the collector is participant-supplied and must
//! be treated as hostile until proven otherwise. Invalid records are
//! rejected, never clamped: a poisoned value clamped into range is
//! indistinguishable from a legitimate extreme, and would still steer
//! learning. Structural failures discard the whole agent-type batch so a
//! partially malformed payload cannot poison unrelated tactics.

use std::collections::HashMap;

use crate::transport::{PoolSnapshot, WireAgentEntry, WireTacticRecord};

/// Upper bounds treated as absurd rather than merely extreme.
const MAX_SAMPLE_COUNT: i64 = 1_000_000;
const MAX_ABS_REWARD: f64 = 1_000_000.0;

/// Why a record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("non-finite reward")]
    NonFiniteReward,
    #[error("reward out of range")]
    RewardOutOfRange,
    #[error("success rate outside [0, 1]")]
    SuccessRateOutOfRange,
    #[error("negative count")]
    NegativeCount,
    #[error("zero sample count")]
    ZeroCount,
    #[error("sample count implausibly large")]
    CountOverflow,
    #[error("success count exceeds sample count")]
    CountMismatch,
    #[error("empty tactic id")]
    EmptyTacticId,
}

/// A snapshot that passed structural and numeric validation, normalized to
/// the internal map-of-maps form.
#[derive(Debug, Clone, Default)]
pub struct ValidatedSnapshot {
    pub agents: HashMap<String, HashMap<String, WireTacticRecord>>,
}

impl ValidatedSnapshot {
    /// Total validated records across all agent types.
    pub fn record_count(&self) -> usize {
        self.agents.values().map(HashMap::len).sum()
    }
}

/// Structural check on one agent-type entry: a tactic table must be present
/// and decodable. On failure the whole batch for that agent type is
/// discarded.
pub fn validate_agent_batch(entry: &WireAgentEntry, agent_type: &str) -> bool {
    if entry.tactics.is_none() {
        tracing::warn!(agent_type, "discarding batch without tactic table");
        return false;
    }
    if entry.submissions.is_some_and(|count| count < 0) {
        tracing::warn!(agent_type, "discarding batch with negative submission count");
        return false;
    }
    true
}

/// Numeric validation of a single record. Rejection only, no repair.
pub fn sanitize_one(
    record: &WireTacticRecord,
    tactic_id: &str,
    agent_type: &str,
) -> Result<(), RejectReason> {
    let reason = if tactic_id.trim().is_empty() {
        Some(RejectReason::EmptyTacticId)
    } else if !record.avg_reward.is_finite() {
        Some(RejectReason::NonFiniteReward)
    } else if record.avg_reward.abs() > MAX_ABS_REWARD {
        Some(RejectReason::RewardOutOfRange)
    } else if !record.success_rate.is_finite() || !(0.0..=1.0).contains(&record.success_rate) {
        Some(RejectReason::SuccessRateOutOfRange)
    } else if record.sample_count < 0 || record.success_count < 0 {
        Some(RejectReason::NegativeCount)
    } else if record.sample_count == 0 {
        Some(RejectReason::ZeroCount)
    } else if record.sample_count > MAX_SAMPLE_COUNT {
        Some(RejectReason::CountOverflow)
    } else if record.success_count > record.sample_count {
        Some(RejectReason::CountMismatch)
    } else {
        None
    };

    match reason {
        Some(reason) => {
            tracing::warn!(agent_type, tactic_id, %reason, "rejected tactic record");
            Err(reason)
        }
        None => Ok(()),
    }
}

/// In-place removal of invalid records from a normalized tactic table.
/// Returns the number of records that survived.
pub fn sanitize_all(tactics: &mut HashMap<String, WireTacticRecord>, agent_type: &str) -> usize {
    let before = tactics.len();
    tactics.retain(|tactic_id, record| sanitize_one(record, tactic_id, agent_type).is_ok());
    let kept = tactics.len();
    if kept < before {
        tracing::warn!(agent_type, removed = before - kept, kept, "removed invalid tactic records");
    }
    kept
}

/// Validate a full downloaded snapshot: drop structurally invalid batches,
/// normalize the rest, and strip invalid records. Agent types left with zero
/// valid records are dropped so downstream merge sees only applicable data.
pub fn validate_snapshot(snapshot: PoolSnapshot) -> ValidatedSnapshot {
    let mut validated = ValidatedSnapshot::default();
    for (agent_type, entry) in snapshot.agents {
        if !validate_agent_batch(&entry, &agent_type) {
            continue;
        }
        let Some(table) = entry.tactics else {
            continue;
        };
        let mut tactics = table.normalize();
        if sanitize_all(&mut tactics, &agent_type) > 0 {
            validated.agents.insert(agent_type, tactics);
        }
    }
    validated
}

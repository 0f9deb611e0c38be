//! Federated tactic learning for autonomous game agents.
//!
//! Each participating game server runs this crate embedded in its agent loop:
//! combat episodes are recorded and scored, per-tactic outcomes accumulate in
//! a local aggregator, and a background coordinator periodically exchanges
//! those aggregates with a shared collector. Downloaded knowledge is validated
//! by rejection, merged into the [`pool::GlobalKnowledgeStore`], and bounded
//! by pruning with a probabilistic exploration pass that resurrects recently
//! evicted tactics.
//!
//! The host-facing surface is small:
//!
//! - [`EpisodeRecorder`] and [`LocalOutcomeAggregator`] on the game loop side,
//! - [`GlobalKnowledgeStore::select_tactic`] for softmax tactic picks,
//! - [`SyncCoordinator`] plus an [`HttpTransport`] for the federation side.
//!
//! With no endpoint configured everything above the transport still works;
//! the server simply learns alone.

pub mod aggregate;
pub mod config;
pub mod episode;
pub mod pool;
pub mod prune;
pub mod sync;
pub mod transport;
pub mod validate;

pub use aggregate::{LocalAggregate, LocalOutcomeAggregator};
pub use config::{FederationConfig, PruneConfig};
pub use episode::{CombatState, EpisodeOutcome, EpisodeRecorder, Situation};
pub use pool::{GlobalKnowledgeStore, GlobalTactic};
pub use sync::{SyncCoordinator, SyncState, SyncStats, SyncStatus};
pub use transport::{HttpTransport, RemoteTransport, RetryPolicy, TransportError};
pub use validate::{RejectReason, ValidatedSnapshot};

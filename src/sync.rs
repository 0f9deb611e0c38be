//! Sync coordinator.
//!
//! Owns the background lifecycle of a federation participant: a bootstrap
//! phase with one forced download and one forced upload, then steady-state
//! submit / download / heartbeat cycles on a single scheduler. Cycles run
//! one at a time, in tick order, so two cycles can never snapshot and upload
//! the same aggregates; only the network calls inside a cycle fan out to the
//! small worker pool. Every remote failure is absorbed here; the host
//! process never sees a federation error.

use chrono::Utc;
use rand::Rng as _;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::aggregate::LocalOutcomeAggregator;
use crate::config::FederationConfig;
use crate::pool::GlobalKnowledgeStore;
use crate::transport::{RemoteTransport, SubmitRequest};
use crate::validate::validate_snapshot;

const WORKER_PERMITS: usize = 2;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No endpoint configured. Local learning continues, nothing leaves the
    /// process.
    Disabled,
    /// Endpoint configured, forced bootstrap passes not yet complete.
    Bootstrapping,
    /// Steady-state periodic cycles.
    Active,
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Monotonic cycle counters, readable at any time without locking.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub submits_ok: AtomicU64,
    pub submits_rejected: AtomicU64,
    pub submits_failed: AtomicU64,
    pub downloads_ok: AtomicU64,
    pub downloads_empty: AtomicU64,
    pub downloads_failed: AtomicU64,
    pub heartbeats_ok: AtomicU64,
    pub heartbeats_failed: AtomicU64,
    pub records_applied: AtomicU64,
    /// Epoch milliseconds of the last confirmed upload; 0 = never.
    pub last_submit_epoch_ms: AtomicU64,
    /// Epoch milliseconds of the last successful collector contact on the
    /// download path (including an empty pool); 0 = never.
    pub last_download_epoch_ms: AtomicU64,
}

/// Point-in-time view for status surfaces.
#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub state: SyncState,
    pub submits_ok: u64,
    pub submits_rejected: u64,
    pub submits_failed: u64,
    pub downloads_ok: u64,
    pub downloads_failed: u64,
    pub heartbeats_ok: u64,
    pub records_applied: u64,
    pub pending_samples: u32,
    pub pool_size: usize,
    /// Seconds since the last confirmed upload; `None` = never.
    pub last_submit_age_secs: Option<u64>,
    /// Seconds since the last successful download contact; `None` = never.
    pub last_download_age_secs: Option<u64>,
}

impl std::fmt::Display for SyncStatus {
    /// One-line summary for admin/status surfaces.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: {} submitted ({} rejected, {} failed), {} downloads ({} records), {} heartbeats, {} pending samples, pool {}",
            self.state,
            self.submits_ok,
            self.submits_rejected,
            self.submits_failed,
            self.downloads_ok,
            self.records_applied,
            self.heartbeats_ok,
            self.pending_samples,
            self.pool_size,
        )?;
        match self.last_submit_age_secs {
            Some(age) => write!(f, ", last submit {age}s ago")?,
            None => write!(f, ", last submit never")?,
        }
        match self.last_download_age_secs {
            Some(age) => write!(f, ", last download {age}s ago"),
            None => write!(f, ", last download never"),
        }
    }
}

fn epoch_age_secs(epoch_ms: u64) -> Option<u64> {
    if epoch_ms == 0 {
        return None;
    }
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    Some(now_ms.saturating_sub(epoch_ms) / 1000)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Shared {
    config: FederationConfig,
    aggregator: Arc<LocalOutcomeAggregator>,
    store: Arc<GlobalKnowledgeStore>,
    transport: Arc<dyn RemoteTransport>,
    stats: SyncStats,
    state: RwLock<SyncState>,
    workers: Arc<Semaphore>,
}

impl Shared {
    fn set_state(&self, state: SyncState) {
        *self.state.write().expect("sync state lock poisoned") = state;
    }

    fn state(&self) -> SyncState {
        *self.state.read().expect("sync state lock poisoned")
    }
}

/// Drives the federation schedule against a [`RemoteTransport`].
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncCoordinator {
    pub fn new(
        config: FederationConfig,
        aggregator: Arc<LocalOutcomeAggregator>,
        store: Arc<GlobalKnowledgeStore>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let enabled = config.is_enabled();
        let shared = Arc::new(Shared {
            config,
            aggregator,
            store,
            transport,
            stats: SyncStats::default(),
            state: RwLock::new(if enabled {
                SyncState::Bootstrapping
            } else {
                SyncState::Disabled
            }),
            workers: Arc::new(Semaphore::new(WORKER_PERMITS)),
        });
        let (shutdown_tx, _) = watch::channel(false);
        Self { shared, shutdown_tx }
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn status(&self) -> SyncStatus {
        let stats = &self.shared.stats;
        SyncStatus {
            state: self.shared.state(),
            submits_ok: stats.submits_ok.load(Ordering::Relaxed),
            submits_rejected: stats.submits_rejected.load(Ordering::Relaxed),
            submits_failed: stats.submits_failed.load(Ordering::Relaxed),
            downloads_ok: stats.downloads_ok.load(Ordering::Relaxed),
            downloads_failed: stats.downloads_failed.load(Ordering::Relaxed),
            heartbeats_ok: stats.heartbeats_ok.load(Ordering::Relaxed),
            records_applied: stats.records_applied.load(Ordering::Relaxed),
            pending_samples: self.shared.aggregator.pending_samples(),
            pool_size: self.shared.store.tactic_count(),
            last_submit_age_secs: epoch_age_secs(stats.last_submit_epoch_ms.load(Ordering::Relaxed)),
            last_download_age_secs: epoch_age_secs(
                stats.last_download_epoch_ms.load(Ordering::Relaxed),
            ),
        }
    }

    /// Start the scheduler. Returns immediately; the task runs until
    /// [`shutdown`](Self::shutdown) or process exit.
    pub fn spawn(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if !shared.config.is_enabled() {
                tracing::info!("federation disabled, sync scheduler not starting");
                return;
            }
            run_scheduler(shared, shutdown_rx).await;
        })
    }

    /// Stop the scheduler, wait (bounded) for in-flight collector calls to
    /// drain, then flush pending aggregates with one final,
    /// threshold-bypassing submit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if !self.shared.config.is_enabled() {
            return;
        }
        // Holding every permit proves no transport call is in flight. The
        // permits are released again before the flush, which needs them.
        match tokio::time::timeout(
            SHUTDOWN_DRAIN_TIMEOUT,
            self.shared.workers.acquire_many(WORKER_PERMITS as u32),
        )
        .await
        {
            Ok(Ok(_permit)) => {}
            Ok(Err(_)) | Err(_) => {
                tracing::warn!("worker drain timed out, flushing over possibly busy transport");
            }
        }
        if self.shared.aggregator.pending_samples() == 0 {
            return;
        }
        tracing::info!(
            pending = self.shared.aggregator.pending_samples(),
            "flushing pending aggregates before shutdown"
        );
        let shared = Arc::clone(&self.shared);
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, submit_cycle(&shared, true))
            .await
            .is_err()
        {
            tracing::warn!("shutdown flush timed out, discarding pending aggregates");
        }
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

async fn run_scheduler(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = &shared.config;
    tracing::info!(
        server_id = shared.transport.server_id(),
        submit_interval_secs = config.submit_interval_secs,
        download_interval_secs = config.download_interval_secs,
        "sync scheduler starting"
    );

    let bootstrap_download = tokio::time::sleep(Duration::from_secs(config.bootstrap_download_delay_secs));
    let bootstrap_upload = tokio::time::sleep(Duration::from_secs(config.bootstrap_upload_delay_secs));
    tokio::pin!(bootstrap_download, bootstrap_upload);
    let mut download_bootstrapped = false;
    let mut upload_bootstrapped = false;

    let mut submit_tick = periodic(config.submit_interval_secs);
    let mut download_tick = periodic(config.download_interval_secs);
    let mut heartbeat_tick = periodic(config.heartbeat_interval_secs);

    // Cycle bodies run inline so no two cycles ever overlap; a tick that
    // lands during a slow cycle is simply skipped. The worker pool bounds
    // only the collector calls inside a cycle.
    loop {
        tokio::select! {
            _ = &mut bootstrap_download, if !download_bootstrapped => {
                download_bootstrapped = true;
                tracing::debug!("bootstrap download");
                download_cycle(&shared).await;
                if upload_bootstrapped {
                    shared.set_state(SyncState::Active);
                }
            }
            _ = &mut bootstrap_upload, if !upload_bootstrapped => {
                upload_bootstrapped = true;
                tracing::debug!("bootstrap upload");
                submit_cycle(&shared, true).await;
                if download_bootstrapped {
                    shared.set_state(SyncState::Active);
                }
            }
            _ = submit_tick.tick() => submit_cycle(&shared, false).await,
            _ = download_tick.tick() => download_cycle(&shared).await,
            _ = heartbeat_tick.tick() => heartbeat_cycle(&shared).await,
            _ = shutdown_rx.changed() => {
                tracing::info!("sync scheduler stopping");
                break;
            }
        }
    }
}

/// Interval whose first tick fires one full period from now, skipping missed
/// ticks rather than bursting after a stall.
fn periodic(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Upload ready aggregates, one bundle per agent type. Bundles go out through
/// the worker pool, so at most [`WORKER_PERMITS`] uploads are in flight; the
/// cycle itself returns only after every upload settled.
///
/// `force` bypasses the sample and interval thresholds (bootstrap upload and
/// shutdown flush) but never the two-distinct-tactics floor: a single-tactic
/// bundle carries no preference signal the collector could use.
async fn submit_cycle(shared: &Arc<Shared>, force: bool) {
    let config = &shared.config;
    if !force
        && !shared.aggregator.is_ready_to_submit(
            config.min_samples,
            Duration::from_secs(config.submit_interval_secs),
        )
    {
        return;
    }

    let server_id = shared.transport.server_id().to_owned();
    let mut uploads = tokio::task::JoinSet::new();
    for (agent_type, aggregates) in shared.aggregator.snapshot_for_upload() {
        if aggregates.len() < 2 {
            tracing::debug!(%agent_type, "fewer than two tactics aggregated, holding back");
            continue;
        }
        let shared = Arc::clone(shared);
        let server_id = server_id.clone();
        uploads.spawn(async move {
            let _permit = shared.workers.acquire().await.expect("worker pool closed");
            let request = SubmitRequest::from_aggregates(&server_id, &agent_type, &aggregates);
            match shared.transport.submit_model(&request).await {
                Ok(()) => {
                    shared.stats.submits_ok.fetch_add(1, Ordering::Relaxed);
                    shared.stats.last_submit_epoch_ms.store(
                        Utc::now().timestamp_millis().max(0) as u64,
                        Ordering::Relaxed,
                    );
                    tracing::info!(%agent_type, tactics = aggregates.len(), "submitted local aggregates");
                    shared.aggregator.remove_confirmed(
                        aggregates
                            .iter()
                            .map(|aggregate| (agent_type.as_str(), aggregate.tactic.as_str())),
                    );
                }
                Err(error) if !error.is_retryable() => {
                    // The collector will never accept this payload; drop it so
                    // it cannot wedge every future cycle.
                    shared.stats.submits_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%agent_type, %error, "collector rejected submission, discarding batch");
                    shared.aggregator.remove_confirmed(
                        aggregates
                            .iter()
                            .map(|aggregate| (agent_type.as_str(), aggregate.tactic.as_str())),
                    );
                }
                Err(error) => {
                    shared.stats.submits_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%agent_type, %error, "submit failed, keeping aggregates for next cycle");
                }
            }
        });
    }
    while uploads.join_next().await.is_some() {}
}

/// Fetch the global pool, validate it, merge what survives, then prune.
async fn download_cycle(shared: &Shared) {
    let result = {
        let _permit = shared.workers.acquire().await.expect("worker pool closed");
        shared.transport.download_global_pool().await
    };
    let snapshot = match result {
        Ok(Some(snapshot)) => {
            shared.stats.last_download_epoch_ms.store(
                Utc::now().timestamp_millis().max(0) as u64,
                Ordering::Relaxed,
            );
            snapshot
        }
        Ok(None) => {
            shared.stats.last_download_epoch_ms.store(
                Utc::now().timestamp_millis().max(0) as u64,
                Ordering::Relaxed,
            );
            shared.stats.downloads_empty.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("collector has no global pool yet");
            return;
        }
        Err(error) => {
            shared.stats.downloads_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%error, "download failed");
            return;
        }
    };

    let validated = validate_snapshot(snapshot);
    let applied = shared.store.apply_download(&validated);
    if applied == 0 {
        shared.stats.downloads_empty.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("downloaded snapshot had no valid records");
        return;
    }
    shared.stats.downloads_ok.fetch_add(1, Ordering::Relaxed);
    shared
        .stats
        .records_applied
        .fetch_add(applied as u64, Ordering::Relaxed);

    // A misconfigured rate must degrade, not panic the cycle.
    let rate = shared.config.prune.exploration_rate;
    let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
    let mut rng = rand::thread_rng();
    let explore = rng.gen_bool(rate);
    let (_, resurrected) =
        shared
            .store
            .prune_and_explore(&validated, &shared.config.prune, explore, &mut rng);
    if resurrected > 0 {
        tracing::info!(resurrected, "exploration pass resurrected pruned tactics");
    }
}

/// Tell the collector we are alive and which agent types we have observed,
/// then piggyback pending work: a submit if aggregates are ready (the gate
/// makes this free otherwise, and a submit that just ran stamps the interval
/// gate closed), and a download while the pool is still empty so a
/// participant that came up between download ticks catches up sooner.
async fn heartbeat_cycle(shared: &Arc<Shared>) {
    let observed = shared.aggregator.observed_agent_types();
    let result = {
        let _permit = shared.workers.acquire().await.expect("worker pool closed");
        shared.transport.send_heartbeat(&observed).await
    };
    match result {
        Ok(()) => {
            shared.stats.heartbeats_ok.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            shared.stats.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%error, "heartbeat failed");
        }
    }
    submit_cycle(shared, false).await;
    if shared.store.tactic_count() == 0 {
        download_cycle(shared).await;
    }
}

//! Wire model and remote transport.
//!
//! The collector speaks JSON over HTTP. The core only depends on the
//! [`RemoteTransport`] trait, so tests (and alternative transports) plug in
//! without touching the coordinator. Responses are tolerated in two shapes
//! per agent type, an array of tactic records or a map keyed by action id,
//! and normalized to the map form before validation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::time::Duration;

use crate::aggregate::LocalAggregate;

/// Transport failure taxonomy.
///
/// `Transient` failures are retried with bounded backoff and then deferred to
/// the next cycle; `Rejected` (4xx-class) failures are never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient network failure: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("rejected by collector (status {status})")]
    Rejected { status: u16 },
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One tactic record as it appears on the wire.
///
/// Counts are signed on purpose: a malicious participant can send negatives,
/// and the validator needs to see them to reject the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct WireTacticRecord {
    pub action: String,
    pub avg_reward: f64,
    pub sample_count: i64,
    pub success_count: i64,
    pub success_rate: f64,
    /// Epoch milliseconds of the last update on the collector.
    pub last_updated: i64,
}

/// Per-agent-type tactic table, in either wire shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TacticTable {
    Records(Vec<WireTacticRecord>),
    Keyed(HashMap<String, WireTacticRecord>),
}

impl TacticTable {
    /// Flatten to the internal id → record form. For the array shape the
    /// record's own action id becomes the key; for the map shape the key wins
    /// over a mismatched embedded action id.
    pub fn normalize(self) -> HashMap<String, WireTacticRecord> {
        match self {
            Self::Records(records) => records
                .into_iter()
                .map(|record| (record.action.clone(), record))
                .collect(),
            Self::Keyed(map) => map,
        }
    }
}

/// One agent type's entry in a downloaded snapshot, pre-validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireAgentEntry {
    pub tactics: Option<TacticTable>,
    #[serde(default)]
    pub submissions: Option<i64>,
}

/// Full global pool snapshot as downloaded from the collector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolSnapshot {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub agents: HashMap<String, WireAgentEntry>,
}

/// Upload payload: one full per-agent-type bundle. The collector accepts at
/// most one contribution per (participant, agent type) per round, so single
/// tactic payloads would waste round slots.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SubmitRequest {
    pub server_id: String,
    pub agent_type: String,
    pub tactics: HashMap<String, WireTacticRecord>,
}

impl SubmitRequest {
    /// Build the bundle for one agent type from local aggregates.
    pub fn from_aggregates(server_id: &str, agent_type: &str, aggregates: &[LocalAggregate]) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let tactics = aggregates
            .iter()
            .map(|aggregate| {
                (
                    aggregate.tactic.clone(),
                    WireTacticRecord {
                        action: aggregate.tactic.clone(),
                        avg_reward: aggregate.average_reward(),
                        sample_count: i64::from(aggregate.sample_count),
                        success_count: i64::from(aggregate.success_count),
                        success_rate: aggregate.success_rate(),
                        last_updated: now,
                    },
                )
            })
            .collect();
        Self {
            server_id: server_id.to_owned(),
            agent_type: agent_type.to_owned(),
            tactics,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
struct HeartbeatRequest<'a> {
    server_id: &'a str,
    agent_types: &'a [String],
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstract collector transport.
///
/// One `submit_model` call per agent type per submit cycle; `download` returns
/// `None` when the collector has nothing yet.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Stable participant identity included in every payload.
    fn server_id(&self) -> &str;

    async fn submit_model(&self, request: &SubmitRequest) -> Result<(), TransportError>;

    async fn download_global_pool(&self) -> Result<Option<PoolSnapshot>, TransportError>;

    async fn send_heartbeat(&self, observed_agent_types: &[String]) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Retry schedule for transient failures: bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Backoff before the given retry (0-based): `base * 2^attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt)
    }
}

/// Collector client over HTTP/JSON.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    server_id: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        let endpoint = if endpoint.ends_with('/') {
            endpoint.to_owned()
        } else {
            format!("{endpoint}/")
        };
        let server_id = generate_server_id();
        tracing::info!(%endpoint, %server_id, "collector transport initialized");
        Ok(Self {
            client,
            endpoint,
            server_id,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    /// Run a request closure with the retry policy. Rejections are returned
    /// immediately; transient failures back off and retry up to the cap.
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(operation, attempt, ?delay, %error, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        check_status(response)
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_client_error() {
        return Err(TransportError::Rejected {
            status: status.as_u16(),
        });
    }
    match response.error_for_status() {
        Ok(response) => Ok(response),
        Err(error) => Err(TransportError::Transient(error)),
    }
}

fn generate_server_id() -> String {
    format!("tn-{:016x}", rand::random::<u64>())
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    /// Anonymous per-process participant id, used by the collector for
    /// per-round contribution dedup. Deliberately not persisted.
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn submit_model(&self, request: &SubmitRequest) -> Result<(), TransportError> {
        self.with_retries("submit", || async move {
            self.post_json("api/upload", request).await.map(|_| ())
        })
        .await
    }

    async fn download_global_pool(&self) -> Result<Option<PoolSnapshot>, TransportError> {
        self.with_retries("download", || async move {
            let response = self.client.get(self.url("api/download")).send().await?;
            let response = check_status(response)?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let snapshot: PoolSnapshot = response.json().await?;
            Ok(Some(snapshot))
        })
        .await
    }

    async fn send_heartbeat(&self, observed_agent_types: &[String]) -> Result<(), TransportError> {
        let body = HeartbeatRequest {
            server_id: &self.server_id,
            agent_types: observed_agent_types,
        };
        let body = &body;
        self.with_retries("heartbeat", || async move {
            self.post_json("api/heartbeat", body).await.map(|_| ())
        })
        .await
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str, reward: f64) -> WireTacticRecord {
        WireTacticRecord {
            action: action.to_owned(),
            avg_reward: reward,
            sample_count: 4,
            success_count: 2,
            success_rate: 0.5,
            last_updated: 0,
        }
    }

    #[test]
    fn array_shape_normalizes_to_map() {
        let json = r#"[
            {"action": "rush_player", "avg_reward": 2.0, "sample_count": 4,
             "success_count": 2, "success_rate": 0.5, "last_updated": 0},
            {"action": "circle_strafe", "avg_reward": 1.5, "sample_count": 2,
             "success_count": 1, "success_rate": 0.5, "last_updated": 0}
        ]"#;
        let table: TacticTable = serde_json::from_str(json).unwrap();
        let normalized = table.normalize();
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized["rush_player"].avg_reward, 2.0);
    }

    #[test]
    fn map_shape_normalizes_to_map() {
        let json = r#"{
            "rush_player": {"action": "rush_player", "avg_reward": 2.0,
             "sample_count": 4, "success_count": 2, "success_rate": 0.5,
             "last_updated": 0}
        }"#;
        let table: TacticTable = serde_json::from_str(json).unwrap();
        let normalized = table.normalize();
        assert_eq!(normalized.len(), 1);
        assert!(normalized.contains_key("rush_player"));
    }

    #[test]
    fn snapshot_decodes_missing_tactics_as_none() {
        let json = r#"{"agents": {"zombie": {"submissions": 3}}}"#;
        let snapshot: PoolSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.agents["zombie"].tactics.is_none());
    }

    #[test]
    fn submit_request_bundles_all_tactics_of_a_type() {
        let aggregates = vec![
            crate::aggregate::LocalAggregate {
                agent_type: "zombie".into(),
                tactic: "rush_player".into(),
                total_reward: 10.0,
                success_count: 2,
                failure_count: 0,
                sample_count: 2,
            },
            crate::aggregate::LocalAggregate {
                agent_type: "zombie".into(),
                tactic: "circle_strafe".into(),
                total_reward: 3.0,
                success_count: 1,
                failure_count: 2,
                sample_count: 3,
            },
        ];
        let request = SubmitRequest::from_aggregates("tn-test", "zombie", &aggregates);
        assert_eq!(request.tactics.len(), 2);
        assert!((request.tactics["rush_player"].avg_reward - 5.0).abs() < f64::EPSILON);
        assert!((request.tactics["circle_strafe"].success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            base: Duration::from_secs(1),
            max_attempts: 3,
        };
        assert_eq!(retry.backoff(0), Duration::from_secs(1));
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn serialized_record_uses_snake_case_fields() {
        let json = serde_json::to_value(record("rush_player", 2.0)).unwrap();
        assert!(json.get("avg_reward").is_some());
        assert!(json.get("sample_count").is_some());
    }
}

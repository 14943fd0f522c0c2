//! Append-only log line storage keyed by run id.
//!
//! The durable backend is Loki behind its HTTP push/query API; tests and
//! single-node deployments use the in-memory store. Both speak the same
//! [`LogStore`] contract: at-least-once appends (a retried batch may land
//! twice) and timestamp-ordered reads bounded at [`QUERY_LIMIT`] lines.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Value for the constant `job` label on every pushed stream.
const JOB_LABEL: &str = "spool";

/// Upper bound on lines returned by a single query.
pub const QUERY_LIMIT: usize = 10_000;

/// Which file descriptor a captured line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineLevel {
    Stdout,
    Stderr,
}

impl LineLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineLevel::Stdout => "stdout",
            LineLevel::Stderr => "stderr",
        }
    }
}

/// One captured log line. Timestamps are client-supplied wall-clock values
/// and are never rewritten by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LineLevel,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log store transport error: {0}")]
    Transport(String),
    #[error("log store rejected request: status={status}, body={body}")]
    Rejected { status: u16, body: String },
    #[error("malformed log store response: {0}")]
    Malformed(String),
}

/// Contract for the durable line store.
///
/// `append` is at-least-once: callers retry transient failures, so a batch
/// may be written more than once and readers must tolerate duplicates.
/// Lines for a given run are never rewritten.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(
        &self,
        run_id: Uuid,
        user_id: Uuid,
        project: &str,
        lines: &[LineRecord],
    ) -> Result<(), LogStoreError>;

    /// All lines for a run, ascending by timestamp, at most [`QUERY_LIMIT`].
    async fn query(&self, run_id: Uuid) -> Result<Vec<LineRecord>, LogStoreError>;
}

/// Loki HTTP client implementing the [`LogStore`] contract.
///
/// Labels follow the four-label strategy: `{job, user_id, run_id, project}`.
/// The level is folded into the line text as a `[stdout] ` / `[stderr] `
/// prefix so the label set stays small.
pub struct LokiLogStore {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Serialize)]
struct PushStream {
    stream: HashMap<String, String>,
    values: Vec<[String; 2]>,
}

#[derive(Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Deserialize)]
struct QueryData {
    result: Vec<QueryStream>,
}

#[derive(Deserialize)]
struct QueryStream {
    values: Vec<[String; 2]>,
}

impl LokiLogStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LogStoreError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| LogStoreError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl LogStore for LokiLogStore {
    async fn append(
        &self,
        run_id: Uuid,
        user_id: Uuid,
        project: &str,
        lines: &[LineRecord],
    ) -> Result<(), LogStoreError> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut labels = HashMap::new();
        labels.insert("job".to_string(), JOB_LABEL.to_string());
        labels.insert("user_id".to_string(), user_id.to_string());
        labels.insert("run_id".to_string(), run_id.to_string());
        labels.insert("project".to_string(), project.to_string());

        let values = lines
            .iter()
            .map(|line| {
                [
                    line.timestamp
                        .timestamp_nanos_opt()
                        .unwrap_or_default()
                        .to_string(),
                    encode_line(line),
                ]
            })
            .collect();

        let body = PushRequest {
            streams: vec![PushStream {
                stream: labels,
                values,
            }],
        };

        let response = self
            .http
            .post(format!("{}/loki/api/v1/push", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| LogStoreError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LogStoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn query(&self, run_id: Uuid) -> Result<Vec<LineRecord>, LogStoreError> {
        let selector = format!("{{run_id=\"{run_id}\"}}");
        let response = self
            .http
            .get(format!("{}/loki/api/v1/query_range", self.base_url))
            .query(&[
                ("query", selector.as_str()),
                ("direction", "forward"),
                ("limit", "10000"),
            ])
            .send()
            .await
            .map_err(|err| LogStoreError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LogStoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|err| LogStoreError::Malformed(err.to_string()))?;

        let mut lines = Vec::new();
        for stream in parsed.data.result {
            for [timestamp_ns, text] in stream.values {
                let nanos: i64 = timestamp_ns.parse().map_err(|_| {
                    LogStoreError::Malformed(format!("bad timestamp '{timestamp_ns}'"))
                })?;
                let (level, content) = decode_line(&text);
                lines.push(LineRecord {
                    timestamp: Utc.timestamp_nanos(nanos),
                    level,
                    content: content.to_string(),
                });
            }
        }

        lines.sort_by_key(|line| line.timestamp);
        lines.truncate(QUERY_LIMIT);
        Ok(lines)
    }
}

/// In-memory [`LogStore`] used by tests and single-node setups.
#[derive(Default)]
pub struct MemoryLogStore {
    lines: RwLock<HashMap<Uuid, Vec<LineRecord>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(
        &self,
        run_id: Uuid,
        _user_id: Uuid,
        _project: &str,
        lines: &[LineRecord],
    ) -> Result<(), LogStoreError> {
        self.lines
            .write()
            .entry(run_id)
            .or_default()
            .extend_from_slice(lines);
        Ok(())
    }

    async fn query(&self, run_id: Uuid) -> Result<Vec<LineRecord>, LogStoreError> {
        let mut lines = self
            .lines
            .read()
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        // Stable: equal timestamps keep arrival order.
        lines.sort_by_key(|line| line.timestamp);
        lines.truncate(QUERY_LIMIT);
        Ok(lines)
    }
}

fn encode_line(line: &LineRecord) -> String {
    format!("[{}] {}", line.level.as_str(), line.content)
}

fn decode_line(text: &str) -> (LineLevel, &str) {
    if let Some(rest) = text.strip_prefix("[stdout] ") {
        (LineLevel::Stdout, rest)
    } else if let Some(rest) = text.strip_prefix("[stderr] ") {
        (LineLevel::Stderr, rest)
    } else {
        (LineLevel::Stdout, text)
    }
}

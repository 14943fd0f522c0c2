//! The ingestion protocol engine.
//!
//! One engine invocation serves one client stream: authenticate, materialize
//! the run from the leading metadata frame, batch lines into the log store
//! while republishing them live, and drive the run to a terminal state when
//! the stream ends. The engine talks channels, not sockets; the daemon owns
//! the WebSocket adaptation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use spool_db::{AiStatus, Database, RunRecord, RunStatus};

use crate::bus::{AnalysisTask, BusEvent, EventBus};
use crate::logstore::{LineLevel, LineRecord, LogStore};

/// Project or group name used when the client leaves the field empty.
const DEFAULT_NAME: &str = "default";

/// Pause between append retries inside one batch window.
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client-to-server frames. The first frame on every stream must be
/// `Metadata`; `Completion` terminates the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Metadata {
        #[serde(default)]
        project_name: Option<String>,
        #[serde(default)]
        group_name: Option<String>,
    },
    Line {
        timestamp: DateTime<Utc>,
        level: LineLevel,
        content: String,
    },
    Completion {
        exit_code: i32,
    },
}

/// Server-to-client frames. `Started` is always the first reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Started { run_id: Uuid },
    Error { message: String },
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `Completion` frame was honored and the run finalized by exit code.
    Completed { run_id: Uuid, exit_code: i32 },
    /// Transport loss, protocol violation after open, or dropped lines.
    Aborted { run_id: Uuid },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Lines buffered before a flush is forced.
    pub batch_size: usize,
    /// Longest a buffered line may wait before a flush.
    pub batch_interval: Duration,
    /// Append attempts per batch before the batch is dropped.
    pub flush_attempts: u32,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_secs(1),
            flush_attempts: 3,
        }
    }
}

/// The protocol engine. Cheap to clone per stream via `Arc`.
pub struct Ingestor {
    db: Database,
    logs: Arc<dyn LogStore>,
    bus: Arc<dyn EventBus>,
    config: IngestorConfig,
}

impl Ingestor {
    pub fn new(
        db: Database,
        logs: Arc<dyn LogStore>,
        bus: Arc<dyn EventBus>,
        config: IngestorConfig,
    ) -> Self {
        Self {
            db,
            logs,
            bus,
            config,
        }
    }

    /// Serves one client stream to completion.
    ///
    /// Reply-channel send failures are treated as client disconnects. The
    /// run, once created, always reaches a terminal state before return.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run_stream(
        &self,
        token: &str,
        mut frames: mpsc::Receiver<Frame>,
        replies: mpsc::Sender<Reply>,
    ) -> Result<StreamOutcome, IngestError> {
        let user_id = match self.db.authenticate_token(token).await {
            Ok(user_id) => user_id,
            Err(_) => {
                let _ = replies
                    .send(Reply::Error {
                        message: "authentication required".into(),
                    })
                    .await;
                return Err(IngestError::Unauthenticated);
            }
        };

        let (project_name, group_name) = match frames.recv().await {
            Some(Frame::Metadata {
                project_name,
                group_name,
            }) => (
                non_empty_or_default(project_name),
                non_empty_or_default(group_name),
            ),
            Some(_) => {
                let message = "first frame must be metadata";
                let _ = replies
                    .send(Reply::Error {
                        message: message.into(),
                    })
                    .await;
                return Err(IngestError::Protocol(message.into()));
            }
            None => {
                return Err(IngestError::Protocol(
                    "stream closed before metadata".into(),
                ))
            }
        };

        let project = self
            .db
            .get_or_create_project(user_id, &project_name)
            .await
            .map_err(IngestError::Internal)?;
        let group = self
            .db
            .get_or_create_group(project.id, &group_name)
            .await
            .map_err(IngestError::Internal)?;

        // Settings decide whether the run is born queued for analysis.
        // A resolution failure degrades to "no analysis", never to a refusal.
        let auto_analyze = match self
            .db
            .resolve_effective_settings(user_id, project.id)
            .await
        {
            Ok(settings) => settings.ai_enabled && settings.ai_auto_analyze,
            Err(err) => {
                warn!(%user_id, project_id = %project.id, error = %err,
                    "settings resolution failed; starting run without analysis");
                false
            }
        };
        let initial_ai_status = if auto_analyze {
            AiStatus::Pending
        } else {
            AiStatus::None
        };

        let run = self
            .db
            .create_run(group.id, initial_ai_status)
            .await
            .map_err(IngestError::Internal)?;
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        info!(%user_id, project = %project.name, group = %group.name, "run started");

        if replies.send(Reply::Started { run_id: run.id }).await.is_err() {
            // Client vanished between auth and the first reply.
            self.abort_run(&run).await;
            return Ok(StreamOutcome::Aborted { run_id: run.id });
        }

        self.stream_lines(&run, user_id, &project.name, frames, replies)
            .await
    }

    async fn stream_lines(
        &self,
        run: &RunRecord,
        user_id: Uuid,
        project_name: &str,
        mut frames: mpsc::Receiver<Frame>,
        replies: mpsc::Sender<Reply>,
    ) -> Result<StreamOutcome, IngestError> {
        let mut batch: Vec<LineRecord> = Vec::with_capacity(self.config.batch_size);
        let mut lines_lost = false;
        let start = tokio::time::Instant::now() + self.config.batch_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.batch_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush(run.id, user_id, project_name, &mut batch, &mut lines_lost)
                        .await;
                }
                frame = frames.recv() => match frame {
                    Some(Frame::Line { timestamp, level, content }) => {
                        let line = LineRecord { timestamp, level, content };
                        // Live subscribers see the line ahead of the batch write.
                        if let Err(err) = self.bus.publish_event(&BusEvent::log(run.id, &line)).await {
                            warn!(run_id = %run.id, error = %err, "live publish failed");
                        }
                        batch.push(line);
                        if batch.len() >= self.config.batch_size {
                            self.flush(run.id, user_id, project_name, &mut batch, &mut lines_lost)
                                .await;
                        }
                    }
                    Some(Frame::Completion { exit_code }) => {
                        self.flush(run.id, user_id, project_name, &mut batch, &mut lines_lost)
                            .await;
                        return self
                            .complete_run(run, user_id, exit_code, lines_lost, &replies)
                            .await;
                    }
                    Some(Frame::Metadata { .. }) => {
                        let _ = replies
                            .send(Reply::Error { message: "unexpected metadata frame".into() })
                            .await;
                        self.flush(run.id, user_id, project_name, &mut batch, &mut lines_lost)
                            .await;
                        self.abort_run(run).await;
                        return Err(IngestError::Protocol("unexpected metadata frame".into()));
                    }
                    // Transport closed without a completion frame.
                    None => {
                        self.flush(run.id, user_id, project_name, &mut batch, &mut lines_lost)
                            .await;
                        self.abort_run(run).await;
                        return Ok(StreamOutcome::Aborted { run_id: run.id });
                    }
                }
            }
        }
    }

    async fn complete_run(
        &self,
        run: &RunRecord,
        user_id: Uuid,
        exit_code: i32,
        lines_lost: bool,
        replies: &mpsc::Sender<Reply>,
    ) -> Result<StreamOutcome, IngestError> {
        if !(-128..=255).contains(&exit_code) {
            let message = format!("exit code {exit_code} outside -128..=255");
            let _ = replies
                .send(Reply::Error {
                    message: message.clone(),
                })
                .await;
            self.abort_run(run).await;
            return Err(IngestError::Protocol(message));
        }

        // A run whose log is known-incomplete must not read as completed.
        if lines_lost {
            warn!(run_id = %run.id, "lines dropped during stream; finalizing as aborted");
            self.abort_run(run).await;
            return Ok(StreamOutcome::Aborted { run_id: run.id });
        }

        let status = if exit_code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        match self.db.finalize_run(run.id, status, Some(exit_code)).await {
            Ok(finalized) => {
                info!(run_id = %run.id, status = %finalized.status, exit_code, "run finalized");
                self.publish_status(run.id, finalized.status, finalized.exit_code)
                    .await;
            }
            Err(err) => {
                error!(run_id = %run.id, error = %err, "run finalization failed");
                return Err(IngestError::Internal(err));
            }
        }

        if run.ai_status == AiStatus::Pending {
            let task = AnalysisTask {
                run_id: run.id,
                user_id,
                enqueued_at: Utc::now(),
            };
            if let Err(err) = self.bus.enqueue_task(&task).await {
                warn!(run_id = %run.id, error = %err, "failed to enqueue analysis task");
            }
        }

        Ok(StreamOutcome::Completed {
            run_id: run.id,
            exit_code,
        })
    }

    /// Best-effort transition to `aborted`; a run that already reached a
    /// terminal state keeps it.
    async fn abort_run(&self, run: &RunRecord) {
        match self.db.finalize_run(run.id, RunStatus::Aborted, None).await {
            Ok(finalized) => {
                info!(run_id = %run.id, "run aborted");
                self.publish_status(run.id, finalized.status, None).await;
            }
            Err(err) => error!(run_id = %run.id, error = %err, "abort finalization failed"),
        }
    }

    async fn publish_status(&self, run_id: Uuid, status: RunStatus, exit_code: Option<i32>) {
        let event = BusEvent::status_change(run_id, status, exit_code);
        if let Err(err) = self.bus.publish_event(&event).await {
            warn!(%run_id, error = %err, "run update publish failed");
        }
    }

    /// Writes the buffered batch, retrying transient failures within the
    /// batch window. Exhausted retries drop the batch and poison the stream:
    /// the run will finalize as `aborted`.
    async fn flush(
        &self,
        run_id: Uuid,
        user_id: Uuid,
        project_name: &str,
        batch: &mut Vec<LineRecord>,
        lines_lost: &mut bool,
    ) {
        if batch.is_empty() {
            return;
        }

        for attempt in 1..=self.config.flush_attempts {
            match self.logs.append(run_id, user_id, project_name, batch).await {
                Ok(()) => {
                    batch.clear();
                    return;
                }
                Err(err) if attempt < self.config.flush_attempts => {
                    warn!(%run_id, attempt, error = %err, "batch append failed; retrying");
                    tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!(%run_id, dropped = batch.len(), error = %err,
                        "batch append failed after retries; dropping batch");
                    *lines_lost = true;
                    batch.clear();
                }
            }
        }
    }
}

fn non_empty_or_default(value: Option<String>) -> String {
    match value {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_deserialize_from_tagged_json() {
        let metadata: Frame =
            serde_json::from_str(r#"{"type":"metadata","project_name":"myapp"}"#).unwrap();
        assert_eq!(
            metadata,
            Frame::Metadata {
                project_name: Some("myapp".into()),
                group_name: None,
            }
        );

        let completion: Frame =
            serde_json::from_str(r#"{"type":"completion","exit_code":2}"#).unwrap();
        assert_eq!(completion, Frame::Completion { exit_code: 2 });

        let line: Frame = serde_json::from_str(
            r#"{"type":"line","timestamp":"2025-01-01T00:00:00Z","level":"stderr","content":"x"}"#,
        )
        .unwrap();
        assert!(matches!(line, Frame::Line { level: LineLevel::Stderr, .. }));
    }

    #[test]
    fn replies_serialize_with_type_tags() {
        let run_id = Uuid::new_v4();
        let started = serde_json::to_value(Reply::Started { run_id }).unwrap();
        assert_eq!(started["type"], "started");
        assert_eq!(started["run_id"], run_id.to_string());

        let error = serde_json::to_value(Reply::Error {
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(error["type"], "error");
    }

    #[test]
    fn empty_names_fall_back_to_default() {
        assert_eq!(non_empty_or_default(None), "default");
        assert_eq!(non_empty_or_default(Some(String::new())), "default");
        assert_eq!(non_empty_or_default(Some("build".into())), "build");
    }
}

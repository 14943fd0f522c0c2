//! The worker pool draining the analysis queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spool_db::{AiStatus, Database, EffectiveSettings};
use spool_stream::{
    AnalysisResult, AnalysisStatus, AnalysisTask, BusEvent, EventBus, LogStore,
};

use crate::model::{CompletionRequest, ModelClient};
use crate::prompt::build_prompt;
use crate::truncate::truncate_lines;

/// Hard cap on the worker pool, matching the settings bound.
const MAX_WORKERS: usize = 10;

/// Pause before retrying after a queue transport error, and before
/// re-offering a task deferred by per-user admission.
const BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Worker count; clamped to `1..=10`.
    pub workers: usize,
    /// Blocking-poll window on the task queue.
    pub poll_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
enum AnalysisFailure {
    #[error("run not found")]
    RunNotFound,
    #[error("metadata lookup failed: {0}")]
    Lookup(String),
    #[error("AI analysis is disabled for this user")]
    Disabled,
    #[error("no AI API key configured")]
    MissingApiKey,
    #[error("no log lines found for run")]
    EmptyLog,
    #[error("failed to resolve settings: {0}")]
    Settings(String),
    #[error("failed to update status: {0}")]
    Status(String),
    #[error("failed to fetch logs: {0}")]
    Logs(String),
    #[error("AI analysis failed: {0}")]
    Model(String),
    #[error("failed to save report: {0}")]
    Persist(String),
}

/// The analysis job consumer. One instance drives the whole pool.
pub struct Analyzer {
    db: Database,
    logs: Arc<dyn LogStore>,
    bus: Arc<dyn EventBus>,
    model: Arc<dyn ModelClient>,
    config: AnalyzerConfig,
    in_flight: Mutex<HashMap<Uuid, u32>>,
}

impl Analyzer {
    pub fn new(
        db: Database,
        logs: Arc<dyn LogStore>,
        bus: Arc<dyn EventBus>,
        model: Arc<dyn ModelClient>,
        mut config: AnalyzerConfig,
    ) -> Arc<Self> {
        config.workers = config.workers.clamp(1, MAX_WORKERS);
        Arc::new(Self {
            db,
            logs,
            bus,
            model,
            config,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the pool. Workers exit when `shutdown` flips to true; the
    /// 5-second dequeue poll bounds how long that takes.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(workers = self.config.workers, "starting analyzer pool");
        (0..self.config.workers)
            .map(|worker| {
                let analyzer = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(analyzer.worker_loop(worker, shutdown))
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "analyzer worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                task = self.bus.dequeue_task(self.config.poll_timeout) => match task {
                    Ok(Some(task)) => self.process(&task).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(worker, error = %err, "task dequeue failed");
                        tokio::time::sleep(BACKOFF).await;
                    }
                }
            }
        }
        debug!(worker, "analyzer worker stopped");
    }

    #[instrument(skip(self, task), fields(run_id = %task.run_id))]
    async fn process(&self, task: &AnalysisTask) {
        match self.analyze(task).await {
            Ok(Deferred::Requeued) => {}
            Ok(Deferred::Done(report)) => {
                info!(run_id = %task.run_id, "analysis completed");
                self.publish_ai(task.run_id, AiStatus::Completed, Some(report))
                    .await;
                self.publish_result(
                    task.run_id,
                    AnalysisStatus::Completed,
                    "Analysis completed successfully",
                )
                .await;
            }
            Err(failure) => {
                warn!(run_id = %task.run_id, error = %failure, "analysis failed");
                let report = format!("Error: {failure}");
                if let Err(err) = self
                    .db
                    .set_ai_report(task.run_id, &report, AiStatus::Failed)
                    .await
                {
                    warn!(run_id = %task.run_id, error = %err, "could not persist failure report");
                }
                self.publish_ai(task.run_id, AiStatus::Failed, Some(report))
                    .await;
                self.publish_result(task.run_id, AnalysisStatus::Failed, &failure.to_string())
                    .await;
            }
        }
    }

    async fn analyze(&self, task: &AnalysisTask) -> Result<Deferred, AnalysisFailure> {
        let run = self
            .db
            .fetch_run(task.run_id)
            .await
            .map_err(|err| AnalysisFailure::Lookup(err.to_string()))?
            .ok_or(AnalysisFailure::RunNotFound)?;
        let context = self
            .db
            .run_context(task.run_id)
            .await
            .map_err(|err| AnalysisFailure::Lookup(err.to_string()))?
            .ok_or(AnalysisFailure::RunNotFound)?;

        let settings = self
            .db
            .resolve_effective_settings(context.user_id, context.project_id)
            .await
            .map_err(|err| AnalysisFailure::Settings(err.to_string()))?;

        if !settings.ai_enabled {
            return Err(AnalysisFailure::Disabled);
        }
        if settings.ai_api_key.is_empty() {
            return Err(AnalysisFailure::MissingApiKey);
        }

        // Per-user concurrency admission: at the limit, put the task back
        // instead of failing it.
        let Some(_guard) = self.try_admit(context.user_id, settings.ai_max_concurrent) else {
            debug!(run_id = %task.run_id, user_id = %context.user_id,
                "user at analysis concurrency limit; requeueing");
            if let Err(err) = self.bus.enqueue_task(task).await {
                warn!(run_id = %task.run_id, error = %err, "requeue failed");
            }
            tokio::time::sleep(BACKOFF).await;
            return Ok(Deferred::Requeued);
        };

        self.db
            .set_ai_status(task.run_id, AiStatus::Processing)
            .await
            .map_err(|err| AnalysisFailure::Status(err.to_string()))?;
        self.publish_ai(task.run_id, AiStatus::Processing, None).await;

        let lines = self
            .logs
            .query(task.run_id)
            .await
            .map_err(|err| AnalysisFailure::Logs(err.to_string()))?;
        if lines.is_empty() {
            return Err(AnalysisFailure::EmptyLog);
        }

        let rendered: Vec<String> = lines
            .iter()
            .map(|line| format!("[{}] {}", line.level.as_str(), line.content))
            .collect();
        let content = truncate_lines(
            &rendered,
            settings.ai_max_log_lines as usize,
            settings.ai_truncate_strategy,
        );
        let user_prompt = build_prompt(&content, run.exit_code.unwrap_or(0), run.status);

        let completion = self
            .model
            .complete(completion_request(&settings, &user_prompt))
            .await
            .map_err(|err| AnalysisFailure::Model(err.to_string()))?;

        debug!(run_id = %task.run_id, tokens_used = completion.tokens_used, "model call finished");

        self.db
            .set_ai_report(task.run_id, &completion.text, AiStatus::Completed)
            .await
            .map_err(|err| AnalysisFailure::Persist(err.to_string()))?;

        Ok(Deferred::Done(completion.text))
    }

    fn try_admit(&self, user_id: Uuid, limit: u32) -> Option<AdmissionGuard<'_>> {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.entry(user_id).or_insert(0);
        if *count >= limit {
            return None;
        }
        *count += 1;
        Some(AdmissionGuard {
            analyzer: self,
            user_id,
        })
    }

    async fn publish_ai(&self, run_id: Uuid, ai_status: AiStatus, report: Option<String>) {
        let event = BusEvent::ai_change(run_id, ai_status, report);
        if let Err(err) = self.bus.publish_event(&event).await {
            warn!(%run_id, error = %err, "ai status publish failed");
        }
    }

    async fn publish_result(&self, run_id: Uuid, status: AnalysisStatus, message: &str) {
        let result = AnalysisResult {
            run_id,
            status,
            message: message.to_string(),
        };
        if let Err(err) = self.bus.publish_result(&result).await {
            warn!(%run_id, error = %err, "result publish failed");
        }
    }
}

enum Deferred {
    Done(String),
    Requeued,
}

struct AdmissionGuard<'a> {
    analyzer: &'a Analyzer,
    user_id: Uuid,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.analyzer.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(&self.user_id);
            }
        }
    }
}

fn completion_request<'a>(
    settings: &'a EffectiveSettings,
    user_prompt: &'a str,
) -> CompletionRequest<'a> {
    CompletionRequest {
        base_url: &settings.ai_base_url,
        api_key: &settings.ai_api_key,
        model: &settings.ai_model,
        max_tokens: settings.ai_max_tokens,
        system_prompt: &settings.ai_system_prompt,
        user_prompt,
    }
}

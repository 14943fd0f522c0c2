//! Run lifecycle: creation at stream open, atomic finalization at stream
//! close, AI status bookkeeping and the ownership traversal used for
//! subscriber authorization.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, Row};
use uuid::Uuid;

use crate::{
    decode_datetime, decode_optional_datetime, decode_optional_i64, decode_optional_string,
    encode_datetime, encode_uuid, parse_uuid, Database, DatabaseDriver, StoreError,
};

/// Execution state of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(anyhow!("unknown run status: {}", other)),
        }
    }
}

/// Progress of the per-run analysis report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::None => "none",
            AiStatus::Pending => "pending",
            AiStatus::Processing => "processing",
            AiStatus::Completed => "completed",
            AiStatus::Failed => "failed",
        }
    }

    /// States a transition to `self` may start from. `None` and `Pending`
    /// are initial statuses assigned at run creation, never transition
    /// targets; re-analyze enters `Processing` directly from a finished
    /// state. `Failed` may additionally be entered straight from a queued
    /// state (analysis rejected before it started). `Completed` only ever
    /// follows `Processing`.
    fn valid_sources(&self) -> &'static [AiStatus] {
        match self {
            AiStatus::None => &[],
            AiStatus::Pending => &[],
            AiStatus::Processing => &[
                AiStatus::None,
                AiStatus::Pending,
                AiStatus::Completed,
                AiStatus::Failed,
            ],
            AiStatus::Completed => &[AiStatus::Processing],
            AiStatus::Failed => &[AiStatus::None, AiStatus::Pending, AiStatus::Processing],
        }
    }
}

impl fmt::Display for AiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(AiStatus::None),
            "pending" => Ok(AiStatus::Pending),
            "processing" => Ok(AiStatus::Processing),
            "completed" => Ok(AiStatus::Completed),
            "failed" => Ok(AiStatus::Failed),
            other => Err(anyhow!("unknown ai status: {}", other)),
        }
    }
}

/// Persisted run row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub ai_status: AiStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_report: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Ownership traversal result: the chain from a run up to its user, resolved
/// in one query. Drives fan-out authorization and analyzer settings lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub group_id: Uuid,
    pub project_id: Uuid,
    pub project_name: String,
    pub user_id: Uuid,
}

/// Aggregate counts across all runs, by status and by AI status.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusStatistics {
    pub running_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub aborted_count: i64,
    pub ai_pending_count: i64,
    pub ai_processing_count: i64,
    pub ai_completed_count: i64,
    pub ai_failed_count: i64,
}

impl Database {
    /// Creates a run in the `running` state with `start_time = now`.
    pub async fn create_run(&self, group_id: Uuid, initial_ai_status: AiStatus) -> Result<RunRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO runs (id, group_id, start_time, status, ai_status, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO runs (id, group_id, start_time, status, ai_status, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(group_id))
            .bind(encode_datetime(now))
            .bind(RunStatus::Running.as_str())
            .bind(initial_ai_status.as_str())
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await?;

        self.fetch_run(id)
            .await?
            .ok_or_else(|| anyhow!("run inserted but missing when reloaded ({id})"))
    }

    pub async fn fetch_run(&self, id: Uuid) -> Result<Option<RunRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM runs WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM runs WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_run).transpose()
    }

    /// Moves a run from `running` to a terminal state, setting `end_time`.
    /// The update is conditional on the current state, so a run that already
    /// reached a terminal state is never rewritten.
    pub async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        exit_code: Option<i32>,
    ) -> Result<RunRecord> {
        validate_terminal(id, status, exit_code)?;

        let now = Utc::now();
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE runs SET status = ?, exit_code = ?, end_time = ?, updated_at = ? \
                 WHERE id = ? AND status = 'running'"
            }
            DatabaseDriver::Postgres => {
                "UPDATE runs SET status = $1, exit_code = $2, end_time = $3, updated_at = $4 \
                 WHERE id = $5 AND status = 'running'"
            }
        };
        let result = sqlx::query(update)
            .bind(status.as_str())
            .bind(exit_code)
            .bind(encode_datetime(now))
            .bind(encode_datetime(now))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match self.fetch_run(id).await? {
                Some(_) => Err(anyhow!(StoreError::RunNotActive(id))),
                None => Err(anyhow!(StoreError::RunNotFound(id))),
            };
        }

        self.fetch_run(id)
            .await?
            .ok_or_else(|| anyhow!("run finalized but missing when reloaded ({id})"))
    }

    /// Advances the AI status, rejecting transitions outside the
    /// `{none,pending} -> processing -> {completed,failed}` progression
    /// (re-analyze re-enters from the finished states).
    pub async fn set_ai_status(&self, id: Uuid, ai_status: AiStatus) -> Result<RunRecord> {
        self.advance_ai(id, ai_status, None).await
    }

    /// Stores the analysis report together with its final status.
    pub async fn set_ai_report(
        &self,
        id: Uuid,
        report: &str,
        ai_status: AiStatus,
    ) -> Result<RunRecord> {
        self.advance_ai(id, ai_status, Some(report)).await
    }

    async fn advance_ai(
        &self,
        id: Uuid,
        target: AiStatus,
        report: Option<&str>,
    ) -> Result<RunRecord> {
        let sources = target.valid_sources();
        if sources.is_empty() {
            return Err(anyhow!(StoreError::InvalidAiTransition(id, target)));
        }
        let source_list = sources
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let now = Utc::now();
        let result = match report {
            Some(report) => {
                let update = match self.driver {
                    DatabaseDriver::Sqlite => format!(
                        "UPDATE runs SET ai_status = ?, ai_report = ?, updated_at = ? \
                         WHERE id = ? AND ai_status IN ({source_list})"
                    ),
                    DatabaseDriver::Postgres => format!(
                        "UPDATE runs SET ai_status = $1, ai_report = $2, updated_at = $3 \
                         WHERE id = $4 AND ai_status IN ({source_list})"
                    ),
                };
                sqlx::query(&update)
                    .bind(target.as_str())
                    .bind(report)
                    .bind(encode_datetime(now))
                    .bind(encode_uuid(id))
                    .execute(&self.pool)
                    .await?
            }
            None => {
                let update = match self.driver {
                    DatabaseDriver::Sqlite => format!(
                        "UPDATE runs SET ai_status = ?, updated_at = ? \
                         WHERE id = ? AND ai_status IN ({source_list})"
                    ),
                    DatabaseDriver::Postgres => format!(
                        "UPDATE runs SET ai_status = $1, updated_at = $2 \
                         WHERE id = $3 AND ai_status IN ({source_list})"
                    ),
                };
                sqlx::query(&update)
                    .bind(target.as_str())
                    .bind(encode_datetime(now))
                    .bind(encode_uuid(id))
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return match self.fetch_run(id).await? {
                Some(_) => Err(anyhow!(StoreError::InvalidAiTransition(id, target))),
                None => Err(anyhow!(StoreError::RunNotFound(id))),
            };
        }

        self.fetch_run(id)
            .await?
            .ok_or_else(|| anyhow!("run updated but missing when reloaded ({id})"))
    }

    /// Resolves the ownership chain `run -> group -> project -> user`.
    pub async fn run_context(&self, run_id: Uuid) -> Result<Option<RunContext>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT r.id AS run_id, r.group_id AS group_id, p.id AS project_id, \
                        p.name AS project_name, p.user_id AS user_id \
                 FROM runs r \
                 JOIN log_groups g ON r.group_id = g.id \
                 JOIN projects p ON g.project_id = p.id \
                 WHERE r.id = ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT r.id AS run_id, r.group_id AS group_id, p.id AS project_id, \
                        p.name AS project_name, p.user_id AS user_id \
                 FROM runs r \
                 JOIN log_groups g ON r.group_id = g.id \
                 JOIN projects p ON g.project_id = p.id \
                 WHERE r.id = $1"
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(run_id))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(RunContext {
                run_id: parse_uuid(row.try_get::<String, _>("run_id")?)?,
                group_id: parse_uuid(row.try_get::<String, _>("group_id")?)?,
                project_id: parse_uuid(row.try_get::<String, _>("project_id")?)?,
                project_name: row.try_get("project_name")?,
                user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
            })
        })
        .transpose()
    }

    pub async fn list_runs_by_group(
        &self,
        group_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM runs WHERE group_id = ? \
                 ORDER BY start_time DESC LIMIT ? OFFSET ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM runs WHERE group_id = $1 \
                 ORDER BY start_time DESC LIMIT $2 OFFSET $3"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_uuid(group_id))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_run(row)?);
        }
        Ok(out)
    }

    pub async fn list_recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM runs ORDER BY start_time DESC LIMIT ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM runs ORDER BY start_time DESC LIMIT $1"
            }
        };
        let mut rows = sqlx::query(select).bind(limit as i64).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_run(row)?);
        }
        Ok(out)
    }

    /// Aggregate counts by run status and AI status across all runs.
    pub async fn stats(&self) -> Result<StatusStatistics> {
        let select = "SELECT \
             COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS running_count, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed_count, \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count, \
             COALESCE(SUM(CASE WHEN status = 'aborted' THEN 1 ELSE 0 END), 0) AS aborted_count, \
             COALESCE(SUM(CASE WHEN ai_status = 'pending' THEN 1 ELSE 0 END), 0) AS ai_pending_count, \
             COALESCE(SUM(CASE WHEN ai_status = 'processing' THEN 1 ELSE 0 END), 0) AS ai_processing_count, \
             COALESCE(SUM(CASE WHEN ai_status = 'completed' THEN 1 ELSE 0 END), 0) AS ai_completed_count, \
             COALESCE(SUM(CASE WHEN ai_status = 'failed' THEN 1 ELSE 0 END), 0) AS ai_failed_count \
             FROM runs";
        let row = sqlx::query(select).fetch_one(&self.pool).await?;

        Ok(StatusStatistics {
            running_count: row.try_get("running_count")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            aborted_count: row.try_get("aborted_count")?,
            ai_pending_count: row.try_get("ai_pending_count")?,
            ai_processing_count: row.try_get("ai_processing_count")?,
            ai_completed_count: row.try_get("ai_completed_count")?,
            ai_failed_count: row.try_get("ai_failed_count")?,
        })
    }
}

fn validate_terminal(id: Uuid, status: RunStatus, exit_code: Option<i32>) -> Result<()> {
    if let Some(code) = exit_code {
        if !(-128..=255).contains(&code) {
            return Err(anyhow!("exit code {code} outside the permitted range"));
        }
    }
    let consistent = match status {
        RunStatus::Running => false,
        RunStatus::Completed => exit_code == Some(0),
        RunStatus::Failed => matches!(exit_code, Some(code) if code != 0),
        RunStatus::Aborted => exit_code.is_none(),
    };
    if consistent {
        Ok(())
    } else {
        Err(anyhow!(
            "run {id}: status {status} is inconsistent with exit code {exit_code:?}"
        ))
    }
}

fn map_run(row: AnyRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    let ai_status: String = row.try_get("ai_status")?;
    Ok(RunRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        group_id: parse_uuid(row.try_get::<String, _>("group_id")?)?,
        start_time: decode_datetime(&row, "start_time")?,
        end_time: decode_optional_datetime(&row, "end_time")?,
        status: status.parse()?,
        exit_code: decode_optional_i64(&row, "exit_code")?.map(|code| code as i32),
        ai_status: ai_status.parse()?,
        ai_report: decode_optional_string(&row, "ai_report")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;

    async fn seed_run(db: &Database, ai: AiStatus) -> RunRecord {
        let user = db.create_user("runner", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "proj").await.unwrap();
        let group = db.get_or_create_group(project.id, "grp").await.unwrap();
        db.create_run(group.id, ai).await.unwrap()
    }

    #[tokio::test]
    async fn create_run_starts_running_without_end_time() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::None).await;

        assert_eq!(run.status, RunStatus::Running);
        assert!(run.end_time.is_none());
        assert!(run.exit_code.is_none());
        assert_eq!(run.ai_status, AiStatus::None);
    }

    #[tokio::test]
    async fn finalize_completed_records_exit_code_and_end_time() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::None).await;

        let done = db
            .finalize_run(run.id, RunStatus::Completed, Some(0))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.end_time.unwrap() >= done.start_time);
    }

    #[tokio::test]
    async fn finalize_failed_and_aborted_variants() {
        let db = test_db().await;

        let run = seed_run(&db, AiStatus::None).await;
        let failed = db
            .finalize_run(run.id, RunStatus::Failed, Some(2))
            .await
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.exit_code, Some(2));

        let group = failed.group_id;
        let run = db.create_run(group, AiStatus::None).await.unwrap();
        let aborted = db
            .finalize_run(run.id, RunStatus::Aborted, None)
            .await
            .unwrap();
        assert_eq!(aborted.status, RunStatus::Aborted);
        assert!(aborted.exit_code.is_none());
        assert!(aborted.end_time.is_some());
    }

    #[tokio::test]
    async fn terminal_runs_never_leave_their_state() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::None).await;

        db.finalize_run(run.id, RunStatus::Completed, Some(0))
            .await
            .unwrap();
        let err = db
            .finalize_run(run.id, RunStatus::Failed, Some(1))
            .await
            .unwrap_err();
        let store_err = err.downcast::<StoreError>().unwrap();
        assert_eq!(store_err, StoreError::RunNotActive(run.id));

        let reloaded = db.fetch_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
        assert_eq!(reloaded.exit_code, Some(0));
    }

    #[tokio::test]
    async fn inconsistent_exit_codes_are_rejected() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::None).await;

        assert!(db
            .finalize_run(run.id, RunStatus::Completed, Some(1))
            .await
            .is_err());
        assert!(db
            .finalize_run(run.id, RunStatus::Failed, Some(0))
            .await
            .is_err());
        assert!(db
            .finalize_run(run.id, RunStatus::Aborted, Some(3))
            .await
            .is_err());
        assert!(db
            .finalize_run(run.id, RunStatus::Failed, Some(4096))
            .await
            .is_err());

        // None of the rejected attempts touched the row.
        let reloaded = db.fetch_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn ai_status_progression_and_reanalysis() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::Pending).await;

        db.set_ai_status(run.id, AiStatus::Processing).await.unwrap();
        let done = db
            .set_ai_report(run.id, "all good", AiStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.ai_status, AiStatus::Completed);
        assert_eq!(done.ai_report.as_deref(), Some("all good"));

        // Completed may not regress to completed without a processing pass.
        assert!(db
            .set_ai_report(run.id, "again", AiStatus::Completed)
            .await
            .is_err());

        // Pending is an initial status only; re-analyze never re-enters it.
        assert!(db.set_ai_status(run.id, AiStatus::Pending).await.is_err());

        // Re-analyze: completed -> processing -> failed.
        db.set_ai_status(run.id, AiStatus::Processing).await.unwrap();
        let failed = db
            .set_ai_report(run.id, "model unavailable", AiStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.ai_status, AiStatus::Failed);
    }

    #[tokio::test]
    async fn ai_failure_allowed_before_processing_starts() {
        let db = test_db().await;
        let run = seed_run(&db, AiStatus::Pending).await;

        // Analysis can be rejected while still queued (disabled, no key).
        let failed = db
            .set_ai_report(run.id, "AI analysis is disabled", AiStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.ai_status, AiStatus::Failed);
    }

    #[tokio::test]
    async fn run_context_traverses_to_the_owner() {
        let db = test_db().await;
        let user = db.create_user("owner", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "api").await.unwrap();
        let group = db.get_or_create_group(project.id, "deploy").await.unwrap();
        let run = db.create_run(group.id, AiStatus::None).await.unwrap();

        let ctx = db.run_context(run.id).await.unwrap().unwrap();
        assert_eq!(ctx.user_id, user.id);
        assert_eq!(ctx.project_id, project.id);
        assert_eq!(ctx.project_name, "api");
        assert_eq!(ctx.group_id, group.id);

        assert!(db.run_context(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_aggregate_by_status_and_ai_status() {
        let db = test_db().await;
        let user = db.create_user("statuser", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();
        let group = db.get_or_create_group(project.id, "g").await.unwrap();

        let r1 = db.create_run(group.id, AiStatus::Pending).await.unwrap();
        let r2 = db.create_run(group.id, AiStatus::None).await.unwrap();
        let _r3 = db.create_run(group.id, AiStatus::None).await.unwrap();

        db.finalize_run(r1.id, RunStatus::Completed, Some(0))
            .await
            .unwrap();
        db.finalize_run(r2.id, RunStatus::Failed, Some(7))
            .await
            .unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.running_count, 1);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.aborted_count, 0);
        assert_eq!(stats.ai_pending_count, 1);
        assert_eq!(stats.ai_processing_count, 0);
    }
}

//! Per-user AI defaults and per-project overrides.
//!
//! Resolution overlays every non-null project field on top of the user row;
//! the resolved API key is the first non-empty of project then user.

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, Row};
use uuid::Uuid;

use crate::{
    decode_bool, decode_datetime, decode_optional_bool, decode_optional_i64,
    decode_optional_string, encode_datetime, encode_uuid, is_unique_violation, Database,
    DatabaseDriver, StoreError,
};

pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AI_MAX_TOKENS: u32 = 500;
pub const DEFAULT_AI_MAX_LOG_LINES: u32 = 1_000;
pub const DEFAULT_AI_MAX_CONCURRENT: u32 = 4;
pub const DEFAULT_AI_SYSTEM_PROMPT: &str = "You are a helpful assistant analyzing script \
     execution logs. Identify errors, warnings, and provide actionable recommendations.";

/// How the analyzer trims oversized logs before prompting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TruncateStrategy {
    Head,
    Tail,
    Smart,
}

impl TruncateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncateStrategy::Head => "head",
            TruncateStrategy::Tail => "tail",
            TruncateStrategy::Smart => "smart",
        }
    }

    /// Unknown strategy strings degrade to `tail`.
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "head" => TruncateStrategy::Head,
            "smart" => TruncateStrategy::Smart,
            _ => TruncateStrategy::Tail,
        }
    }
}

impl fmt::Display for TruncateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resolved settings bundle came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettingsSource {
    /// User defaults only; no project override applied.
    User,
    /// At least one project field overlaid the user defaults.
    Merged,
}

/// Per-user defaults row. Every field is concrete.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserSettingsRecord {
    pub user_id: Uuid,
    pub ai_enabled: bool,
    pub ai_base_url: String,
    #[serde(skip_serializing)]
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub ai_max_tokens: u32,
    pub ai_auto_analyze: bool,
    pub ai_max_log_lines: u32,
    pub ai_truncate_strategy: TruncateStrategy,
    pub ai_system_prompt: String,
    pub ai_max_concurrent: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-project overrides row. `None` means "inherit from the user".
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProjectSettingsRecord {
    pub project_id: Uuid,
    pub ai_enabled: Option<bool>,
    pub ai_base_url: Option<String>,
    #[serde(skip_serializing)]
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
    pub ai_max_tokens: Option<u32>,
    pub ai_auto_analyze: Option<bool>,
    pub ai_max_log_lines: Option<u32>,
    pub ai_truncate_strategy: Option<TruncateStrategy>,
    pub ai_system_prompt: Option<String>,
    pub ai_max_concurrent: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a full user-settings update.
#[derive(Debug, Clone)]
pub struct UserSettingsUpdate {
    pub ai_enabled: bool,
    pub ai_base_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub ai_max_tokens: u32,
    pub ai_auto_analyze: bool,
    pub ai_max_log_lines: u32,
    pub ai_truncate_strategy: TruncateStrategy,
    pub ai_system_prompt: String,
    pub ai_max_concurrent: u32,
}

/// Input for project override upserts. Fields left `None` keep inheriting.
#[derive(Debug, Clone, Default)]
pub struct ProjectSettingsUpdate {
    pub ai_enabled: Option<bool>,
    pub ai_base_url: Option<String>,
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
    pub ai_max_tokens: Option<u32>,
    pub ai_auto_analyze: Option<bool>,
    pub ai_max_log_lines: Option<u32>,
    pub ai_truncate_strategy: Option<TruncateStrategy>,
    pub ai_system_prompt: Option<String>,
    pub ai_max_concurrent: Option<u32>,
}

/// The merged configuration a run is analyzed under.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EffectiveSettings {
    pub ai_enabled: bool,
    pub ai_base_url: String,
    /// Empty when neither layer holds a key.
    #[serde(skip_serializing)]
    pub ai_api_key: String,
    pub ai_model: String,
    pub ai_max_tokens: u32,
    pub ai_auto_analyze: bool,
    pub ai_max_log_lines: u32,
    pub ai_truncate_strategy: TruncateStrategy,
    pub ai_system_prompt: String,
    pub ai_max_concurrent: u32,
    pub source: SettingsSource,
}

impl Database {
    /// Loads the user's settings row, creating it with defaults on first use.
    pub async fn ensure_user_settings(&self, user_id: Uuid) -> Result<UserSettingsRecord> {
        if let Some(existing) = self.fetch_user_settings(user_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO user_settings (\
                     user_id, ai_enabled, ai_base_url, ai_api_key, ai_model, ai_max_tokens, \
                     ai_auto_analyze, ai_max_log_lines, ai_truncate_strategy, ai_system_prompt, \
                     ai_max_concurrent, created_at, updated_at\
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO user_settings (\
                     user_id, ai_enabled, ai_base_url, ai_api_key, ai_model, ai_max_tokens, \
                     ai_auto_analyze, ai_max_log_lines, ai_truncate_strategy, ai_system_prompt, \
                     ai_max_concurrent, created_at, updated_at\
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            }
        };
        let inserted = sqlx::query(insert)
            .bind(encode_uuid(user_id))
            .bind(true)
            .bind(DEFAULT_AI_BASE_URL)
            .bind(Option::<String>::None)
            .bind(DEFAULT_AI_MODEL)
            .bind(DEFAULT_AI_MAX_TOKENS as i64)
            .bind(false)
            .bind(DEFAULT_AI_MAX_LOG_LINES as i64)
            .bind(TruncateStrategy::Tail.as_str())
            .bind(DEFAULT_AI_SYSTEM_PROMPT)
            .bind(DEFAULT_AI_MAX_CONCURRENT as i64)
            .bind(encode_datetime(now))
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.fetch_user_settings(user_id)
            .await?
            .ok_or_else(|| anyhow!("user settings ensured but missing when reloaded ({user_id})"))
    }

    pub async fn fetch_user_settings(&self, user_id: Uuid) -> Result<Option<UserSettingsRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM user_settings WHERE user_id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM user_settings WHERE user_id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user_settings).transpose()
    }

    pub async fn update_user_settings(
        &self,
        user_id: Uuid,
        update: UserSettingsUpdate,
    ) -> Result<UserSettingsRecord> {
        validate_max_concurrent(update.ai_max_concurrent)?;
        self.ensure_user_settings(user_id).await?;

        let now = Utc::now();
        let sql = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE user_settings SET \
                     ai_enabled = ?, ai_base_url = ?, ai_api_key = ?, ai_model = ?, \
                     ai_max_tokens = ?, ai_auto_analyze = ?, ai_max_log_lines = ?, \
                     ai_truncate_strategy = ?, ai_system_prompt = ?, ai_max_concurrent = ?, \
                     updated_at = ? \
                 WHERE user_id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE user_settings SET \
                     ai_enabled = $1, ai_base_url = $2, ai_api_key = $3, ai_model = $4, \
                     ai_max_tokens = $5, ai_auto_analyze = $6, ai_max_log_lines = $7, \
                     ai_truncate_strategy = $8, ai_system_prompt = $9, ai_max_concurrent = $10, \
                     updated_at = $11 \
                 WHERE user_id = $12"
            }
        };
        sqlx::query(sql)
            .bind(update.ai_enabled)
            .bind(&update.ai_base_url)
            .bind(update.ai_api_key.as_deref())
            .bind(&update.ai_model)
            .bind(update.ai_max_tokens as i64)
            .bind(update.ai_auto_analyze)
            .bind(update.ai_max_log_lines as i64)
            .bind(update.ai_truncate_strategy.as_str())
            .bind(&update.ai_system_prompt)
            .bind(update.ai_max_concurrent as i64)
            .bind(encode_datetime(now))
            .bind(encode_uuid(user_id))
            .execute(&self.pool)
            .await?;

        self.fetch_user_settings(user_id)
            .await?
            .ok_or_else(|| anyhow!("user settings updated but missing when reloaded ({user_id})"))
    }

    pub async fn fetch_project_settings(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ProjectSettingsRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM project_settings WHERE project_id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM project_settings WHERE project_id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(project_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_project_settings).transpose()
    }

    pub async fn upsert_project_settings(
        &self,
        project_id: Uuid,
        update: ProjectSettingsUpdate,
    ) -> Result<ProjectSettingsRecord> {
        if let Some(concurrent) = update.ai_max_concurrent {
            validate_max_concurrent(concurrent)?;
        }

        let now = Utc::now();
        if self.fetch_project_settings(project_id).await?.is_some() {
            let sql = match self.driver {
                DatabaseDriver::Sqlite => {
                    "UPDATE project_settings SET \
                         ai_enabled = ?, ai_base_url = ?, ai_api_key = ?, ai_model = ?, \
                         ai_max_tokens = ?, ai_auto_analyze = ?, ai_max_log_lines = ?, \
                         ai_truncate_strategy = ?, ai_system_prompt = ?, ai_max_concurrent = ?, \
                         updated_at = ? \
                     WHERE project_id = ?"
                }
                DatabaseDriver::Postgres => {
                    "UPDATE project_settings SET \
                         ai_enabled = $1, ai_base_url = $2, ai_api_key = $3, ai_model = $4, \
                         ai_max_tokens = $5, ai_auto_analyze = $6, ai_max_log_lines = $7, \
                         ai_truncate_strategy = $8, ai_system_prompt = $9, ai_max_concurrent = $10, \
                         updated_at = $11 \
                     WHERE project_id = $12"
                }
            };
            sqlx::query(sql)
                .bind(update.ai_enabled)
                .bind(update.ai_base_url.as_deref())
                .bind(update.ai_api_key.as_deref())
                .bind(update.ai_model.as_deref())
                .bind(update.ai_max_tokens.map(|v| v as i64))
                .bind(update.ai_auto_analyze)
                .bind(update.ai_max_log_lines.map(|v| v as i64))
                .bind(update.ai_truncate_strategy.map(|v| v.as_str()))
                .bind(update.ai_system_prompt.as_deref())
                .bind(update.ai_max_concurrent.map(|v| v as i64))
                .bind(encode_datetime(now))
                .bind(encode_uuid(project_id))
                .execute(&self.pool)
                .await?;
        } else {
            let sql = match self.driver {
                DatabaseDriver::Sqlite => {
                    "INSERT INTO project_settings (\
                         project_id, ai_enabled, ai_base_url, ai_api_key, ai_model, \
                         ai_max_tokens, ai_auto_analyze, ai_max_log_lines, ai_truncate_strategy, \
                         ai_system_prompt, ai_max_concurrent, created_at, updated_at\
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                }
                DatabaseDriver::Postgres => {
                    "INSERT INTO project_settings (\
                         project_id, ai_enabled, ai_base_url, ai_api_key, ai_model, \
                         ai_max_tokens, ai_auto_analyze, ai_max_log_lines, ai_truncate_strategy, \
                         ai_system_prompt, ai_max_concurrent, created_at, updated_at\
                     ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
                }
            };
            sqlx::query(sql)
                .bind(encode_uuid(project_id))
                .bind(update.ai_enabled)
                .bind(update.ai_base_url.as_deref())
                .bind(update.ai_api_key.as_deref())
                .bind(update.ai_model.as_deref())
                .bind(update.ai_max_tokens.map(|v| v as i64))
                .bind(update.ai_auto_analyze)
                .bind(update.ai_max_log_lines.map(|v| v as i64))
                .bind(update.ai_truncate_strategy.map(|v| v.as_str()))
                .bind(update.ai_system_prompt.as_deref())
                .bind(update.ai_max_concurrent.map(|v| v as i64))
                .bind(encode_datetime(now))
                .bind(encode_datetime(now))
                .execute(&self.pool)
                .await?;
        }

        self.fetch_project_settings(project_id).await?.ok_or_else(|| {
            anyhow!("project settings upserted but missing when reloaded ({project_id})")
        })
    }

    /// Removes project overrides; runs fall back to user defaults.
    pub async fn delete_project_settings(&self, project_id: Uuid) -> Result<bool> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM project_settings WHERE project_id = ?",
            DatabaseDriver::Postgres => "DELETE FROM project_settings WHERE project_id = $1",
        };
        let result = sqlx::query(delete)
            .bind(encode_uuid(project_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overlays non-null project fields on the user defaults. Errors if the
    /// user has no settings row; a missing project row means no overrides.
    pub async fn resolve_effective_settings(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<EffectiveSettings> {
        let user = self
            .fetch_user_settings(user_id)
            .await?
            .ok_or_else(|| anyhow!(StoreError::SettingsMissing(user_id)))?;
        let project = self.fetch_project_settings(project_id).await?;

        let mut effective = EffectiveSettings {
            ai_enabled: user.ai_enabled,
            ai_base_url: user.ai_base_url,
            ai_api_key: String::new(),
            ai_model: user.ai_model,
            ai_max_tokens: user.ai_max_tokens,
            ai_auto_analyze: user.ai_auto_analyze,
            ai_max_log_lines: user.ai_max_log_lines,
            ai_truncate_strategy: user.ai_truncate_strategy,
            ai_system_prompt: user.ai_system_prompt,
            ai_max_concurrent: user.ai_max_concurrent,
            source: SettingsSource::User,
        };

        let user_key = user.ai_api_key.unwrap_or_default();
        let mut overlaid = false;

        if let Some(project) = project {
            if let Some(enabled) = project.ai_enabled {
                effective.ai_enabled = enabled;
                overlaid = true;
            }
            if let Some(base_url) = project.ai_base_url {
                effective.ai_base_url = base_url;
                overlaid = true;
            }
            if let Some(model) = project.ai_model {
                effective.ai_model = model;
                overlaid = true;
            }
            if let Some(max_tokens) = project.ai_max_tokens {
                effective.ai_max_tokens = max_tokens;
                overlaid = true;
            }
            if let Some(auto) = project.ai_auto_analyze {
                effective.ai_auto_analyze = auto;
                overlaid = true;
            }
            if let Some(max_lines) = project.ai_max_log_lines {
                effective.ai_max_log_lines = max_lines;
                overlaid = true;
            }
            if let Some(strategy) = project.ai_truncate_strategy {
                effective.ai_truncate_strategy = strategy;
                overlaid = true;
            }
            if let Some(prompt) = project.ai_system_prompt {
                effective.ai_system_prompt = prompt;
                overlaid = true;
            }
            if let Some(concurrent) = project.ai_max_concurrent {
                effective.ai_max_concurrent = concurrent;
                overlaid = true;
            }
            match project.ai_api_key {
                Some(key) if !key.is_empty() => {
                    effective.ai_api_key = key;
                    overlaid = true;
                }
                _ => effective.ai_api_key = user_key,
            }
        } else {
            effective.ai_api_key = user_key;
        }

        if overlaid {
            effective.source = SettingsSource::Merged;
        }
        Ok(effective)
    }
}

fn validate_max_concurrent(value: u32) -> Result<()> {
    if (1..=10).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("ai_max_concurrent {value} outside 1..=10"))
    }
}

fn map_user_settings(row: AnyRow) -> Result<UserSettingsRecord> {
    let strategy: String = row.try_get("ai_truncate_strategy")?;
    Ok(UserSettingsRecord {
        user_id: crate::parse_uuid(row.try_get::<String, _>("user_id")?)?,
        ai_enabled: decode_bool(&row, "ai_enabled")?,
        ai_base_url: row.try_get("ai_base_url")?,
        ai_api_key: decode_optional_string(&row, "ai_api_key")?,
        ai_model: row.try_get("ai_model")?,
        ai_max_tokens: row.try_get::<i64, _>("ai_max_tokens")? as u32,
        ai_auto_analyze: decode_bool(&row, "ai_auto_analyze")?,
        ai_max_log_lines: row.try_get::<i64, _>("ai_max_log_lines")? as u32,
        ai_truncate_strategy: TruncateStrategy::parse_lossy(&strategy),
        ai_system_prompt: row.try_get("ai_system_prompt")?,
        ai_max_concurrent: row.try_get::<i64, _>("ai_max_concurrent")? as u32,
        created_at: decode_datetime(&row, "created_at")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

fn map_project_settings(row: AnyRow) -> Result<ProjectSettingsRecord> {
    Ok(ProjectSettingsRecord {
        project_id: crate::parse_uuid(row.try_get::<String, _>("project_id")?)?,
        ai_enabled: decode_optional_bool(&row, "ai_enabled")?,
        ai_base_url: decode_optional_string(&row, "ai_base_url")?,
        ai_api_key: decode_optional_string(&row, "ai_api_key")?,
        ai_model: decode_optional_string(&row, "ai_model")?,
        ai_max_tokens: decode_optional_i64(&row, "ai_max_tokens")?.map(|v| v as u32),
        ai_auto_analyze: decode_optional_bool(&row, "ai_auto_analyze")?,
        ai_max_log_lines: decode_optional_i64(&row, "ai_max_log_lines")?.map(|v| v as u32),
        ai_truncate_strategy: decode_optional_string(&row, "ai_truncate_strategy")?
            .map(|s| TruncateStrategy::parse_lossy(&s)),
        ai_system_prompt: decode_optional_string(&row, "ai_system_prompt")?,
        ai_max_concurrent: decode_optional_i64(&row, "ai_max_concurrent")?.map(|v| v as u32),
        created_at: decode_datetime(&row, "created_at")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;

    #[tokio::test]
    async fn first_use_creates_defaults() {
        let db = test_db().await;
        let user = db.create_user("settings1", "hash", false).await.unwrap();

        let settings = db.ensure_user_settings(user.id).await.unwrap();
        assert!(settings.ai_enabled);
        assert!(!settings.ai_auto_analyze);
        assert_eq!(settings.ai_model, DEFAULT_AI_MODEL);
        assert_eq!(settings.ai_max_tokens, DEFAULT_AI_MAX_TOKENS);
        assert_eq!(settings.ai_max_log_lines, DEFAULT_AI_MAX_LOG_LINES);
        assert_eq!(settings.ai_truncate_strategy, TruncateStrategy::Tail);
        assert!(settings.ai_api_key.is_none());

        // Idempotent: a second ensure returns the same row.
        let again = db.ensure_user_settings(user.id).await.unwrap();
        assert_eq!(again.created_at, settings.created_at);
    }

    #[tokio::test]
    async fn resolution_without_project_row_tags_user() {
        let db = test_db().await;
        let user = db.create_user("settings2", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();
        db.ensure_user_settings(user.id).await.unwrap();

        let effective = db
            .resolve_effective_settings(user.id, project.id)
            .await
            .unwrap();
        assert_eq!(effective.source, SettingsSource::User);
        assert_eq!(effective.ai_model, DEFAULT_AI_MODEL);
        assert_eq!(effective.ai_api_key, "");
    }

    #[tokio::test]
    async fn project_fields_overlay_user_defaults() {
        let db = test_db().await;
        let user = db.create_user("settings3", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();

        db.ensure_user_settings(user.id).await.unwrap();
        db.update_user_settings(
            user.id,
            UserSettingsUpdate {
                ai_enabled: true,
                ai_base_url: DEFAULT_AI_BASE_URL.into(),
                ai_api_key: None,
                ai_model: "gpt-4o-mini".into(),
                ai_max_tokens: 500,
                ai_auto_analyze: false,
                ai_max_log_lines: 1000,
                ai_truncate_strategy: TruncateStrategy::Tail,
                ai_system_prompt: "prompt".into(),
                ai_max_concurrent: 4,
            },
        )
        .await
        .unwrap();

        db.upsert_project_settings(
            project.id,
            ProjectSettingsUpdate {
                ai_model: Some("gpt-4".into()),
                ai_max_log_lines: Some(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let effective = db
            .resolve_effective_settings(user.id, project.id)
            .await
            .unwrap();
        assert_eq!(effective.ai_model, "gpt-4");
        assert_eq!(effective.ai_max_log_lines, 200);
        assert_eq!(effective.ai_max_tokens, 500);
        assert_eq!(effective.ai_truncate_strategy, TruncateStrategy::Tail);
        assert_eq!(effective.source, SettingsSource::Merged);
    }

    #[tokio::test]
    async fn api_key_prefers_non_empty_project_key() {
        let db = test_db().await;
        let user = db.create_user("settings4", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();

        db.ensure_user_settings(user.id).await.unwrap();
        let base = db.fetch_user_settings(user.id).await.unwrap().unwrap();
        db.update_user_settings(
            user.id,
            UserSettingsUpdate {
                ai_enabled: base.ai_enabled,
                ai_base_url: base.ai_base_url.clone(),
                ai_api_key: Some("user-key".into()),
                ai_model: base.ai_model.clone(),
                ai_max_tokens: base.ai_max_tokens,
                ai_auto_analyze: base.ai_auto_analyze,
                ai_max_log_lines: base.ai_max_log_lines,
                ai_truncate_strategy: base.ai_truncate_strategy,
                ai_system_prompt: base.ai_system_prompt.clone(),
                ai_max_concurrent: base.ai_max_concurrent,
            },
        )
        .await
        .unwrap();

        // No project key: the user key wins.
        db.upsert_project_settings(
            project.id,
            ProjectSettingsUpdate {
                ai_model: Some("gpt-4".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let effective = db
            .resolve_effective_settings(user.id, project.id)
            .await
            .unwrap();
        assert_eq!(effective.ai_api_key, "user-key");

        // Project key present: it takes precedence.
        db.upsert_project_settings(
            project.id,
            ProjectSettingsUpdate {
                ai_model: Some("gpt-4".into()),
                ai_api_key: Some("project-key".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let effective = db
            .resolve_effective_settings(user.id, project.id)
            .await
            .unwrap();
        assert_eq!(effective.ai_api_key, "project-key");
    }

    #[tokio::test]
    async fn missing_user_settings_is_an_error() {
        let db = test_db().await;
        let user = db.create_user("settings5", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();

        let err = db
            .resolve_effective_settings(user.id, project.id)
            .await
            .unwrap_err();
        let store_err = err.downcast::<StoreError>().unwrap();
        assert_eq!(store_err, StoreError::SettingsMissing(user.id));
    }

    #[tokio::test]
    async fn deleting_overrides_restores_user_source() {
        let db = test_db().await;
        let user = db.create_user("settings6", "hash", false).await.unwrap();
        let project = db.get_or_create_project(user.id, "p").await.unwrap();
        db.ensure_user_settings(user.id).await.unwrap();

        db.upsert_project_settings(
            project.id,
            ProjectSettingsUpdate {
                ai_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            db.resolve_effective_settings(user.id, project.id)
                .await
                .unwrap()
                .source,
            SettingsSource::Merged
        );

        assert!(db.delete_project_settings(project.id).await.unwrap());
        assert_eq!(
            db.resolve_effective_settings(user.id, project.id)
                .await
                .unwrap()
                .source,
            SettingsSource::User
        );
    }

    #[tokio::test]
    async fn max_concurrent_bounds_enforced() {
        let db = test_db().await;
        let user = db.create_user("settings7", "hash", false).await.unwrap();
        db.ensure_user_settings(user.id).await.unwrap();

        let base = db.fetch_user_settings(user.id).await.unwrap().unwrap();
        let update = UserSettingsUpdate {
            ai_enabled: base.ai_enabled,
            ai_base_url: base.ai_base_url,
            ai_api_key: None,
            ai_model: base.ai_model,
            ai_max_tokens: base.ai_max_tokens,
            ai_auto_analyze: base.ai_auto_analyze,
            ai_max_log_lines: base.ai_max_log_lines,
            ai_truncate_strategy: base.ai_truncate_strategy,
            ai_system_prompt: base.ai_system_prompt,
            ai_max_concurrent: 0,
        };
        assert!(db.update_user_settings(user.id, update).await.is_err());
    }
}

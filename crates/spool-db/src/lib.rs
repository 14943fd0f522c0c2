//! Metadata store for the spool run-capture platform.
//!
//! Async API over SQLite or PostgreSQL (sqlx `Any` driver) holding the
//! ownership forest (users, projects, log groups, runs) together with API
//! credentials and the two-layer AI settings model. Log lines themselves live
//! in the log store, never here.

mod runs;
mod settings;

pub use runs::{AiStatus, RunContext, RunRecord, RunStatus, StatusStatistics};
pub use settings::{
    EffectiveSettings, ProjectSettingsRecord, ProjectSettingsUpdate, SettingsSource,
    TruncateStrategy, UserSettingsRecord, UserSettingsUpdate, DEFAULT_AI_BASE_URL,
    DEFAULT_AI_MAX_CONCURRENT, DEFAULT_AI_MAX_LOG_LINES, DEFAULT_AI_MAX_TOKENS, DEFAULT_AI_MODEL,
    DEFAULT_AI_SYSTEM_PROMPT,
};

use std::sync::Once;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Row,
};
use thiserror::Error;
use uuid::Uuid;

/// Allowed characters for usernames and project/group names.
const NAME_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Raw API tokens are 32 random bytes, presented hex-encoded.
const TOKEN_BYTES: usize = 32;

/// Supported database backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Typed failures surfaced by the store. Wrapped in `anyhow::Error` and
/// recovered by `downcast` at the call sites that need to branch on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Deliberately opaque: covers unknown, malformed and revoked tokens
    /// alike so callers cannot enumerate users.
    #[error("invalid or unknown API token")]
    InvalidToken,
    #[error("invalid {0} name: {1}")]
    InvalidName(&'static str, String),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {0} is not in the running state")]
    RunNotActive(Uuid),
    #[error("run {0} cannot transition to ai status {1}")]
    InvalidAiTransition(Uuid, runs::AiStatus),
    #[error("no settings stored for user {0}")]
    SettingsMissing(Uuid),
}

/// Primary entry point to the metadata store.
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) pool: AnyPool,
    pub(crate) driver: DatabaseDriver,
}

impl Database {
    /// Establishes a connection pool and runs embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, driver })
    }

    /// Exposes the underlying pool for composed queries.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    /// Creates a user. The password hash is stored opaquely; hashing is the
    /// responsibility of the registration surface.
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<UserRecord> {
        validate_name("user", username, 3, 50)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO users (id, username, password_hash, is_admin, created_at) \
                 VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO users (id, username, password_hash, is_admin, created_at) \
                 VALUES ($1, $2, $3, $4, $5)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(username)
            .bind(password_hash)
            .bind(is_admin)
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await?;

        self.fetch_user(id)
            .await?
            .ok_or_else(|| anyhow!("user inserted but missing when reloaded ({id})"))
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM users WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE username = ?",
            DatabaseDriver::Postgres => "SELECT * FROM users WHERE username = $1",
        };
        let row = sqlx::query(select)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    /// Issues a fresh API token for a user. The raw value is returned exactly
    /// once and never persisted; only its SHA-256 digest is stored.
    pub async fn create_token(&self, user_id: Uuid, name: &str) -> Result<IssuedToken> {
        if self.fetch_user(user_id).await?.is_none() {
            return Err(anyhow!(StoreError::UserNotFound(user_id)));
        }

        let raw = generate_token();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO api_tokens (id, user_id, token_hash, name, created_at) \
                 VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO api_tokens (id, user_id, token_hash, name, created_at) \
                 VALUES ($1, $2, $3, $4, $5)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(user_id))
            .bind(hash_token(&raw))
            .bind(name)
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await?;

        Ok(IssuedToken {
            raw,
            record: ApiTokenRecord {
                id,
                user_id,
                name: name.to_string(),
                created_at: now,
            },
        })
    }

    /// Resolves a presented token to its owning user. Accepts the bare value
    /// or an `Authorization`-style `Bearer <token>` string. Every failure
    /// collapses to [`StoreError::InvalidToken`].
    pub async fn authenticate_token(&self, presented: &str) -> Result<Uuid> {
        let raw = presented
            .strip_prefix("Bearer ")
            .unwrap_or(presented)
            .trim();
        if raw.is_empty() {
            return Err(anyhow!(StoreError::InvalidToken));
        }

        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT user_id FROM api_tokens WHERE token_hash = ?",
            DatabaseDriver::Postgres => "SELECT user_id FROM api_tokens WHERE token_hash = $1",
        };
        let row = sqlx::query(select)
            .bind(hash_token(raw))
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| anyhow!(StoreError::InvalidToken))?;

        match row {
            Some(row) => {
                let user_id: String = row.try_get("user_id")?;
                parse_uuid(user_id)
            }
            None => Err(anyhow!(StoreError::InvalidToken)),
        }
    }

    pub async fn list_tokens(&self, user_id: Uuid) -> Result<Vec<ApiTokenRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM api_tokens WHERE user_id = ? ORDER BY created_at DESC"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM api_tokens WHERE user_id = $1 ORDER BY created_at DESC"
            }
        };
        let mut rows = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_token(row)?);
        }
        Ok(out)
    }

    pub async fn delete_token(&self, id: Uuid) -> Result<bool> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM api_tokens WHERE id = ?",
            DatabaseDriver::Postgres => "DELETE FROM api_tokens WHERE id = $1",
        };
        let result = sqlx::query(delete)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Idempotent upsert keyed on the `(user_id, name)` unique pair.
    pub async fn get_or_create_project(&self, user_id: Uuid, name: &str) -> Result<ProjectRecord> {
        validate_name("project", name, 1, 255)?;

        if let Some(existing) = self.find_project(user_id, name).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO projects (id, user_id, name, created_at) VALUES (?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO projects (id, user_id, name, created_at) VALUES ($1, $2, $3, $4)"
            }
        };
        let inserted = sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(user_id))
            .bind(name)
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => {}
            // A concurrent stream won the race on the unique pair; reload it.
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.find_project(user_id, name)
            .await?
            .ok_or_else(|| anyhow!("project upserted but missing when reloaded ({user_id}/{name})"))
    }

    async fn find_project(&self, user_id: Uuid, name: &str) -> Result<Option<ProjectRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM projects WHERE user_id = ? AND name = ?",
            DatabaseDriver::Postgres => "SELECT * FROM projects WHERE user_id = $1 AND name = $2",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_project).transpose()
    }

    pub async fn fetch_project(&self, id: Uuid) -> Result<Option<ProjectRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM projects WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM projects WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_project).transpose()
    }

    /// Idempotent upsert keyed on the `(project_id, name)` unique pair.
    pub async fn get_or_create_group(&self, project_id: Uuid, name: &str) -> Result<GroupRecord> {
        validate_name("group", name, 1, 255)?;

        if let Some(existing) = self.find_group(project_id, name).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO log_groups (id, project_id, name, created_at) VALUES (?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO log_groups (id, project_id, name, created_at) VALUES ($1, $2, $3, $4)"
            }
        };
        let inserted = sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(project_id))
            .bind(name)
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.find_group(project_id, name).await?.ok_or_else(|| {
            anyhow!("group upserted but missing when reloaded ({project_id}/{name})")
        })
    }

    async fn find_group(&self, project_id: Uuid, name: &str) -> Result<Option<GroupRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM log_groups WHERE project_id = ? AND name = ?",
            DatabaseDriver::Postgres => {
                "SELECT * FROM log_groups WHERE project_id = $1 AND name = $2"
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(project_id))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_group).transpose()
    }

    pub async fn fetch_group(&self, id: Uuid) -> Result<Option<GroupRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM log_groups WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM log_groups WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_group).transpose()
    }
}

/// Persisted user row. The password hash never leaves JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Stored token metadata; the digest itself is never exposed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A freshly minted token: the raw value plus its stored metadata.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub raw: String,
    pub record: ApiTokenRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn validate_name(kind: &'static str, value: &str, min: usize, max: usize) -> Result<()> {
    let length_ok = (min..=max).contains(&value.chars().count());
    let charset_ok = value.chars().all(|c| NAME_CHARSET.contains(c));
    if length_ok && charset_ok {
        Ok(())
    } else {
        Err(anyhow!(StoreError::InvalidName(kind, value.to_string())))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(code.as_ref(), "2067" | "1555" | "23505")
            } else {
                db_err.message().to_lowercase().contains("unique")
            }
        }
        _ => false,
    }
}

fn encode_uuid(value: Uuid) -> String {
    value.to_string()
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| anyhow!("invalid UUID '{}': {}", value, err))
}

fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn decode_datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_datetime(raw)
}

fn decode_optional_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    match row.try_get::<String, _>(column) {
        Ok(raw) => parse_datetime(raw).map(Some),
        Err(err) if is_unexpected_null(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn decode_optional_string(row: &AnyRow, column: &str) -> Result<Option<String>> {
    match row.try_get::<String, _>(column) {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_unexpected_null(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn decode_optional_i64(row: &AnyRow, column: &str) -> Result<Option<i64>> {
    match row.try_get::<i64, _>(column) {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_unexpected_null(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn decode_bool(row: &AnyRow, column: &str) -> Result<bool> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => {
            let raw: i64 = row.try_get(column)?;
            Ok(raw != 0)
        }
    }
}

fn decode_optional_bool(row: &AnyRow, column: &str) -> Result<Option<bool>> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_unexpected_null(&err) => Ok(None),
        Err(_) => match row.try_get::<i64, _>(column) {
            Ok(raw) => Ok(Some(raw != 0)),
            Err(err) if is_unexpected_null(&err) => Ok(None),
            Err(err) => Err(err.into()),
        },
    }
}

fn is_unexpected_null(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Decode(inner) => contains_null(inner.as_ref()),
        sqlx::Error::ColumnDecode { source, .. } => contains_null(source.as_ref()),
        _ => false,
    }
}

fn contains_null(err: &(dyn std::error::Error + 'static)) -> bool {
    if err.to_string().contains("NULL") {
        return true;
    }
    if let Some(source) = err.source() {
        return contains_null(source);
    }
    false
}

fn map_user(row: AnyRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        is_admin: decode_bool(&row, "is_admin")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

fn map_token(row: AnyRow) -> Result<ApiTokenRecord> {
    Ok(ApiTokenRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        name: row.try_get("name")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

fn map_project(row: AnyRow) -> Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        name: row.try_get("name")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

fn map_group(row: AnyRow) -> Result<GroupRecord> {
    Ok(GroupRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        project_id: parse_uuid(row.try_get::<String, _>("project_id")?)?,
        name: row.try_get("name")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    Database::connect("sqlite::memory:").await.unwrap()
}

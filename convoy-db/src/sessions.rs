//! Session log repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::{Error, Result};

/// Outcome of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Agent is currently running
    Running,
    /// Session verified the feature (or completed its phase) successfully
    Passed,
    /// Session completed but the feature outcome was negative
    Failed,
    /// Session could not complete (spawn failure, classification error)
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One durable session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unique id
    pub id: String,
    /// Feature the session worked on
    pub feature_id: i64,
    /// Track name, or the synthetic tracks `verification` / `fix`
    pub track: String,
    /// Feature branch the session ran against
    pub branch: String,
    /// Current status
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// The prompt that was sent to the agent
    pub prompt: String,
    /// Extra context supplied by a retry or resume
    pub extra_context: Option<String>,
    /// Captured standard output
    pub output: String,
    /// Ordered parsed message list, serialized as JSON
    pub messages_json: String,
    pub error: Option<String>,
    /// Name of the agent that actually ran last (after any fallback)
    pub agent_used: Option<String>,
}

/// Fields for creating a session at agent spawn
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub feature_id: i64,
    pub track: String,
    pub branch: String,
    pub prompt: String,
    pub extra_context: Option<String>,
}

/// Fields updated when a session finishes (all optional, applied if set)
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub messages_json: Option<String>,
    pub error: Option<String>,
    pub agent_used: Option<String>,
}

/// Filters for listing sessions
#[derive(Debug, Clone, Default)]
pub struct SessionFilters {
    pub feature_id: Option<i64>,
    pub track: Option<String>,
    pub status: Option<SessionStatus>,
}

/// Pagination window
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Repository for session records
#[derive(Clone)]
pub struct SessionLog {
    pool: SqlitePool,
}

impl SessionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a new session in `running` status
    pub async fn create_session(&self, session: &NewSession) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO sessions
                (id, feature_id, track, branch, status, started_at, prompt, extra_context)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.feature_id)
        .bind(&session.track)
        .bind(&session.branch)
        .bind(SessionStatus::Running.as_str())
        .bind(&now)
        .bind(&session.prompt)
        .bind(&session.extra_context)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update a session in place; unset fields are left untouched
    pub async fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET
                status = COALESCE(?, status),
                finished_at = COALESCE(?, finished_at),
                duration_ms = COALESCE(?, duration_ms),
                output = COALESCE(?, output),
                messages_json = COALESCE(?, messages_json),
                error = COALESCE(?, error),
                agent_used = COALESCE(?, agent_used)
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.finished_at.map(|t| t.to_rfc3339()))
        .bind(update.duration_ms)
        .bind(&update.output)
        .bind(&update.messages_json)
        .bind(&update.error)
        .bind(&update.agent_used)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }

        Ok(())
    }

    /// Fetch a single session
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    /// Most recent session for a feature, any track, by start time
    pub async fn latest_for_feature(&self, feature_id: i64) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE feature_id = ?
             ORDER BY started_at DESC, created_at DESC LIMIT 1",
        )
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    /// List sessions matching the filters, newest first
    pub async fn list(&self, filters: &SessionFilters, page: Page) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions
             WHERE (? IS NULL OR feature_id = ?)
               AND (? IS NULL OR track = ?)
               AND (? IS NULL OR status = ?)
             ORDER BY started_at DESC, created_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(filters.feature_id)
        .bind(filters.feature_id)
        .bind(&filters.track)
        .bind(&filters.track)
        .bind(filters.status.map(|s| s.as_str()))
        .bind(filters.status.map(|s| s.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Count sessions matching the filters
    pub async fn count(&self, filters: &SessionFilters) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sessions
             WHERE (? IS NULL OR feature_id = ?)
               AND (? IS NULL OR track = ?)
               AND (? IS NULL OR status = ?)",
        )
        .bind(filters.feature_id)
        .bind(filters.feature_id)
        .bind(&filters.track)
        .bind(&filters.track)
        .bind(filters.status.map(|s| s.as_str()))
        .bind(filters.status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("n"))
    }
}

fn row_to_record(row: SqliteRow) -> Result<SessionRecord> {
    let started_at: String = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let status: String = row.get("status");

    Ok(SessionRecord {
        id: row.get("id"),
        feature_id: row.get("feature_id"),
        track: row.get("track"),
        branch: row.get("branch"),
        status: SessionStatus::from_str(&status),
        started_at: parse_timestamp(&started_at),
        finished_at: finished_at.as_deref().map(parse_timestamp),
        duration_ms: row.get("duration_ms"),
        prompt: row.get("prompt"),
        extra_context: row.get("extra_context"),
        output: row.get("output"),
        messages_json: row.get("messages_json"),
        error: row.get("error"),
        agent_used: row.get("agent_used"),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

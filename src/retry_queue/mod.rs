//! Durable FIFO-with-deadline queue of failed work items.
//!
//! Failed navigations, lookups, and extractions land here and are
//! re-dispatched by the orchestrator once their deadline passes. Every
//! state change is persisted before the caller is acknowledged; in a single
//! process each row has exactly one writer at a time, which is what gives
//! exactly-once dispatch per attempt.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

/// Default ceiling on attempts before an item is parked as exhausted
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay; doubled per failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Work item category; mirrors the CHECK constraint on the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    Navigation,
    Lookup,
    Extraction,
}

impl RetryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Lookup => "lookup",
            Self::Extraction => "extraction",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "navigation" => Some(Self::Navigation),
            "lookup" => Some(Self::Lookup),
            "extraction" => Some(Self::Extraction),
            _ => None,
        }
    }
}

/// A queued work item due (or scheduled) for retry
#[derive(Debug, Clone)]
pub struct RetryItem {
    pub id: i64,
    pub session_id: String,
    pub kind: RetryKind,
    /// Opaque, type-specific payload; never re-interpreted across schema changes
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// What `mark_failed` did with the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rescheduled with a later deadline
    Rescheduled,
    /// Attempt ceiling reached; the item stays in the table but is no
    /// longer yielded by `due_items`
    Exhausted,
}

/// Persistent retry queue over the shared pool
#[derive(Debug, Clone)]
pub struct RetryQueue {
    pool: SqlitePool,
    base_delay: Duration,
    max_attempts: u32,
}

impl RetryQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_policy(pool, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS)
    }

    #[must_use]
    pub fn with_policy(pool: SqlitePool, base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            pool,
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempt ceiling currently in force
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Store a failed work item; first retry is due after the base delay
    pub async fn enqueue(
        &self,
        session_id: &str,
        kind: RetryKind,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let next = now + self.base_delay.as_secs() as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO retry_queue
                (session_id, kind, payload, attempts, exhausted, next_retry_at, created_at, updated_at)
            VALUES (?, ?, ?, 0, 0, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(next)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue retry item")?;
        Ok(result.last_insert_rowid())
    }

    /// Items due at `now`, oldest deadline first. Exhausted items never appear.
    pub async fn due_items(&self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<RetryItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, kind, payload, attempts, next_retry_at
            FROM retry_queue
            WHERE session_id = ? AND exhausted = 0 AND next_retry_at <= ?
            ORDER BY next_retry_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query due retry items")?;

        rows.into_iter().map(row_to_item).collect()
    }

    /// Record a failed attempt: bump attempts, push the deadline out
    /// exponentially, park as exhausted at the ceiling.
    pub async fn mark_failed(&self, id: i64) -> Result<RetryDisposition> {
        let row = sqlx::query("SELECT attempts FROM retry_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load retry item")?
            .with_context(|| format!("Retry item {id} not found"))?;

        let attempts: u32 = row.get::<i64, _>("attempts") as u32 + 1;
        let exhausted = attempts >= self.max_attempts;
        let now = Utc::now().timestamp();
        let backoff = self
            .base_delay
            .saturating_mul(1 << (attempts - 1).min(16))
            .as_secs() as i64;

        sqlx::query(
            r#"
            UPDATE retry_queue
            SET attempts = ?, exhausted = ?, next_retry_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(attempts))
        .bind(exhausted)
        .bind(now + backoff)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark retry item failed")?;

        Ok(if exhausted {
            RetryDisposition::Exhausted
        } else {
            RetryDisposition::Rescheduled
        })
    }

    /// Remove a successfully re-processed item
    pub async fn mark_succeeded(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM retry_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to remove retry item")?;
        Ok(())
    }

    /// Non-exhausted items still owed to a session
    pub async fn pending_count(&self, session_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM retry_queue WHERE session_id = ? AND exhausted = 0",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count pending retry items")?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Exhausted items that represent uncovered work.
    ///
    /// Lookup exhaustion degrades gracefully (the record keeps "Unknown"),
    /// so only navigation and extraction items count here.
    pub async fn exhausted_work_count(&self, session_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM retry_queue WHERE session_id = ? AND exhausted = 1 AND kind != 'lookup'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count exhausted work items")?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Items parked after exhausting their attempts
    pub async fn exhausted_count(&self, session_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM retry_queue WHERE session_id = ? AND exhausted = 1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count exhausted retry items")?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Opaque snapshot of queue state for the session checkpoint
    pub async fn snapshot(&self, session_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "pending": self.pending_count(session_id).await?,
            "exhausted": self.exhausted_count(session_id).await?,
        }))
    }
}

fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<RetryItem> {
    let kind_str: String = row.get("kind");
    let kind =
        RetryKind::parse(&kind_str).with_context(|| format!("Unknown retry kind: {kind_str}"))?;
    let payload: serde_json::Value = serde_json::from_str(&row.get::<String, _>("payload"))
        .context("Failed to parse retry payload")?;
    Ok(RetryItem {
        id: row.get("id"),
        session_id: row.get("session_id"),
        kind,
        payload,
        attempts: row.get::<i64, _>("attempts") as u32,
        next_retry_at: Utc
            .timestamp_opt(row.get::<i64, _>("next_retry_at"), 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

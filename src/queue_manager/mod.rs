//! Process-global admission control: one running session at a time.
//!
//! Requests beyond the active session wait in a FIFO whose positions stay
//! contiguous 1..N. Admission decisions are serialised by a single async
//! mutex; `request` and `complete` can never interleave. Queue entries are
//! persisted so the waiting line survives a restart.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Waiting entries older than this are swept as abandoned
pub const ABANDONED_AFTER: Duration = Duration::from_secs(24 * 3600);

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No other session active; this one may run now
    Started,
    /// Enqueued behind the active session, 1-based position
    Queued { position: u32 },
}

/// Queue standing of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStanding {
    Active,
    Waiting { position: u32 },
    NotQueued,
}

/// The admission controller
#[derive(Debug, Clone)]
pub struct QueueManager {
    pool: SqlitePool,
    admission: Arc<Mutex<()>>,
}

impl QueueManager {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            admission: Arc::new(Mutex::new(())),
        }
    }

    /// Request admission for a session.
    ///
    /// Started when nothing is active and nobody waits; otherwise queued at
    /// position `waiters + 1`.
    pub async fn request(&self, session_id: &str, user_id: &str) -> Result<Admission> {
        let _guard = self.admission.lock().await;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await.context("Failed to begin admission")?;

        let active: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM queue_entries WHERE status = 'active' LIMIT 1")
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to check active entry")?;

        let waiters: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM queue_entries WHERE status = 'waiting'")
                .fetch_one(&mut *tx)
                .await
                .context("Failed to count waiters")?
                .get("n");

        let admission = if active.is_none() && waiters == 0 {
            sqlx::query(
                r#"
                INSERT INTO queue_entries (session_id, user_id, position, status, enqueued_at)
                VALUES (?, ?, 0, 'active', ?)
                "#,
            )
            .bind(session_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert active entry")?;
            Admission::Started
        } else {
            let position = (waiters + 1) as u32;
            sqlx::query(
                r#"
                INSERT INTO queue_entries (session_id, user_id, position, status, enqueued_at)
                VALUES (?, ?, ?, 'waiting', ?)
                "#,
            )
            .bind(session_id)
            .bind(user_id)
            .bind(i64::from(position))
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert waiting entry")?;
            Admission::Queued { position }
        };

        tx.commit().await.context("Failed to commit admission")?;
        debug!("admission for {session_id}: {admission:?}");
        Ok(admission)
    }

    /// Record a terminal transition of the active session and promote the
    /// head of the waiting line, if any. Returns the promoted session id.
    pub async fn complete(&self, session_id: &str) -> Result<Option<String>> {
        let _guard = self.admission.lock().await;
        let mut tx = self.pool.begin().await.context("Failed to begin completion")?;

        sqlx::query(
            "UPDATE queue_entries SET status = 'complete' WHERE session_id = ? AND status = 'active'",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .context("Failed to retire active entry")?;

        let head: Option<(String,)> = sqlx::query_as(
            "SELECT session_id FROM queue_entries WHERE status = 'waiting' ORDER BY position ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to read queue head")?;

        let promoted = if let Some((next_id,)) = head {
            sqlx::query(
                "UPDATE queue_entries SET status = 'active', position = 0 WHERE session_id = ?",
            )
            .bind(&next_id)
            .execute(&mut *tx)
            .await
            .context("Failed to promote queue head")?;
            // Head held position 1; everyone shifts up
            sqlx::query(
                "UPDATE queue_entries SET position = position - 1 WHERE status = 'waiting'",
            )
            .execute(&mut *tx)
            .await
            .context("Failed to compact positions")?;
            info!("promoted session {next_id} from queue");
            Some(next_id)
        } else {
            None
        };

        tx.commit().await.context("Failed to commit completion")?;
        Ok(promoted)
    }

    /// Cancel a waiting entry; positions behind it compact atomically.
    ///
    /// Returns `false` when the session was not waiting.
    pub async fn cancel_waiting(&self, session_id: &str) -> Result<bool> {
        let _guard = self.admission.lock().await;
        self.remove_waiting_locked(session_id, "cancelled").await
    }

    async fn remove_waiting_locked(&self, session_id: &str, new_status: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin removal")?;

        let row = sqlx::query(
            "SELECT position FROM queue_entries WHERE session_id = ? AND status = 'waiting'",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to find waiting entry")?;

        let Some(row) = row else {
            return Ok(false);
        };
        let removed_pos: i64 = row.get("position");

        sqlx::query("UPDATE queue_entries SET status = ? WHERE session_id = ?")
            .bind(new_status)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update entry status")?;

        sqlx::query(
            "UPDATE queue_entries SET position = position - 1 WHERE status = 'waiting' AND position > ?",
        )
        .bind(removed_pos)
        .execute(&mut *tx)
        .await
        .context("Failed to compact positions")?;

        tx.commit().await.context("Failed to commit removal")?;
        Ok(true)
    }

    /// Where a session stands in the queue
    pub async fn standing(&self, session_id: &str) -> Result<QueueStanding> {
        let row = sqlx::query("SELECT status, position FROM queue_entries WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query queue standing")?;

        Ok(match row {
            Some(row) => match row.get::<String, _>("status").as_str() {
                "active" => QueueStanding::Active,
                "waiting" => QueueStanding::Waiting {
                    position: row.get::<i64, _>("position") as u32,
                },
                _ => QueueStanding::NotQueued,
            },
            None => QueueStanding::NotQueued,
        })
    }

    /// Session currently holding the active slot
    pub async fn active_session(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM queue_entries WHERE status = 'active' LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query active session")?;
        Ok(row.map(|(id,)| id))
    }

    /// Positions of all waiting entries, ascending (test/diagnostic hook)
    pub async fn waiting_positions(&self) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            "SELECT position FROM queue_entries WHERE status = 'waiting' ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list waiting positions")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("position") as u32)
            .collect())
    }

    /// Cancel waiting entries older than `max_age`; returns their session ids.
    ///
    /// Run as a periodic sweep; abandoned users never come back for their
    /// slot and would otherwise block the line forever.
    pub async fn sweep_abandoned(&self, max_age: Duration) -> Result<Vec<String>> {
        let _guard = self.admission.lock().await;
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;

        let rows = sqlx::query(
            "SELECT session_id FROM queue_entries WHERE status = 'waiting' AND enqueued_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to find abandoned entries")?;

        let ids: Vec<String> = rows.into_iter().map(|r| r.get("session_id")).collect();
        for id in &ids {
            self.remove_waiting_locked(id, "cancelled").await?;
            info!("swept abandoned queue entry for session {id}");
        }
        Ok(ids)
    }
}

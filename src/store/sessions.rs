//! Session rows: creation, state snapshots, summaries, recovery.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;

use super::SessionStore;
use crate::config::SessionConfig;
use crate::session::{Session, SessionState, SessionStatus, SessionSummary};

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl SessionStore {
    /// Insert a freshly created session
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        let config =
            serde_json::to_string(&session.config).context("Failed to serialize config")?;
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, user_id, config, status, progress_percent,
                 processed_businesses, started_at, updated_at)
            VALUES (?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(config)
        .bind(session.state.status.as_str())
        .bind(session.state.started_at.map(ts))
        .bind(ts(session.state.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert session")?;
        Ok(())
    }

    /// Load a full session by id
    pub async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, config, status, progress_percent, current_town,
                   current_industry, processed_businesses, summary, started_at, updated_at
            FROM sessions WHERE id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load session")?;

        row.map(row_to_session).transpose()
    }

    /// Paginated summaries for one user, most recently updated first
    pub async fn sessions_for_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Session>> {
        let limit = i64::from(limit.clamp(1, 200));
        let offset = i64::from(page.saturating_sub(1)) * limit;
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, config, status, progress_percent, current_town,
                   current_industry, processed_businesses, summary, started_at, updated_at
            FROM sessions WHERE user_id = ?
            ORDER BY updated_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sessions")?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Id of this user's live session (queued/running/paused), if any.
    ///
    /// Backs the one-live-session-per-user invariant at submission.
    pub async fn live_session_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT id FROM sessions WHERE user_id = ? AND status IN ('queued','running','paused') LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query live session")?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Transition status, stamping updated_at (and started_at on first run)
    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let now = ts(Utc::now());
        let set_started = status == SessionStatus::Running;
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, updated_at = ?,
                started_at = CASE WHEN ? AND started_at IS NULL THEN ? ELSE started_at END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(set_started)
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to update session status")?;
        Ok(())
    }

    /// Write the live progress snapshot
    pub async fn update_progress(
        &self,
        session_id: &str,
        percent: f64,
        current_town: Option<&str>,
        current_industry: Option<&str>,
        processed_businesses: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET progress_percent = ?, current_town = ?, current_industry = ?,
                processed_businesses = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(percent)
        .bind(current_town)
        .bind(current_industry)
        .bind(processed_businesses as i64)
        .bind(ts(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to update session progress")?;
        Ok(())
    }

    /// Set terminal status and summary in one transaction
    pub async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        summary: &SessionSummary,
    ) -> Result<()> {
        let summary_json =
            serde_json::to_string(summary).context("Failed to serialize summary")?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query("UPDATE sessions SET status = ?, summary = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(summary_json)
            .bind(ts(Utc::now()))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("Failed to finalize session")?;
        if status == SessionStatus::Completed {
            // Completed sessions no longer need a resume point
            sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .context("Failed to drop checkpoint")?;
        }
        tx.commit().await.context("Failed to commit finalize")?;
        Ok(())
    }

    /// Delete a session and everything it owns (cascade)
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(())
    }

    /// Sessions stuck in `running` whose updated_at is older than `grace`.
    ///
    /// Used at process start: a previous process may have died mid-session.
    pub async fn stale_running_sessions(&self, grace_secs: i64) -> Result<Vec<String>> {
        let cutoff = ts(Utc::now()) - grace_secs;
        let rows = sqlx::query("SELECT id FROM sessions WHERE status = 'running' AND updated_at < ?")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query stale sessions")?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Mean duration of recently completed sessions, for queue-wait estimates
    pub async fn mean_completed_duration_ms(&self) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT AVG((updated_at - started_at) * 1000.0) AS mean_ms
            FROM (
                SELECT started_at, updated_at FROM sessions
                WHERE status = 'completed' AND started_at IS NOT NULL
                ORDER BY updated_at DESC LIMIT 20
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute mean duration")?;
        let mean: Option<f64> = row.get("mean_ms");
        Ok(mean.map(|m| m.max(0.0) as u64))
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let config_json: String = row.get("config");
    let config: SessionConfig =
        serde_json::from_str(&config_json).context("Failed to parse stored config")?;
    let status_str: String = row.get("status");
    let status = SessionStatus::parse(&status_str)
        .with_context(|| format!("Unknown session status: {status_str}"))?;
    let summary: Option<SessionSummary> = row
        .get::<Option<String>, _>("summary")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Failed to parse stored summary")?;

    Ok(Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        config,
        state: SessionState {
            status,
            progress_percent: row.get("progress_percent"),
            current_town: row.get("current_town"),
            current_industry: row.get("current_industry"),
            processed_businesses: row.get::<i64, _>("processed_businesses") as u64,
            started_at: row.get::<Option<i64>, _>("started_at").map(from_ts),
            updated_at: from_ts(row.get("updated_at")),
        },
        summary,
    })
}

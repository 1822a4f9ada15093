//! Checkpoint rows: one per session, upserted, deleted on completion.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use sqlx::Row;

use super::SessionStore;
use crate::session::{Checkpoint, SessionStatus};

impl SessionStore {
    /// Upsert the session's checkpoint
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (session_id, current_town, current_industry, processed_businesses,
                 retry_snapshot, batch_state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                current_town = excluded.current_town,
                current_industry = excluded.current_industry,
                processed_businesses = excluded.processed_businesses,
                retry_snapshot = excluded.retry_snapshot,
                batch_state = excluded.batch_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.current_town)
        .bind(&checkpoint.current_industry)
        .bind(checkpoint.processed_businesses as i64)
        .bind(checkpoint.retry_snapshot.as_ref().map(ToString::to_string))
        .bind(checkpoint.batch_state.as_ref().map(ToString::to_string))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to write checkpoint")?;
        Ok(())
    }

    /// Checkpoint and session state in a single transaction.
    ///
    /// Town-completion boundaries go through here so the status snapshot and
    /// the resume point can never disagree.
    pub async fn checkpoint_with_progress(
        &self,
        checkpoint: &Checkpoint,
        status: SessionStatus,
        progress_percent: f64,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (session_id, current_town, current_industry, processed_businesses,
                 retry_snapshot, batch_state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                current_town = excluded.current_town,
                current_industry = excluded.current_industry,
                processed_businesses = excluded.processed_businesses,
                retry_snapshot = excluded.retry_snapshot,
                batch_state = excluded.batch_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.session_id)
        .bind(&checkpoint.current_town)
        .bind(&checkpoint.current_industry)
        .bind(checkpoint.processed_businesses as i64)
        .bind(checkpoint.retry_snapshot.as_ref().map(ToString::to_string))
        .bind(checkpoint.batch_state.as_ref().map(ToString::to_string))
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to write checkpoint in transaction")?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, progress_percent = ?, current_town = ?,
                current_industry = ?, processed_businesses = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(progress_percent)
        .bind(&checkpoint.current_town)
        .bind(&checkpoint.current_industry)
        .bind(checkpoint.processed_businesses as i64)
        .bind(now)
        .bind(&checkpoint.session_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update session in transaction")?;

        tx.commit().await.context("Failed to commit checkpoint")?;
        Ok(())
    }

    /// Load the session's checkpoint, if one exists
    pub async fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, current_town, current_industry, processed_businesses,
                   retry_snapshot, batch_state, updated_at
            FROM checkpoints WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load checkpoint")?;

        row.map(|row| {
            let retry_snapshot = row
                .get::<Option<String>, _>("retry_snapshot")
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("Failed to parse retry snapshot")?;
            let batch_state = row
                .get::<Option<String>, _>("batch_state")
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("Failed to parse batch state")?;
            Ok(Checkpoint {
                session_id: row.get("session_id"),
                current_town: row.get("current_town"),
                current_industry: row.get("current_industry"),
                processed_businesses: row.get::<i64, _>("processed_businesses") as u64,
                retry_snapshot,
                batch_state,
                updated_at: Utc
                    .timestamp_opt(row.get::<i64, _>("updated_at"), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })
        .transpose()
    }

    /// Drop the session's checkpoint
    pub async fn delete_checkpoint(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete checkpoint")?;
        Ok(())
    }
}

//! Business record rows: idempotent inserts, provider updates, pagination.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use sqlx::Row;

use super::SessionStore;
use crate::phone;
use crate::session::BusinessRecord;

impl SessionStore {
    /// Insert a record, idempotent on (session_id, name_lower, phone_norm).
    ///
    /// Returns `true` when the row was actually inserted; a duplicate is
    /// discarded without error (first writer wins).
    pub async fn insert_business(
        &self,
        session_id: &str,
        record: &BusinessRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO businesses
                (session_id, name, name_lower, phone, phone_norm, provider,
                 address, town, industry, map_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(&record.name)
        .bind(record.name.to_lowercase())
        .bind(&record.phone)
        .bind(phone::dedup_component(record.phone.as_deref()))
        .bind(&record.provider)
        .bind(&record.address)
        .bind(&record.town)
        .bind(&record.industry)
        .bind(&record.map_url)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to insert business")?;
        Ok(result.rows_affected() > 0)
    }

    /// Update the provider on every record carrying this normalised phone.
    ///
    /// Used when a deferred lookup (retry queue) resolves after the record
    /// was persisted with "Unknown".
    pub async fn update_business_provider(
        &self,
        session_id: &str,
        phone_norm: &str,
        provider: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("UPDATE businesses SET provider = ? WHERE session_id = ? AND phone_norm = ?")
                .bind(provider)
                .bind(session_id)
                .bind(phone_norm)
                .execute(&self.pool)
                .await
                .context("Failed to update business provider")?;
        Ok(result.rows_affected())
    }

    /// Page of records in insertion order
    pub async fn businesses_page(
        &self,
        session_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<BusinessRecord>> {
        let limit = i64::from(limit.clamp(1, 500));
        let offset = i64::from(page.saturating_sub(1)) * limit;
        let rows = sqlx::query(
            r#"
            SELECT name, phone, provider, address, town, industry, map_url, created_at
            FROM businesses WHERE session_id = ?
            ORDER BY id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to page businesses")?;

        Ok(rows
            .into_iter()
            .map(|row| BusinessRecord {
                name: row.get("name"),
                phone: row.get("phone"),
                provider: row.get("provider"),
                address: row.get("address"),
                town: row.get("town"),
                industry: row.get("industry"),
                map_url: row.get("map_url"),
                created_at: Utc
                    .timestamp_opt(row.get::<i64, _>("created_at"), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Total records for a session
    pub async fn count_businesses(&self, session_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM businesses WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count businesses")?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Dedup keys already persisted for a session.
    ///
    /// Seeds the in-memory dedup set on resume so nothing from a previous
    /// run is re-emitted.
    pub async fn dedup_keys(&self, session_id: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT name_lower, phone_norm FROM businesses WHERE session_id = ?")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to load dedup keys")?;
        Ok(rows
            .into_iter()
            .map(|row| {
                format!(
                    "{}\u{1f}{}",
                    row.get::<String, _>("name_lower"),
                    row.get::<String, _>("phone_norm")
                )
            })
            .collect())
    }
}

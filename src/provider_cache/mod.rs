//! Two-layer phone → carrier cache.
//!
//! Read-through L1 (in-process LRU) over L2 (the shared SQLite database);
//! writes go through both. The cache is process-wide and shared across
//! sessions and users. A miss-then-write is deliberately not atomic:
//! duplicate lookups are cheap and losing the race is harmless.
//!
//! TTL rules: resolved carriers live 30 days (configurable); the "Unknown"
//! sentinel lives 1 day regardless, so carrier-database updates get a
//! prompt second chance.

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use sqlx::{Row, SqlitePool};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::session::PROVIDER_UNKNOWN;

/// TTL applied to "Unknown" entries regardless of configuration
pub const UNKNOWN_TTL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_RESOLVED_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Hot entries kept in process memory
const L1_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct CacheEntry {
    carrier: String,
    written_at: i64,
}

/// Process-wide carrier cache
pub struct ProviderCache {
    l1: Arc<RwLock<lru::LruCache<String, CacheEntry>>>,
    pool: SqlitePool,
    resolved_ttl: Duration,
}

impl ProviderCache {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_ttl(pool, DEFAULT_RESOLVED_TTL)
    }

    #[must_use]
    pub fn with_ttl(pool: SqlitePool, resolved_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(L1_CAPACITY).expect("L1 capacity is non-zero");
        Self {
            l1: Arc::new(RwLock::new(lru::LruCache::new(capacity))),
            pool,
            resolved_ttl,
        }
    }

    fn ttl_for(&self, carrier: &str) -> i64 {
        if carrier == PROVIDER_UNKNOWN {
            UNKNOWN_TTL.as_secs() as i64
        } else {
            self.resolved_ttl.as_secs() as i64
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: i64) -> bool {
        entry.written_at + self.ttl_for(&entry.carrier) > now
    }

    /// Fresh carrier for a normalised phone, or `None` on miss/stale.
    ///
    /// L1 is consulted first; an L2 hit repopulates L1.
    pub async fn get(&self, phone: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();

        {
            let cache = self.l1.read().await;
            if let Some(entry) = cache.peek(phone) {
                if self.is_fresh(entry, now) {
                    return Ok(Some(entry.carrier.clone()));
                }
            }
        }

        let row = sqlx::query("SELECT carrier, written_at FROM provider_cache WHERE phone = ?")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query provider cache")?;

        if let Some(row) = row {
            let entry = CacheEntry {
                carrier: row.get("carrier"),
                written_at: row.get("written_at"),
            };
            if self.is_fresh(&entry, now) {
                let carrier = entry.carrier.clone();
                let mut cache = self.l1.write().await;
                cache.put(phone.to_string(), entry);
                return Ok(Some(carrier));
            }
            debug!("stale cache entry for {phone}, will re-look-up");
        }

        Ok(None)
    }

    /// Write a resolution (including "Unknown") through both layers
    pub async fn put(&self, phone: &str, carrier: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO provider_cache (phone, carrier, written_at)
            VALUES (?, ?, ?)
            ON CONFLICT(phone) DO UPDATE SET
                carrier = excluded.carrier,
                written_at = excluded.written_at
            "#,
        )
        .bind(phone)
        .bind(carrier)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to write provider cache")?;

        let mut cache = self.l1.write().await;
        cache.put(
            phone.to_string(),
            CacheEntry {
                carrier: carrier.to_string(),
                written_at: now,
            },
        );
        Ok(())
    }

    /// Drop expired rows from L2 and reset L1.
    ///
    /// Run periodically; the read path already ignores stale entries, this
    /// just keeps the table from growing without bound.
    pub async fn evict_stale(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let unknown_cutoff = now - UNKNOWN_TTL.as_secs() as i64;
        let resolved_cutoff = now - self.resolved_ttl.as_secs() as i64;

        let result = sqlx::query(
            r#"
            DELETE FROM provider_cache
            WHERE (carrier = ? AND written_at <= ?)
               OR (carrier != ? AND written_at <= ?)
            "#,
        )
        .bind(PROVIDER_UNKNOWN)
        .bind(unknown_cutoff)
        .bind(PROVIDER_UNKNOWN)
        .bind(resolved_cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to evict stale cache rows")?;

        // L1 repopulates from L2 on demand
        self.l1.write().await.clear();

        Ok(result.rows_affected())
    }

    /// Entries currently held in the in-memory layer
    pub async fn l1_len(&self) -> usize {
        self.l1.read().await.len()
    }
}

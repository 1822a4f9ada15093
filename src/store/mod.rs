//! Durable storage for sessions and everything they own.
//!
//! One SQLite database (WAL mode) backs the whole core: sessions, business
//! records, checkpoints, the retry queue, metrics, the provider cache's
//! persistent layer, and queue entries. This module owns the pool and the
//! schema; sibling stores borrow the pool.
//!
//! Cascade rules follow the ownership model: deleting a session removes its
//! checkpoint, retry items, metrics, businesses, and queue entry. The
//! provider cache is process-wide and deliberately not session-owned.

mod businesses;
mod checkpoints;
mod metrics;
mod sessions;

pub use metrics::{MetricKind, MetricRecord};

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::path::Path;

/// SQL schema; idempotent, applied at open
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    config TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_percent REAL NOT NULL DEFAULT 0,
    current_town TEXT,
    current_industry TEXT,
    processed_businesses INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    started_at INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, status);

CREATE TABLE IF NOT EXISTS businesses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    name_lower TEXT NOT NULL,
    phone TEXT,
    phone_norm TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT 'Unknown',
    address TEXT,
    town TEXT NOT NULL,
    industry TEXT NOT NULL,
    map_url TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(session_id, name_lower, phone_norm)
);

CREATE INDEX IF NOT EXISTS idx_businesses_session ON businesses(session_id);

-- One checkpoint per session; latest write wins on resume
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
    current_town TEXT,
    current_industry TEXT,
    processed_businesses INTEGER NOT NULL DEFAULT 0,
    retry_snapshot TEXT,
    batch_state TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS retry_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('navigation','lookup','extraction')),
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    exhausted INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_retry_due
    ON retry_queue(session_id, exhausted, next_retry_at);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('navigation','extraction','lookup','memory')),
    name TEXT NOT NULL,
    value REAL NOT NULL,
    success INTEGER NOT NULL DEFAULT 1,
    metadata TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_metrics_session ON metrics(session_id, kind);

-- Process-wide phone -> carrier cache (not session-owned)
CREATE TABLE IF NOT EXISTS provider_cache (
    phone TEXT PRIMARY KEY,
    carrier TEXT NOT NULL,
    written_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_entries (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'waiting',
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_waiting ON queue_entries(status, position);
"#;

/// Open (or create) the core database at `path`.
///
/// WAL journal mode for concurrent reads during writes, `NORMAL` sync for
/// a sane durability/speed balance, foreign keys on so cascade deletes
/// actually fire.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create database directory")?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("Failed to open SQLite database")?;

    sqlx::query(SCHEMA_SQL)
        .execute(&pool)
        .await
        .context("Failed to initialize database schema")?;

    Ok(pool)
}

/// In-memory pool for tests and ephemeral runs
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    // A single pinned connection: every :memory: connection is its own
    // database, so the pool must never recycle it
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory SQLite database")?;

    sqlx::query(SCHEMA_SQL)
        .execute(&pool)
        .await
        .context("Failed to initialize database schema")?;

    Ok(pool)
}

/// Store facade over the shared pool.
///
/// Cheap to clone; all methods are transactional per session where the
/// data model demands it.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Borrow the underlying pool (shared with sibling stores)
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

//! Immutable metric rows: navigation, extraction, lookup, memory.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::SessionStore;

/// Metric category; mirrors the CHECK constraint on the metrics table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Navigation,
    Extraction,
    Lookup,
    Memory,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Extraction => "extraction",
            Self::Lookup => "lookup",
            Self::Memory => "memory",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "navigation" => Some(Self::Navigation),
            "extraction" => Some(Self::Extraction),
            "lookup" => Some(Self::Lookup),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// One immutable observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub session_id: String,
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl MetricRecord {
    #[must_use]
    pub fn new(
        session_id: &str,
        kind: MetricKind,
        name: impl Into<String>,
        value: f64,
        success: bool,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            name: name.into(),
            value,
            success,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl SessionStore {
    /// Append a metric row
    pub async fn record_metric(&self, metric: &MetricRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (session_id, kind, name, value, success, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metric.session_id)
        .bind(metric.kind.as_str())
        .bind(&metric.name)
        .bind(metric.value)
        .bind(metric.success)
        .bind(metric.metadata.as_ref().map(ToString::to_string))
        .bind(metric.created_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to record metric")?;
        Ok(())
    }

    /// All metrics of one kind for a session, oldest first
    pub async fn metrics_for_session(
        &self,
        session_id: &str,
        kind: MetricKind,
    ) -> Result<Vec<MetricRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, kind, name, value, success, metadata, created_at
            FROM metrics WHERE session_id = ? AND kind = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load metrics")?;

        rows.into_iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                let kind = MetricKind::parse(&kind_str)
                    .with_context(|| format!("Unknown metric kind: {kind_str}"))?;
                let metadata = row
                    .get::<Option<String>, _>("metadata")
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .context("Failed to parse metric metadata")?;
                Ok(MetricRecord {
                    session_id: row.get("session_id"),
                    kind,
                    name: row.get("name"),
                    value: row.get("value"),
                    success: row.get("success"),
                    metadata,
                    created_at: Utc
                        .timestamp_opt(row.get::<i64, _>("created_at"), 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }
}

//! Core domain types: sessions, business records, checkpoints.
//!
//! These are the shapes persisted by the session store and carried on the
//! event bus. Status strings are stable (they are stored in SQLite and
//! consumed by the external surface), so the serde renames here are load
//! bearing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phone;

/// Lifecycle status of a scraping session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses admit no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::Error | Self::Cancelled
        )
    }

    /// Live statuses count against the one-session-per-user invariant
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    /// Stable string form used in the database and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (town, industry) unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub town: String,
    pub industry: String,
}

impl Assignment {
    #[must_use]
    pub fn new(town: impl Into<String>, industry: impl Into<String>) -> Self {
        Self {
            town: town.into(),
            industry: industry.into(),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.industry, self.town)
    }
}

/// Live mutable state snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub current_town: Option<String>,
    pub current_industry: Option<String>,
    pub processed_businesses: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Final summary, set when a session reaches a terminal status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_businesses: u64,
    pub total_towns_completed: u64,
    pub total_industries_completed: u64,
    pub error_count: u64,
    pub duration_ms: u64,
}

/// A persisted session: identity, owner, config snapshot, live state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub config: crate::config::SessionConfig,
    pub state: SessionState,
    pub summary: Option<SessionSummary>,
}

/// A business listing extracted from the map provider, carrier-enriched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub name: String,
    /// Normalised local 10-digit phone, when one was extractable
    pub phone: Option<String>,
    /// Resolved carrier, or "Unknown"
    pub provider: String,
    pub address: Option<String>,
    pub town: String,
    pub industry: String,
    pub map_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Carrier sentinel for unresolved lookups
pub const PROVIDER_UNKNOWN: &str = "Unknown";

impl BusinessRecord {
    /// Build a record from raw extracted fields.
    ///
    /// Returns `None` when the name is empty after trimming; nameless
    /// listings cannot participate in dedup and are dropped at the source.
    #[must_use]
    pub fn from_extracted(
        name: &str,
        raw_phone: Option<&str>,
        address: Option<String>,
        map_url: Option<String>,
        assignment: &Assignment,
    ) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            phone: raw_phone.and_then(phone::normalize),
            provider: PROVIDER_UNKNOWN.to_string(),
            address,
            town: assignment.town.clone(),
            industry: assignment.industry.clone(),
            map_url,
            created_at: Utc::now(),
        })
    }

    /// Session-scoped dedup key: (lowercased name, normalised phone)
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!(
            "{}\u{1f}{}",
            self.name.to_lowercase(),
            self.phone.as_deref().unwrap_or("")
        )
    }
}

/// Durable progress snapshot; one per session, latest write wins on resume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub current_town: Option<String>,
    pub current_industry: Option<String>,
    pub processed_businesses: u64,
    /// Opaque retry-queue snapshot; never re-interpreted after schema changes
    pub retry_snapshot: Option<serde_json::Value>,
    /// Opaque batch-manager state carried across resume
    pub batch_state: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint at session start
    #[must_use]
    pub fn initial(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            current_town: None,
            current_industry: None,
            processed_businesses: 0,
            retry_snapshot: None,
            batch_state: None,
            updated_at: Utc::now(),
        }
    }
}

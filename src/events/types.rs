//! Event type definitions for the scraping event system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{BusinessRecord, SessionStatus};

/// Log severity carried on `ScrapeEvent::Log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse classification carried on `ScrapeEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Navigation,
    Extraction,
    Lookup,
    Worker,
    Store,
}

/// Reason for event bus shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// The owning core is shutting down normally
    CoreStopped,
    /// Shutdown due to an unrecoverable error
    Error(String),
}

/// Events emitted while a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScrapeEvent {
    /// Progress snapshot; emitted per harvested listing and per town boundary
    Progress {
        session_id: String,
        percent: f64,
        current_town: Option<String>,
        current_industry: Option<String>,
        processed_businesses: u64,
        timestamp: DateTime<Utc>,
    },
    /// A newly extracted (and possibly enriched) business record
    Business {
        session_id: String,
        record: BusinessRecord,
        timestamp: DateTime<Utc>,
    },
    /// Free-form log line scoped to a session
    Log {
        session_id: String,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A classified failure; `retryable` tells subscribers whether the core
    /// will keep working on it
    Error {
        session_id: String,
        classification: ErrorClass,
        message: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },
    /// Session status transition
    Lifecycle {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
        timestamp: DateTime<Utc>,
    },
    /// Signals that the event bus is shutting down; subscribers should exit
    /// their receive loops
    Shutdown {
        reason: ShutdownReason,
        timestamp: DateTime<Utc>,
    },
}

impl ScrapeEvent {
    /// Session id the event is scoped to; `None` for bus-wide events
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Progress { session_id, .. }
            | Self::Business { session_id, .. }
            | Self::Log { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Lifecycle { session_id, .. } => Some(session_id),
            Self::Shutdown { .. } => None,
        }
    }

    #[must_use]
    pub fn progress(
        session_id: &str,
        percent: f64,
        current_town: Option<String>,
        current_industry: Option<String>,
        processed_businesses: u64,
    ) -> Self {
        Self::Progress {
            session_id: session_id.to_string(),
            percent,
            current_town,
            current_industry,
            processed_businesses,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn business(session_id: &str, record: BusinessRecord) -> Self {
        Self::Business {
            session_id: session_id.to_string(),
            record,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn log(session_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            session_id: session_id.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn error(
        session_id: &str,
        classification: ErrorClass,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Error {
            session_id: session_id.to_string(),
            classification,
            message: message.into(),
            retryable,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn lifecycle(session_id: &str, from: SessionStatus, to: SessionStatus) -> Self {
        Self::Lifecycle {
            session_id: session_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn shutdown(reason: ShutdownReason) -> Self {
        Self::Shutdown {
            reason,
            timestamp: Utc::now(),
        }
    }
}

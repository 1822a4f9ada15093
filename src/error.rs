//! Crate-wide error type for scrape operations.
//!
//! Orchestration code uses `anyhow::Result` with context internally; this
//! enum is the typed surface handed to the control interface, where callers
//! need to distinguish not-found and wrong-state from real failures.

use crate::session::SessionStatus;

/// Error type returned by the control and query interface
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Session id is unknown
    #[error("session not found: {0}")]
    NotFound(String),

    /// The requested transition is not legal from the session's current status
    #[error("session {id} is {status}, cannot {action}")]
    WrongState {
        id: String,
        status: SessionStatus,
        action: &'static str,
    },

    /// Config rejected at submission
    #[error("invalid session config: {0}")]
    Validation(String),

    /// The user already has a live (queued/running/paused) session
    #[error("user {0} already has an active session")]
    UserBusy(String),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Anything else, with context preserved
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias for Result with `ScrapeError`
pub type ScrapeResult<T> = Result<T, ScrapeError>;

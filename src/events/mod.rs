//! In-process publish/subscribe for the core's observable events.
//!
//! The external API surface tails this bus: progress, extracted businesses,
//! logs, classified errors, and lifecycle transitions, all tagged by
//! session id.

mod bus;
mod metrics;
mod types;

pub use bus::{EventBus, SessionEvents};
pub use metrics::{EventBusMetrics, MetricsSnapshot};
pub use types::{ErrorClass, LogLevel, ScrapeEvent, ShutdownReason};

/// Error types for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// No active subscribers when publishing
    #[error("no active subscribers")]
    NoSubscribers,

    /// Receiver couldn't keep up, missed messages
    #[error("receiver lagged behind, missed {0} messages")]
    ReceiverLagged(u64),

    /// Event bus was shut down
    #[error("event bus shutdown")]
    Shutdown,
}

//! The injectable Page Driver capability.
//!
//! The core never owns a browser engine. Everything it needs from one is
//! expressed here as an async trait; the embedding application supplies an
//! implementation (and the test suite supplies scripted doubles). Drivers
//! are never shared: each extraction worker owns one, and the batch manager
//! mints a short-lived one per lookup batch.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Failures surfaced by a Page Driver implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// Navigation or wait exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Navigation-level failure (DNS, connection, bad response)
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Selector never appeared or evaluate/type/click target missing
    #[error("selector not satisfied: {0}")]
    Selector(String),

    /// Expression evaluation failed in the page
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// The underlying browser process died
    #[error("driver crashed: {0}")]
    Crashed(String),

    /// Operation on a driver that has been closed
    #[error("driver closed")]
    Closed,

    /// Screenshot (or another optional capability) not available
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl DriverError {
    /// Whether the failure is plausibly transient (worth an in-place retry)
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Navigation(_) | Self::Selector(_)
        )
    }
}

/// One live page the core can drive.
///
/// All methods are cancel-safe from the caller's perspective: dropping the
/// future must not poison the driver.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to a URL, waiting up to `timeout` for the load to commit
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Wait until a CSS selector matches at least one element
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Evaluate a JS expression on the page, returning its JSON value
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, DriverError>;

    /// Type text into the element matched by `selector`
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Press Enter in the focused element
    async fn press_enter(&self) -> Result<(), DriverError>;

    /// Full visible page text
    async fn text(&self) -> Result<String, DriverError>;

    /// PNG screenshot bytes, for diagnostics. Optional capability.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::Unsupported("screenshot"))
    }

    /// HTTP status of the most recent navigation, when the engine exposes it
    fn last_status(&self) -> Option<u16>;

    /// Release the underlying page/browser resources
    async fn close(&self) -> Result<(), DriverError>;
}

/// Mints Page Driver instances.
///
/// The orchestrator holds one factory and hands it to workers (one driver
/// per assignment) and to the batch manager (one driver per batch).
#[async_trait]
pub trait PageDriverFactory: Send + Sync {
    /// Open a fresh driver
    async fn open(&self) -> Result<Arc<dyn PageDriver>, DriverError>;
}

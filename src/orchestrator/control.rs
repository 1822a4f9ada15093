//! Cooperative control handle shared between the API facade and a running
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Pause/stop signals for one session.
///
/// The orchestrator polls these at its suspension points; workers carry a
/// clone of the cancellation token into every blocking operation.
#[derive(Debug, Default)]
pub struct SessionControl {
    cancel: CancellationToken,
    pause: AtomicBool,
}

impl SessionControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop: new navigations are refused, in-flight work finishes
    /// bounded, a checkpoint is written, the session transitions to stopped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Request a pause at the next safe point
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Clear a previous pause request (called before resume)
    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Token carried by workers into every blocking operation
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Completes when a stop has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

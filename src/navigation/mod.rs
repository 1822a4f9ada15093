//! Resilient navigation wrapper around the Page Driver.
//!
//! Every navigation the core performs goes through here: exponential-backoff
//! retries, ordered fallback wait strategies, and an adaptive timeout
//! computed from recent history. One manager instance lives per driver owner
//! (worker or lookup batch); the adaptive state is not shared.

use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::events::{ErrorClass, EventBus, ScrapeEvent};
use crate::page_driver::{DriverError, PageDriver};

/// Lower clamp on the adaptive timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper clamp on the adaptive timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
/// Starting timeout before any history exists
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Successful durations kept for diagnostics
const HISTORY_WINDOW: usize = 10;

/// How to decide a navigation has actually landed.
///
/// Strategies are applied in order; the first that succeeds within the
/// current timeout wins.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Wait for a CSS selector to match
    Selector(String),
    /// Wait a fixed settle period
    Settle(Duration),
}

/// Why a navigation gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavFailureKind {
    /// Worth retrying later (network, timeout, selector miss)
    Transient,
    /// Do not retry (blocked, challenged)
    Terminal,
    /// The session's cancellation token fired
    Cancelled,
}

/// Classified navigation failure
#[derive(Debug, Clone)]
pub struct NavFailure {
    pub kind: NavFailureKind,
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for NavFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "navigation failed after {} attempt(s) ({:?}): {}",
            self.attempts, self.kind, self.message
        )
    }
}

impl std::error::Error for NavFailure {}

impl NavFailure {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, NavFailureKind::Transient)
    }
}

/// Outcome of a successful navigation
#[derive(Debug, Clone, Copy)]
pub struct NavReport {
    pub attempts: u32,
    pub duration: Duration,
}

/// HTTP statuses that mark a navigation as terminally blocked
const BLOCK_STATUSES: [u16; 2] = [403, 451];

/// Exponential-backoff navigation with adaptive timeout
#[derive(Debug)]
pub struct NavigationManager {
    base_delay: Duration,
    max_retries: u32,
    timeout: Duration,
    history: VecDeque<Duration>,
    reporter: Option<(Arc<EventBus>, String)>,
}

impl NavigationManager {
    #[must_use]
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries: max_retries.max(1),
            timeout: INITIAL_TIMEOUT,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            reporter: None,
        }
    }

    /// Report each transient failure on the event bus, scoped to a session
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>, session_id: &str) -> Self {
        self.reporter = Some((events, session_id.to_string()));
        self
    }

    /// Delay applied before attempt `k` (1-indexed).
    ///
    /// Zero before the first attempt, then `base_delay × 2^(k-2)`.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_delay.saturating_mul(1 << (attempt - 2).min(16))
        }
    }

    /// Current adaptive timeout; always within [`MIN_TIMEOUT`, `MAX_TIMEOUT`]
    #[must_use]
    pub fn current_timeout(&self) -> Duration {
        self.timeout
    }

    /// Recent successful navigation durations, newest last
    #[must_use]
    pub fn recent_durations(&self) -> impl Iterator<Item = Duration> + '_ {
        self.history.iter().copied()
    }

    /// Feed one observed operation duration into the adaptive timeout.
    ///
    /// Slow operations (> 80% of the current timeout) widen it by 15 s;
    /// fast ones (< 50%) narrow it by 10 s. The result is clamped to the
    /// [`MIN_TIMEOUT`, `MAX_TIMEOUT`] bounds unconditionally.
    pub fn observe(&mut self, duration: Duration, success: bool) {
        if success {
            if self.history.len() == HISTORY_WINDOW {
                self.history.pop_front();
            }
            self.history.push_back(duration);
        }

        let current = self.timeout;
        if duration > current.mul_f64(0.8) {
            self.timeout = current.saturating_add(Duration::from_secs(15));
        } else if duration < current.mul_f64(0.5) {
            self.timeout = current.saturating_sub(Duration::from_secs(10));
        }
        self.timeout = self.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
    }

    /// Navigate with retries, applying `strategies` in order after each load.
    ///
    /// Transient failures retry with exponential backoff up to the
    /// configured attempt count; terminal failures (block status) and
    /// cancellation propagate immediately.
    pub async fn navigate(
        &mut self,
        driver: &dyn PageDriver,
        url: &str,
        strategies: &[WaitStrategy],
        cancel: &CancellationToken,
    ) -> Result<NavReport, NavFailure> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let delay = self.retry_delay(attempt);
            if !delay.is_zero() {
                debug!("navigation retry {attempt} for {url} after {delay:?}");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(self.failure(NavFailureKind::Cancelled, attempt, "cancelled during backoff"));
                    }
                }
            }
            if cancel.is_cancelled() {
                return Err(self.failure(NavFailureKind::Cancelled, attempt, "cancelled"));
            }

            let started = Instant::now();
            match driver.navigate(url, self.timeout).await {
                Ok(()) => {
                    if let Some(status) = driver.last_status() {
                        if BLOCK_STATUSES.contains(&status) {
                            return Err(self.failure(
                                NavFailureKind::Terminal,
                                attempt,
                                format!("blocked with HTTP {status}"),
                            ));
                        }
                    }

                    if self.apply_strategies(driver, strategies).await {
                        let duration = started.elapsed();
                        self.observe(duration, true);
                        return Ok(NavReport { attempts: attempt, duration });
                    }
                    last_error = "no wait strategy succeeded".to_string();
                    self.observe(started.elapsed(), false);
                }
                Err(DriverError::Timeout(t)) => {
                    last_error = format!("navigation timed out after {t:?}");
                    // A timeout consumed the whole window; let the adaptive
                    // timeout widen for the next attempt.
                    self.observe(self.timeout, false);
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                }
                Err(e) => {
                    return Err(self.failure(NavFailureKind::Terminal, attempt, e.to_string()));
                }
            }
            warn!("navigation attempt {attempt}/{} failed for {url}: {last_error}", self.max_retries);
            if let Some((events, session_id)) = &self.reporter {
                events.emit(ScrapeEvent::error(
                    session_id,
                    ErrorClass::Navigation,
                    format!("navigation attempt {attempt} failed for {url}: {last_error}"),
                    true,
                ));
            }
        }

        Err(self.failure(NavFailureKind::Transient, self.max_retries, last_error))
    }

    async fn apply_strategies(
        &self,
        driver: &dyn PageDriver,
        strategies: &[WaitStrategy],
    ) -> bool {
        if strategies.is_empty() {
            return true;
        }
        for strategy in strategies {
            match strategy {
                WaitStrategy::Selector(selector) => {
                    if driver.wait_for(selector, self.timeout).await.is_ok() {
                        return true;
                    }
                }
                WaitStrategy::Settle(settle) => {
                    tokio::time::sleep(*settle).await;
                    return true;
                }
            }
        }
        false
    }

    fn failure(
        &self,
        kind: NavFailureKind,
        attempts: u32,
        message: impl Into<String>,
    ) -> NavFailure {
        NavFailure {
            kind,
            attempts,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> NavigationManager {
        NavigationManager::new(Duration::from_secs(2), 3)
    }

    #[test]
    fn no_delay_before_first_attempt() {
        assert_eq!(manager().retry_delay(1), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let nav = manager();
        assert_eq!(nav.retry_delay(2), Duration::from_secs(2));
        assert_eq!(nav.retry_delay(3), Duration::from_secs(4));
        assert_eq!(nav.retry_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn slow_operations_widen_timeout() {
        let mut nav = manager();
        // 60s start; 50s > 80% of 60s
        nav.observe(Duration::from_secs(50), true);
        assert_eq!(nav.current_timeout(), Duration::from_secs(75));
    }

    #[test]
    fn fast_operations_narrow_timeout() {
        let mut nav = manager();
        nav.observe(Duration::from_secs(10), true);
        assert_eq!(nav.current_timeout(), Duration::from_secs(50));
    }

    #[test]
    fn timeout_stays_within_bounds() {
        let mut nav = manager();
        for _ in 0..20 {
            nav.observe(Duration::from_secs(200), true);
        }
        assert_eq!(nav.current_timeout(), MAX_TIMEOUT);

        for _ in 0..40 {
            nav.observe(Duration::from_millis(1), true);
        }
        assert_eq!(nav.current_timeout(), MIN_TIMEOUT);
    }

    #[test]
    fn history_window_is_bounded() {
        let mut nav = manager();
        for i in 0..25u64 {
            nav.observe(Duration::from_secs(30 + i % 3), true);
        }
        assert_eq!(nav.recent_durations().count(), 10);
    }
}

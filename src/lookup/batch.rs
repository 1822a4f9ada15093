//! Adaptive batching of carrier lookups over short-lived drivers.
//!
//! The external site tolerates roughly five form submissions per browser
//! session before challenging; a fresh driver per batch resets that
//! counter. The ceiling of 5 is therefore a hard invariant, not a tuning
//! knob. Batch size floats between 3 and 5 with recent success rate.

use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::captcha::CaptchaDetector;
use crate::config::{BATCH_SIZE_CEILING, BATCH_SIZE_FLOOR};
use crate::navigation::{NavigationManager, WaitStrategy};
use crate::page_driver::{DriverError, PageDriver, PageDriverFactory};

use super::{parse_carrier, LookupOutcome, CARRIER_INPUT_SELECTOR};

/// Serialisation delay between submissions inside one batch
const INTRA_BATCH_DELAY: Duration = Duration::from_millis(500);
/// Settle time after submitting a number before reading the result text
const RESULT_SETTLE: Duration = Duration::from_secs(2);
/// Captcha-triggered driver restarts allowed within one batch
const MAX_CAPTCHA_RESTARTS: u32 = 3;
/// Inter-batch delay bounds; the actual delay is uniform in this range
pub const INTER_BATCH_DELAY_MIN: Duration = Duration::from_secs(2);
pub const INTER_BATCH_DELAY_MAX: Duration = Duration::from_secs(5);

/// Outcome of one batch run
#[derive(Debug)]
pub struct BatchReport {
    /// Outcome per attempted phone, in submission order
    pub outcomes: Vec<(String, LookupOutcome)>,
    /// Phones never attempted because captcha restarts ran out
    pub deferred: Vec<String>,
    /// Driver restarts consumed by captcha challenges
    pub restarts: u32,
}

/// Runs lookups in driver-bounded batches with adaptive sizing
pub struct BatchManager {
    factory: Arc<dyn PageDriverFactory>,
    detector: CaptchaDetector,
    nav: NavigationManager,
    carrier_site_url: String,
    captcha_detection: bool,
    size: u8,
}

impl BatchManager {
    #[must_use]
    pub fn new(
        factory: Arc<dyn PageDriverFactory>,
        carrier_site_url: impl Into<String>,
        initial_size: u8,
        captcha_detection: bool,
    ) -> Self {
        Self {
            factory,
            detector: CaptchaDetector::new(),
            nav: NavigationManager::new(Duration::from_secs(2), 2),
            carrier_site_url: carrier_site_url.into(),
            captcha_detection,
            size: initial_size.clamp(BATCH_SIZE_FLOOR, BATCH_SIZE_CEILING),
        }
    }

    /// Phones the next batch should contain; never more than the ceiling
    #[must_use]
    pub fn next_chunk_size(&self) -> usize {
        usize::from(self.size.min(BATCH_SIZE_CEILING))
    }

    /// Current adaptive size (diagnostics and checkpointing)
    #[must_use]
    pub fn current_size(&self) -> u8 {
        self.size
    }

    /// Opaque state carried across pause/resume via the checkpoint
    #[must_use]
    pub fn state(&self) -> serde_json::Value {
        serde_json::json!({ "size": self.size })
    }

    /// Restore adaptive state from a checkpoint snapshot
    pub fn restore(&mut self, state: &serde_json::Value) {
        if let Some(size) = state.get("size").and_then(serde_json::Value::as_u64) {
            self.size = (size as u8).clamp(BATCH_SIZE_FLOOR, BATCH_SIZE_CEILING);
        }
    }

    /// Random inter-batch delay in the configured range
    #[must_use]
    pub fn inter_batch_delay() -> Duration {
        let min = INTER_BATCH_DELAY_MIN.as_millis() as u64;
        let max = INTER_BATCH_DELAY_MAX.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Process one batch of phones end-to-end.
    ///
    /// Exactly one driver is open at any moment on behalf of the batch; it
    /// is closed before this method returns. Captcha detections close the
    /// driver and resume with the remaining items on a fresh one, up to
    /// [`MAX_CAPTCHA_RESTARTS`] times; whatever is left after that comes
    /// back in `deferred`.
    pub async fn run_batch(
        &mut self,
        phones: &[String],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, DriverError> {
        debug_assert!(phones.len() <= usize::from(BATCH_SIZE_CEILING));
        let phones = &phones[..phones.len().min(usize::from(BATCH_SIZE_CEILING))];

        let mut outcomes: Vec<(String, LookupOutcome)> = Vec::with_capacity(phones.len());
        let mut restarts = 0u32;
        let mut driver = self.factory.open().await?;
        let mut index = 0usize;

        while index < phones.len() {
            if cancel.is_cancelled() {
                let _ = driver.close().await;
                let deferred = phones[index..].to_vec();
                return Ok(BatchReport {
                    outcomes,
                    deferred,
                    restarts,
                });
            }

            if index > 0 {
                tokio::time::sleep(INTRA_BATCH_DELAY).await;
            }

            let phone = &phones[index];
            match self.lookup_one(driver.as_ref(), phone, cancel).await {
                Ok(LookupOutcome::Captcha) => {
                    restarts += 1;
                    warn!(
                        "captcha challenge during batch (restart {restarts}/{MAX_CAPTCHA_RESTARTS})"
                    );
                    let _ = driver.close().await;
                    if restarts > MAX_CAPTCHA_RESTARTS {
                        let deferred = phones[index..].to_vec();
                        return Ok(BatchReport {
                            outcomes,
                            deferred,
                            restarts,
                        });
                    }
                    // Fresh driver resets the site's session counter; retry
                    // the same phone on it.
                    driver = self.factory.open().await?;
                }
                Ok(outcome) => {
                    outcomes.push((phone.clone(), outcome));
                    index += 1;
                }
                Err(e) => {
                    debug!("driver error looking up {phone}: {e}");
                    outcomes.push((phone.clone(), LookupOutcome::Transient(e.to_string())));
                    index += 1;
                }
            }
        }

        let _ = driver.close().await;

        let attempted = outcomes.len();
        let successes = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, LookupOutcome::Resolved(_) | LookupOutcome::Unknown))
            .count();
        if attempted > 0 {
            self.adapt(successes as f64 / attempted as f64);
        }

        Ok(BatchReport {
            outcomes,
            deferred: Vec::new(),
            restarts,
        })
    }

    /// One lookup on the open driver. `Captcha` means the page challenged
    /// before the form could be used.
    async fn lookup_one(
        &mut self,
        driver: &dyn PageDriver,
        phone: &str,
        cancel: &CancellationToken,
    ) -> Result<LookupOutcome, DriverError> {
        let url = self.carrier_site_url.clone();
        let strategies = [
            WaitStrategy::Selector(CARRIER_INPUT_SELECTOR.to_string()),
            WaitStrategy::Settle(Duration::from_secs(1)),
        ];
        if let Err(e) = self.nav.navigate(driver, &url, &strategies, cancel).await {
            return Ok(LookupOutcome::Transient(e.to_string()));
        }

        if self.captcha_detection && self.detector.detect(driver).await? {
            return Ok(LookupOutcome::Captcha);
        }

        driver.type_text(CARRIER_INPUT_SELECTOR, phone).await?;
        driver.press_enter().await?;
        tokio::time::sleep(RESULT_SETTLE).await;

        let text = driver.text().await?;
        match parse_carrier(&text) {
            Some(carrier) => Ok(LookupOutcome::Resolved(carrier)),
            None => Ok(LookupOutcome::Unknown),
        }
    }

    /// Success rate < 50% shrinks the batch (floor 3); ≥ 80% grows it
    /// (ceiling 5).
    fn adapt(&mut self, success_rate: f64) {
        let before = self.size;
        if success_rate < 0.5 {
            self.size = self.size.saturating_sub(1).max(BATCH_SIZE_FLOOR);
        } else if success_rate >= 0.8 {
            self.size = (self.size + 1).min(BATCH_SIZE_CEILING);
        }
        if self.size != before {
            info!(
                "batch size adapted {before} -> {} (success rate {:.0}%)",
                self.size,
                success_rate * 100.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inter_batch_delay_stays_in_range() {
        for _ in 0..100 {
            let delay = BatchManager::inter_batch_delay();
            assert!(delay >= INTER_BATCH_DELAY_MIN && delay <= INTER_BATCH_DELAY_MAX);
        }
    }
}

//! Carrier resolution for extracted phone numbers.
//!
//! Cache-first: the provider cache short-circuits anything fresh; the rest
//! is dispatched to the batch manager in driver-bounded batches. Every
//! resolution, including the "Unknown" sentinel, is written back through
//! both cache layers.

mod batch;

pub use batch::{BatchManager, BatchReport, INTER_BATCH_DELAY_MAX, INTER_BATCH_DELAY_MIN};

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{ErrorClass, EventBus, LogLevel, ScrapeEvent};
use crate::provider_cache::ProviderCache;
use crate::retry_queue::{RetryKind, RetryQueue};
use crate::session::PROVIDER_UNKNOWN;

/// Input field the phone number is typed into on the carrier site
pub const CARRIER_INPUT_SELECTOR: &str = "input[name=\"number\"], input[type=\"tel\"]";

/// Tagged result of a single lookup; the batch manager switches on this
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Carrier parsed from the result page
    Resolved(String),
    /// The page served a captcha challenge before the form could be used
    Captcha,
    /// Page loaded and was parsed, but no carrier pattern matched
    Unknown,
    /// Driver or navigation failure; worth retrying later
    Transient(String),
}

/// `serviced by <X>/<Y>` — the resolved carrier is the last token after
/// the slash
static SERVICED_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)serviced\s+by\s+(\S+)").expect("serviced-by pattern is valid")
});

/// Parse the carrier from the result page text.
///
/// Case-insensitive; returns `None` when the pattern is absent so the
/// caller can fall back to "Unknown".
#[must_use]
pub fn parse_carrier(text: &str) -> Option<String> {
    let captures = SERVICED_BY.captures(text)?;
    let token = captures.get(1)?.as_str();
    let carrier = token.split('/').next_back()?.trim();
    if carrier.is_empty() {
        None
    } else {
        Some(carrier.to_string())
    }
}

/// Resolves carriers for batches of phones, cache-first
pub struct CarrierLookupService {
    cache: Arc<ProviderCache>,
    retry_queue: RetryQueue,
    events: Arc<EventBus>,
    batch: Mutex<BatchManager>,
}

impl CarrierLookupService {
    #[must_use]
    pub fn new(
        cache: Arc<ProviderCache>,
        retry_queue: RetryQueue,
        events: Arc<EventBus>,
        batch: BatchManager,
    ) -> Self {
        Self {
            cache,
            retry_queue,
            events,
            batch: Mutex::new(batch),
        }
    }

    /// Opaque adaptive-batch state for the session checkpoint
    pub async fn batch_state(&self) -> serde_json::Value {
        self.batch.lock().await.state()
    }

    /// Restore adaptive-batch state from a checkpoint
    pub async fn restore_batch_state(&self, state: &serde_json::Value) {
        self.batch.lock().await.restore(state);
    }

    /// Resolve carriers for `phones`.
    ///
    /// Returns a map covering every input phone; unresolved numbers map to
    /// "Unknown". Transient and captcha-deferred numbers are additionally
    /// enqueued on the retry queue so a later drain can upgrade them.
    pub async fn lookup_all(
        &self,
        session_id: &str,
        phones: &[String],
        cancel: &CancellationToken,
    ) -> HashMap<String, String> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();

        for phone in phones {
            if resolved.contains_key(phone) || misses.contains(phone) {
                continue;
            }
            match self.cache.get(phone).await {
                Ok(Some(carrier)) => {
                    debug!("cache hit for {phone}: {carrier}");
                    resolved.insert(phone.clone(), carrier);
                }
                Ok(None) => misses.push(phone.clone()),
                Err(e) => {
                    warn!("provider cache read failed for {phone}: {e:#}");
                    misses.push(phone.clone());
                }
            }
        }

        let mut remaining = misses.as_slice();
        let mut first_batch = true;
        while !remaining.is_empty() && !cancel.is_cancelled() {
            if !first_batch {
                // Shaped delay between driver sessions; taken outside the
                // batch lock so other shared state stays reachable.
                tokio::time::sleep(BatchManager::inter_batch_delay()).await;
            }
            first_batch = false;

            let mut batch = self.batch.lock().await;
            let chunk_len = batch.next_chunk_size().min(remaining.len());
            let (chunk, rest) = remaining.split_at(chunk_len);

            match batch.run_batch(chunk, cancel).await {
                Ok(report) => {
                    drop(batch);
                    self.apply_report(session_id, report, &mut resolved).await;
                }
                Err(e) => {
                    drop(batch);
                    warn!("batch driver failed to open: {e}");
                    self.events.emit(ScrapeEvent::error(
                        session_id,
                        ErrorClass::Lookup,
                        format!("lookup batch failed: {e}"),
                        true,
                    ));
                    for phone in chunk {
                        self.defer(session_id, phone).await;
                        resolved.insert(phone.clone(), PROVIDER_UNKNOWN.to_string());
                    }
                }
            }
            remaining = rest;
        }

        // Cancellation (or exhaustion) leaves the rest unresolved
        for phone in remaining {
            resolved
                .entry(phone.clone())
                .or_insert_with(|| PROVIDER_UNKNOWN.to_string());
        }

        resolved
    }

    /// Resolve one phone through a single-item batch (retry-drain path)
    pub async fn lookup_single(
        &self,
        session_id: &str,
        phone: &str,
        cancel: &CancellationToken,
    ) -> LookupOutcome {
        if let Ok(Some(carrier)) = self.cache.get(phone).await {
            return LookupOutcome::Resolved(carrier);
        }

        let chunk = [phone.to_string()];
        let mut batch = self.batch.lock().await;
        match batch.run_batch(&chunk, cancel).await {
            Ok(report) => {
                drop(batch);
                if let Some((_, outcome)) = report.outcomes.into_iter().next() {
                    self.write_back(session_id, phone, &outcome).await;
                    outcome
                } else {
                    LookupOutcome::Captcha
                }
            }
            Err(e) => LookupOutcome::Transient(e.to_string()),
        }
    }

    async fn apply_report(
        &self,
        session_id: &str,
        report: BatchReport,
        resolved: &mut HashMap<String, String>,
    ) {
        if report.restarts > 0 {
            self.events.emit(ScrapeEvent::log(
                session_id,
                LogLevel::Warn,
                format!(
                    "captcha challenge during carrier lookup; driver restarted {} time(s)",
                    report.restarts
                ),
            ));
        }

        for (phone, outcome) in &report.outcomes {
            self.write_back(session_id, phone, outcome).await;
            let carrier = match outcome {
                LookupOutcome::Resolved(c) => c.clone(),
                _ => PROVIDER_UNKNOWN.to_string(),
            };
            resolved.insert(phone.clone(), carrier);
        }

        for phone in &report.deferred {
            self.defer(session_id, phone).await;
            resolved.insert(phone.clone(), PROVIDER_UNKNOWN.to_string());
        }
    }

    /// Cache what was actually resolved; schedule retries for the rest
    async fn write_back(&self, session_id: &str, phone: &str, outcome: &LookupOutcome) {
        match outcome {
            LookupOutcome::Resolved(carrier) => {
                if let Err(e) = self.cache.put(phone, carrier).await {
                    warn!("cache write failed for {phone}: {e:#}");
                }
            }
            LookupOutcome::Unknown => {
                // Cached with the short TTL so carrier-database updates get
                // another chance tomorrow
                if let Err(e) = self.cache.put(phone, PROVIDER_UNKNOWN).await {
                    warn!("cache write failed for {phone}: {e:#}");
                }
            }
            LookupOutcome::Transient(cause) => {
                self.events.emit(ScrapeEvent::error(
                    session_id,
                    ErrorClass::Lookup,
                    format!("lookup failed for {phone}: {cause}"),
                    true,
                ));
                self.defer(session_id, phone).await;
            }
            LookupOutcome::Captcha => {
                self.defer(session_id, phone).await;
            }
        }
    }

    async fn defer(&self, session_id: &str, phone: &str) {
        let payload = serde_json::json!({ "phone": phone });
        if let Err(e) = self
            .retry_queue
            .enqueue(session_id, RetryKind::Lookup, payload)
            .await
        {
            warn!("failed to enqueue lookup retry for {phone}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serviced_by_pattern() {
        assert_eq!(
            parse_carrier("This number is Serviced by TELKOM/TELKOM today"),
            Some("TELKOM".to_string())
        );
        assert_eq!(
            parse_carrier("serviced by VODACOM/CELLC"),
            Some("CELLC".to_string())
        );
    }

    #[test]
    fn takes_last_token_after_slash() {
        assert_eq!(
            parse_carrier("serviced by A/B/MTN"),
            Some("MTN".to_string())
        );
    }

    #[test]
    fn no_pattern_means_none() {
        assert_eq!(parse_carrier("no results for this number"), None);
        assert_eq!(parse_carrier(""), None);
    }

    #[test]
    fn pattern_is_case_insensitive() {
        assert_eq!(
            parse_carrier("SERVICED BY telkom/telkom"),
            Some("telkom".to_string())
        );
    }
}

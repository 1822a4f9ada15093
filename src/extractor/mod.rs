//! Scroll-and-harvest extraction of business listings for one
//! (town, industry) pair.
//!
//! The extractor drives the worker's Page Driver through the map provider's
//! results pane: navigate, wait for the feed, then scroll until two
//! consecutive rounds yield nothing new, the per-pair cap is hit, or the
//! session is cancelled. Dedup happens twice: inside the pair and against
//! the session-wide set.

mod js_scripts;

pub use js_scripts::{HARVEST_SCRIPT, RESULTS_SELECTOR, SCROLL_SCRIPT};

use dashmap::DashSet;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::navigation::{NavFailure, NavigationManager, WaitStrategy};
use crate::page_driver::{DriverError, PageDriver};
use crate::session::{Assignment, BusinessRecord};

/// Settle period between scroll rounds
const SCROLL_SETTLE: Duration = Duration::from_millis(800);
/// Consecutive empty rounds that end the scroll loop
const EMPTY_ROUNDS_TO_STOP: u32 = 2;

/// Raw listing fields as the harvest script returns them
#[derive(Debug, Clone, Deserialize)]
struct RawListing {
    name: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Result of a completed (or cancelled) extraction
#[derive(Debug, Clone)]
pub struct Harvest {
    /// Records new to the session, in page order
    pub records: Vec<BusinessRecord>,
    /// The per-pair hard cap ended the loop
    pub hit_cap: bool,
    /// Cancellation ended the loop; records hold what was gathered
    pub cancelled: bool,
}

/// Why extraction failed; partial results are preserved either way
#[derive(Debug)]
pub struct ExtractionFailure {
    pub partial: Vec<BusinessRecord>,
    pub cause: ExtractionCause,
}

#[derive(Debug)]
pub enum ExtractionCause {
    Navigation(NavFailure),
    Driver(DriverError),
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            ExtractionCause::Navigation(e) => write!(f, "extraction navigation failed: {e}"),
            ExtractionCause::Driver(e) => write!(f, "extraction driver failed: {e}"),
        }
    }
}

impl std::error::Error for ExtractionFailure {}

/// Compose the map provider search URL for a pair.
///
/// Query shape: `{base}?q={industry}+in+{town}`.
#[must_use]
pub fn compose_search_url(base: &str, assignment: &Assignment) -> String {
    let query = format!("{} in {}", assignment.industry, assignment.town);
    match url::Url::parse(base) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("q", &query);
            parsed.to_string()
        }
        Err(_) => format!("{base}?q={}", urlencoding::encode(&query)),
    }
}

/// Per-pair listing extractor
#[derive(Debug)]
pub struct ListingExtractor {
    search_base: String,
    cap: usize,
}

impl ListingExtractor {
    #[must_use]
    pub fn new(search_base: impl Into<String>, cap: usize) -> Self {
        Self {
            search_base: search_base.into(),
            cap: cap.max(1),
        }
    }

    /// Harvest deduplicated records for `assignment`.
    ///
    /// `session_seen` is the session-global dedup set; only records that win
    /// insertion there are returned. Mid-loop driver failures preserve the
    /// partial harvest inside the error.
    pub async fn extract(
        &self,
        driver: &dyn PageDriver,
        nav: &mut NavigationManager,
        assignment: &Assignment,
        session_seen: &DashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Harvest, ExtractionFailure> {
        let url = compose_search_url(&self.search_base, assignment);
        let strategies = [
            WaitStrategy::Selector(RESULTS_SELECTOR.to_string()),
            WaitStrategy::Settle(Duration::from_secs(3)),
        ];

        nav.navigate(driver, &url, &strategies, cancel)
            .await
            .map_err(|e| ExtractionFailure {
                partial: Vec::new(),
                cause: ExtractionCause::Navigation(e),
            })?;

        let mut pair_keys: HashSet<String> = HashSet::new();
        let mut records: Vec<BusinessRecord> = Vec::new();
        let mut empty_rounds = 0u32;
        let mut hit_cap = false;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let harvested = match self.harvest_round(driver, assignment).await {
                Ok(listings) => listings,
                Err(e) => {
                    warn!("harvest round failed for {assignment}: {e}");
                    return Err(ExtractionFailure {
                        partial: records,
                        cause: ExtractionCause::Driver(e),
                    });
                }
            };

            let mut new_this_round = 0usize;
            for record in harvested {
                let key = record.dedup_key();
                if !pair_keys.insert(key.clone()) {
                    continue; // duplicate within the pair
                }
                if !session_seen.insert(key) {
                    continue; // another pair already produced it
                }
                records.push(record);
                new_this_round += 1;
                if pair_keys.len() >= self.cap {
                    break;
                }
            }

            debug!(
                "{assignment}: {} new listings this round ({} total)",
                new_this_round,
                records.len()
            );

            if pair_keys.len() >= self.cap {
                hit_cap = true;
                break;
            }
            if new_this_round == 0 {
                empty_rounds += 1;
                if empty_rounds >= EMPTY_ROUNDS_TO_STOP {
                    break;
                }
            } else {
                empty_rounds = 0;
            }

            if let Err(e) = driver.evaluate(SCROLL_SCRIPT).await {
                warn!("scroll failed for {assignment}: {e}");
                return Err(ExtractionFailure {
                    partial: records,
                    cause: ExtractionCause::Driver(e),
                });
            }

            tokio::select! {
                () = tokio::time::sleep(SCROLL_SETTLE) => {}
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        Ok(Harvest {
            records,
            hit_cap,
            cancelled,
        })
    }

    async fn harvest_round(
        &self,
        driver: &dyn PageDriver,
        assignment: &Assignment,
    ) -> Result<Vec<BusinessRecord>, DriverError> {
        let value = driver.evaluate(HARVEST_SCRIPT).await?;
        let raw: Vec<RawListing> = serde_json::from_value(value)
            .map_err(|e| DriverError::Evaluation(format!("harvest payload: {e}")))?;

        Ok(raw
            .into_iter()
            .filter_map(|listing| {
                BusinessRecord::from_extracted(
                    &listing.name,
                    listing.phone.as_deref(),
                    listing.address,
                    listing.url,
                    assignment,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_uses_plus_separated_query() {
        let pair = Assignment::new("A", "Plumbers");
        let url = compose_search_url("https://maps.example/search", &pair);
        assert_eq!(url, "https://maps.example/search?q=Plumbers+in+A");
    }

    #[test]
    fn search_url_appends_to_existing_query() {
        let pair = Assignment::new("B", "Electricians");
        let url = compose_search_url("https://maps.example/search?api=1", &pair);
        assert_eq!(url, "https://maps.example/search?api=1&q=Electricians+in+B");
    }
}

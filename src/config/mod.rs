//! Session configuration: the validated shape of a scraping request.
//!
//! All knobs the external surface recognises live here. A config is built
//! through [`SessionConfigBuilder`] which enforces the legal ranges at
//! construction, so the rest of the core never re-validates.

mod builder;

pub use builder::{ConfigError, SessionConfigBuilder};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::Assignment;

/// Hard ceiling on carrier-lookup batch size; never exceeded regardless of config
pub const BATCH_SIZE_CEILING: u8 = 5;
/// Floor the adaptive batch size can shrink to
pub const BATCH_SIZE_FLOOR: u8 = 3;

pub(crate) const DEFAULT_MAX_TOWNS: u8 = 2;
pub(crate) const DEFAULT_MAX_INDUSTRIES: u8 = 2;
pub(crate) const DEFAULT_BATCH_SIZE: u8 = 5;
pub(crate) const DEFAULT_NAV_BASE_DELAY_MS: u64 = 2_000;
pub(crate) const DEFAULT_NAV_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_CACHE_TTL_DAYS: u32 = 30;
pub(crate) const DEFAULT_MEMORY_SOFT_CAP_MB: u64 = 512;
pub(crate) const DEFAULT_LISTING_CAP: usize = 200;
pub(crate) const DEFAULT_MAP_SEARCH_BASE: &str = "https://www.google.com/maps/search/";
pub(crate) const DEFAULT_CARRIER_SITE_URL: &str = "https://www.portability.co.za/";

/// Validated configuration for one scraping session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub(crate) towns: Vec<String>,
    pub(crate) industries: Vec<String>,
    pub(crate) max_towns: u8,
    pub(crate) max_industries: u8,
    pub(crate) enable_captcha_detection: bool,
    pub(crate) batch_size: u8,
    pub(crate) navigation_base_delay_ms: u64,
    pub(crate) navigation_max_retries: u32,
    pub(crate) provider_cache_ttl_days: u32,
    pub(crate) worker_memory_soft_cap_mb: u64,
    pub(crate) listing_cap_per_pair: usize,
    pub(crate) map_search_base: String,
    pub(crate) carrier_site_url: String,
}

impl SessionConfig {
    /// Start building a config
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Ordered towns for this session
    #[must_use]
    pub fn towns(&self) -> &[String] {
        &self.towns
    }

    /// Ordered industries for this session
    #[must_use]
    pub fn industries(&self) -> &[String] {
        &self.industries
    }

    /// Concurrency cap on parallel towns, 1..=3
    #[must_use]
    pub fn max_towns(&self) -> u8 {
        self.max_towns
    }

    /// Concurrency cap on parallel industries per town, 1..=3
    #[must_use]
    pub fn max_industries(&self) -> u8 {
        self.max_industries
    }

    /// Whether the captcha pre-check runs before each lookup
    #[must_use]
    pub fn enable_captcha_detection(&self) -> bool {
        self.enable_captcha_detection
    }

    /// Initial carrier-lookup batch size, 3..=5
    #[must_use]
    pub fn batch_size(&self) -> u8 {
        self.batch_size
    }

    /// Base delay for navigation retry backoff
    #[must_use]
    pub fn navigation_base_delay(&self) -> Duration {
        Duration::from_millis(self.navigation_base_delay_ms)
    }

    /// Maximum in-place navigation retries before the retry queue takes over
    #[must_use]
    pub fn navigation_max_retries(&self) -> u32 {
        self.navigation_max_retries
    }

    /// TTL for resolved provider-cache entries ("Unknown" is always 1 day)
    #[must_use]
    pub fn provider_cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.provider_cache_ttl_days) * 24 * 3600)
    }

    /// Soft memory cap per worker, in MiB
    #[must_use]
    pub fn worker_memory_soft_cap_mb(&self) -> u64 {
        self.worker_memory_soft_cap_mb
    }

    /// Hard cap on listings harvested per (town, industry) pair
    #[must_use]
    pub fn listing_cap_per_pair(&self) -> usize {
        self.listing_cap_per_pair
    }

    /// Base URL listings are searched under
    #[must_use]
    pub fn map_search_base(&self) -> &str {
        &self.map_search_base
    }

    /// Home page of the carrier-lookup site
    #[must_use]
    pub fn carrier_site_url(&self) -> &str {
        &self.carrier_site_url
    }

    /// Worker pool size: min(maxTowns × maxIndustries, work list length)
    #[must_use]
    pub fn pool_size(&self) -> usize {
        let configured = usize::from(self.max_towns) * usize::from(self.max_industries);
        configured.min(self.work_list().len()).max(1)
    }

    /// The flattened town×industry work list, town-major order.
    ///
    /// Workers draw from the head, so partial completion is always a prefix
    /// of this order.
    #[must_use]
    pub fn work_list(&self) -> Vec<Assignment> {
        let mut list = Vec::with_capacity(self.towns.len() * self.industries.len());
        for town in &self.towns {
            for industry in &self.industries {
                list.push(Assignment::new(town.clone(), industry.clone()));
            }
        }
        list
    }
}

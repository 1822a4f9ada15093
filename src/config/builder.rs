//! Fluent builder for [`SessionConfig`] with range validation.

use super::*;

/// Validation failure raised at `build()`
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("towns list must not be empty")]
    NoTowns,
    #[error("industries list must not be empty")]
    NoIndustries,
    #[error("town/industry entries must be non-blank")]
    BlankEntry,
    #[error("maxTowns must be in 1..=3, got {0}")]
    MaxTowns(u8),
    #[error("maxIndustries must be in 1..=3, got {0}")]
    MaxIndustries(u8),
    #[error("batchSize must be in 3..=5, got {0}")]
    BatchSize(u8),
    #[error("navigationMaxRetries must be at least 1")]
    NoRetries,
}

/// Builder with documented defaults; see the config module docs
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    towns: Vec<String>,
    industries: Vec<String>,
    max_towns: u8,
    max_industries: u8,
    enable_captcha_detection: bool,
    batch_size: u8,
    navigation_base_delay_ms: u64,
    navigation_max_retries: u32,
    provider_cache_ttl_days: u32,
    worker_memory_soft_cap_mb: u64,
    listing_cap_per_pair: usize,
    map_search_base: String,
    carrier_site_url: String,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            towns: Vec::new(),
            industries: Vec::new(),
            max_towns: DEFAULT_MAX_TOWNS,
            max_industries: DEFAULT_MAX_INDUSTRIES,
            enable_captcha_detection: false,
            batch_size: DEFAULT_BATCH_SIZE,
            navigation_base_delay_ms: DEFAULT_NAV_BASE_DELAY_MS,
            navigation_max_retries: DEFAULT_NAV_MAX_RETRIES,
            provider_cache_ttl_days: DEFAULT_CACHE_TTL_DAYS,
            worker_memory_soft_cap_mb: DEFAULT_MEMORY_SOFT_CAP_MB,
            listing_cap_per_pair: DEFAULT_LISTING_CAP,
            map_search_base: DEFAULT_MAP_SEARCH_BASE.to_string(),
            carrier_site_url: DEFAULT_CARRIER_SITE_URL.to_string(),
        }
    }

    #[must_use]
    pub fn towns<I, S>(mut self, towns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.towns = towns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn industries<I, S>(mut self, industries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.industries = industries.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn max_towns(mut self, n: u8) -> Self {
        self.max_towns = n;
        self
    }

    #[must_use]
    pub fn max_industries(mut self, n: u8) -> Self {
        self.max_industries = n;
        self
    }

    #[must_use]
    pub fn enable_captcha_detection(mut self, enabled: bool) -> Self {
        self.enable_captcha_detection = enabled;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: u8) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn navigation_base_delay_ms(mut self, ms: u64) -> Self {
        self.navigation_base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn navigation_max_retries(mut self, retries: u32) -> Self {
        self.navigation_max_retries = retries;
        self
    }

    #[must_use]
    pub fn provider_cache_ttl_days(mut self, days: u32) -> Self {
        self.provider_cache_ttl_days = days;
        self
    }

    #[must_use]
    pub fn worker_memory_soft_cap_mb(mut self, mb: u64) -> Self {
        self.worker_memory_soft_cap_mb = mb;
        self
    }

    #[must_use]
    pub fn listing_cap_per_pair(mut self, cap: usize) -> Self {
        self.listing_cap_per_pair = cap;
        self
    }

    #[must_use]
    pub fn map_search_base(mut self, base: impl Into<String>) -> Self {
        self.map_search_base = base.into();
        self
    }

    #[must_use]
    pub fn carrier_site_url(mut self, url: impl Into<String>) -> Self {
        self.carrier_site_url = url.into();
        self
    }

    /// Validate and produce the config.
    ///
    /// Range violations fail here, synchronously, and never reach the queue.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        if self.towns.is_empty() {
            return Err(ConfigError::NoTowns);
        }
        if self.industries.is_empty() {
            return Err(ConfigError::NoIndustries);
        }
        if self
            .towns
            .iter()
            .chain(self.industries.iter())
            .any(|s| s.trim().is_empty())
        {
            return Err(ConfigError::BlankEntry);
        }
        if !(1..=3).contains(&self.max_towns) {
            return Err(ConfigError::MaxTowns(self.max_towns));
        }
        if !(1..=3).contains(&self.max_industries) {
            return Err(ConfigError::MaxIndustries(self.max_industries));
        }
        if !(BATCH_SIZE_FLOOR..=BATCH_SIZE_CEILING).contains(&self.batch_size) {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        if self.navigation_max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }

        Ok(SessionConfig {
            towns: self.towns,
            industries: self.industries,
            max_towns: self.max_towns,
            max_industries: self.max_industries,
            enable_captcha_detection: self.enable_captcha_detection,
            batch_size: self.batch_size,
            navigation_base_delay_ms: self.navigation_base_delay_ms,
            navigation_max_retries: self.navigation_max_retries,
            provider_cache_ttl_days: self.provider_cache_ttl_days,
            worker_memory_soft_cap_mb: self.worker_memory_soft_cap_mb,
            listing_cap_per_pair: self.listing_cap_per_pair,
            map_search_base: self.map_search_base,
            carrier_site_url: self.carrier_site_url,
        })
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

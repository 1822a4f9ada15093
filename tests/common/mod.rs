//! Shared test doubles: a scriptable Page Driver over an in-memory "site".
//!
//! One `ScriptedSite` stands in for both external sites. Listing pages are
//! registered against their composed search URLs; carrier responses are
//! keyed by the phone typed into the form. Navigation failures, captcha
//! servings, and gates (navigations that block until released) are all
//! scriptable per test.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use leadscrape::extractor::{compose_search_url, HARVEST_SCRIPT, SCROLL_SCRIPT};
use leadscrape::page_driver::{DriverError, PageDriver, PageDriverFactory};
use leadscrape::session::Assignment;

pub const MAP_BASE: &str = "https://maps.test/search";
pub const CARRIER_URL: &str = "https://carrier.test/";

/// Scriptable behaviour shared by every driver the factory mints
#[derive(Default)]
pub struct ScriptedSite {
    /// search URL -> harvest payload (JSON array of raw listings)
    listings: Mutex<HashMap<String, serde_json::Value>>,
    /// phone -> full result-page text
    carrier_text: Mutex<HashMap<String, String>>,
    /// URL -> remaining navigations that time out
    nav_failures: Mutex<HashMap<String, u32>>,
    /// carrier-home navigation ordinals (1-based) that serve a captcha page
    captcha_navs: Mutex<HashSet<u32>>,
    carrier_nav_count: AtomicU32,
    /// phones whose form submission fails at the driver level
    broken_lookups: Mutex<HashSet<String>>,
    /// URL prefix -> gate; navigations block until permits are released
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub drivers_opened: AtomicUsize,
    pub drivers_closed: AtomicUsize,
}

impl ScriptedSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the listings served for a (town, industry) search
    pub fn serve_listings(&self, assignment: &Assignment, listings: serde_json::Value) {
        let url = compose_search_url(MAP_BASE, assignment);
        self.listings.lock().insert(url, listings);
    }

    /// Script the carrier site's result text for one phone
    pub fn serve_carrier(&self, phone: &str, text: &str) {
        self.carrier_text.lock().insert(phone.to_string(), text.to_string());
    }

    /// The next `count` navigations to `url` time out
    pub fn fail_navigation(&self, url: &str, count: u32) {
        self.nav_failures.lock().insert(url.to_string(), count);
    }

    /// Serve a captcha page on the given carrier-home navigation ordinal
    pub fn captcha_on_carrier_nav(&self, ordinal: u32) {
        self.captcha_navs.lock().insert(ordinal);
    }

    /// Break form submission for one phone (driver-level error)
    pub fn break_lookup(&self, phone: &str) {
        self.broken_lookups.lock().insert(phone.to_string());
    }

    /// Block navigations whose URL starts with `prefix` until released
    pub fn gate(&self, prefix: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(prefix.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn search_url(&self, assignment: &Assignment) -> String {
        compose_search_url(MAP_BASE, assignment)
    }

    fn gate_for(&self, url: &str) -> Option<Arc<Semaphore>> {
        self.gates
            .lock()
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, gate)| Arc::clone(gate))
    }
}

/// One scripted page; behaviour comes from the shared site
pub struct ScriptedDriver {
    site: Arc<ScriptedSite>,
    current_url: Mutex<String>,
    typed: Mutex<Option<String>>,
    on_captcha_page: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }

        if let Some(gate) = self.site.gate_for(url) {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DriverError::Navigation("gate closed".into()))?;
            permit.forget();
        }

        {
            let mut failures = self.site.nav_failures.lock();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DriverError::Timeout(Duration::from_secs(1)));
                }
            }
        }

        if url.starts_with(CARRIER_URL) {
            let ordinal = self.site.carrier_nav_count.fetch_add(1, Ordering::SeqCst) + 1;
            let captcha = self.site.captcha_navs.lock().contains(&ordinal);
            self.on_captcha_page.store(captcha, Ordering::SeqCst);
        } else {
            self.on_captcha_page.store(false, Ordering::SeqCst);
        }

        *self.current_url.lock() = url.to_string();
        *self.typed.lock() = None;
        Ok(())
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, DriverError> {
        if expression == HARVEST_SCRIPT {
            let url = self.current_url.lock().clone();
            return Ok(self
                .site
                .listings
                .lock()
                .get(&url)
                .cloned()
                .unwrap_or_else(|| serde_json::json!([])));
        }
        if expression == SCROLL_SCRIPT {
            return Ok(serde_json::json!(0));
        }
        if expression.contains("captcha") {
            return Ok(serde_json::json!(self.on_captcha_page.load(Ordering::SeqCst)));
        }
        Ok(serde_json::Value::Null)
    }

    async fn type_text(&self, _selector: &str, text: &str) -> Result<(), DriverError> {
        if self.site.broken_lookups.lock().contains(text) {
            return Err(DriverError::Navigation(format!("submit failed for {text}")));
        }
        *self.typed.lock() = Some(text.to_string());
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn text(&self) -> Result<String, DriverError> {
        if self.on_captcha_page.load(Ordering::SeqCst) {
            return Ok("Please verify you are human to continue".to_string());
        }
        let typed = self.typed.lock().clone();
        if let Some(phone) = typed {
            return Ok(self
                .site
                .carrier_text
                .lock()
                .get(&phone)
                .cloned()
                .unwrap_or_else(|| "no results for this number".to_string()));
        }
        Ok(String::new())
    }

    fn last_status(&self) -> Option<u16> {
        None
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.site.drivers_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Factory handing out drivers bound to one scripted site
pub struct ScriptedFactory {
    site: Arc<ScriptedSite>,
}

impl ScriptedFactory {
    pub fn new(site: Arc<ScriptedSite>) -> Arc<Self> {
        Arc::new(Self { site })
    }
}

#[async_trait]
impl PageDriverFactory for ScriptedFactory {
    async fn open(&self) -> Result<Arc<dyn PageDriver>, DriverError> {
        self.site.drivers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedDriver {
            site: Arc::clone(&self.site),
            current_url: Mutex::new(String::new()),
            typed: Mutex::new(None),
            on_captcha_page: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

/// JSON harvest payload for `n` listings named `{prefix} 1..n` with the
/// given phones (cycled; `None` entries yield phoneless listings)
pub fn listings_payload(prefix: &str, phones: &[Option<&str>]) -> serde_json::Value {
    let items: Vec<serde_json::Value> = phones
        .iter()
        .enumerate()
        .map(|(i, phone)| {
            serde_json::json!({
                "name": format!("{prefix} {}", i + 1),
                "phone": phone,
                "address": format!("{} Main Road", i + 1),
                "url": format!("https://maps.test/place/{prefix}-{}", i + 1),
            })
        })
        .collect();
    serde_json::json!(items)
}

/// Session config wired to the scripted site's URLs
pub fn scripted_config(
    towns: &[&str],
    industries: &[&str],
) -> leadscrape::SessionConfigBuilder {
    leadscrape::SessionConfig::builder()
        .towns(towns.iter().copied())
        .industries(industries.iter().copied())
        .map_search_base(MAP_BASE)
        .carrier_site_url(CARRIER_URL)
}

/// Poll a session until it reaches a terminal status (or paused, when
/// `accept_paused`), bounded by `max_polls` virtual-time steps.
pub async fn wait_for_status(
    core: &leadscrape::ScraperCore,
    session_id: &str,
    target: leadscrape::SessionStatus,
    max_polls: u32,
) -> leadscrape::SessionStatus {
    for _ in 0..max_polls {
        let state = core
            .session_state(session_id)
            .await
            .expect("session should exist");
        if state.status == target || state.status.is_terminal() {
            return state.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    core.session_state(session_id)
        .await
        .expect("session should exist")
        .status
}

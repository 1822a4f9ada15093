//! Captcha detection for pages served by the external sites.
//!
//! The detector only reports; the caller decides how to respond (the batch
//! manager restarts its driver, the navigation manager classifies the
//! failure as terminal).

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::page_driver::{DriverError, PageDriver};

/// DOM probe: recaptcha iframes, captcha-classed elements, g-recaptcha roots
const CAPTCHA_DOM_SCRIPT: &str = r#"
    (() => {
        const iframes = Array.from(document.querySelectorAll('iframe'))
            .some(f => (f.src || '').includes('recaptcha'));
        const classed = document.querySelector('[class*="captcha"]') !== null;
        const grecaptcha = document.querySelector('.g-recaptcha') !== null;
        return iframes || classed || grecaptcha;
    })()
"#;

/// Case-insensitive text phrases that mark a challenge page
static CAPTCHA_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(recaptcha|verify you are human|i'm not a robot)")
        .expect("captcha phrase pattern is valid")
});

/// Detects captcha challenges on the driver's current page
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptchaDetector;

impl CaptchaDetector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check the current page for captcha signals.
    ///
    /// Any one signal is a detection: a 429 on the last navigation, a
    /// recaptcha/captcha DOM node, or a challenge phrase in the page text.
    /// Probe failures are treated as "not detected" so a flaky page never
    /// blocks the lookup path on its own.
    pub async fn detect(&self, driver: &dyn PageDriver) -> Result<bool, DriverError> {
        if driver.last_status() == Some(429) {
            debug!("captcha signal: HTTP 429 on last navigation");
            return Ok(true);
        }

        match driver.evaluate(CAPTCHA_DOM_SCRIPT).await {
            Ok(value) if value.as_bool() == Some(true) => {
                debug!("captcha signal: DOM probe matched");
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) => debug!("captcha DOM probe failed, continuing with text check: {e}"),
        }

        let text = driver.text().await?;
        if CAPTCHA_TEXT.is_match(&text) {
            debug!("captcha signal: challenge phrase in page text");
            return Ok(true);
        }

        Ok(false)
    }
}

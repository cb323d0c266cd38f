//! CAPTCHA detection by iframe source or class/id substring.

use super::page::{PageError, PortalPage};

pub const CAPTCHA_SELECTORS: &[&str] = &[
    "iframe[src*='recaptcha']",
    "iframe[src*='hcaptcha']",
    "iframe[src*='captcha']",
    "iframe[src*='challenges.cloudflare.com']",
    ".g-recaptcha",
    ".h-captcha",
    "[class*='captcha']",
    "[id*='captcha']",
];

/// Returns the first matching selector, if any.
pub async fn detect(page: &dyn PortalPage) -> Result<Option<&'static str>, PageError> {
    for selector in CAPTCHA_SELECTORS {
        if page.exists(selector).await? {
            return Ok(Some(selector));
        }
    }
    Ok(None)
}

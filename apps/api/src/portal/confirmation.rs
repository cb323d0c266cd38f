//! Success detection and confirmation-handle extraction.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::PortalFamily;

static HANDLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:confirmation|reference|application|submission|tracking)\s*(?:number|no\.?|id|#|code)?\s*(?:is)?\s*[:#]?\s*([A-Z0-9][A-Z0-9\-]{3,39})",
    )
    .expect("confirmation handle pattern is valid")
});

static SUCCESS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(confirmation|thank[-_]?you|thanks|success|submitted|application[-_]received)")
        .expect("success url pattern is valid")
});

const SUCCESS_PHRASES: &[&str] = &[
    "thank you for applying",
    "thanks for applying",
    "application has been submitted",
    "application was submitted",
    "application has been received",
    "we have received your application",
    "we've received your application",
    "successfully submitted",
];

pub fn url_signals_success(url: &str) -> bool {
    SUCCESS_URL.is_match(url)
}

pub fn text_signals_success(text: &str) -> bool {
    let text = text.to_lowercase();
    SUCCESS_PHRASES.iter().any(|p| text.contains(p))
}

/// First handle-looking token after a confirmation keyword. The token must
/// contain a digit so ordinary words are never mistaken for a handle.
pub fn extract(text: &str) -> Option<String> {
    HANDLE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('-'))
        .find(|t| t.chars().any(|c| c.is_ascii_digit()))
        .map(String::from)
}

/// Fallback handle when the portal shows none, e.g. `GH-20261018143005`.
pub fn synthesize(family: PortalFamily, at: DateTime<Utc>) -> String {
    format!("{}-{}", family.handle_prefix(), at.format("%Y%m%d%H%M%S"))
}

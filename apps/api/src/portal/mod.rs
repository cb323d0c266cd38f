//! Portal Driver: drives one browser session through a career portal's
//! apply flow and reports what happened.
//!
//! A driver is single-use: `PortalDriver::apply` opens a fresh page, walks the
//! per-family state machine, always takes a terminal screenshot and always
//! closes the page before returning.

pub mod captcha;
pub mod confirmation;
pub mod driver;
pub mod fields;
pub mod page;
pub mod selectors;
pub mod webdriver;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::directory::{CandidateProfile, Document};
use crate::vault::{lease_key, CredentialLease};

pub use driver::PortalDriver;
pub use page::{LabelStrategy, PageError, PageFactory, PortalPage, Question, QuestionKind};
pub use webdriver::WebDriverFactory;

// ────────────────────────────────────────────────────────────────────────────
// Portal family
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalFamily {
    Greenhouse,
    Lever,
    Workday,
    Generic,
}

impl PortalFamily {
    /// Classifies a posting URL by host.
    pub fn detect(url: &str) -> PortalFamily {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        if host == "greenhouse.io" || host.ends_with(".greenhouse.io") {
            PortalFamily::Greenhouse
        } else if host == "lever.co" || host.ends_with(".lever.co") {
            PortalFamily::Lever
        } else if host.contains("workday") || host.contains("myworkdayjobs") {
            PortalFamily::Workday
        } else {
            PortalFamily::Generic
        }
    }

    /// Provider name used for credential lookup and ATS status polling.
    pub fn provider(&self) -> &'static str {
        match self {
            PortalFamily::Greenhouse => "greenhouse",
            PortalFamily::Lever => "lever",
            PortalFamily::Workday => "workday",
            PortalFamily::Generic => "generic",
        }
    }

    pub fn from_provider(provider: &str) -> Option<PortalFamily> {
        match provider {
            "greenhouse" => Some(PortalFamily::Greenhouse),
            "lever" => Some(PortalFamily::Lever),
            "workday" => Some(PortalFamily::Workday),
            "generic" => Some(PortalFamily::Generic),
            _ => None,
        }
    }

    /// Whether an ATS status endpoint exists for this family.
    pub fn has_ats(&self) -> bool {
        !matches!(self, PortalFamily::Generic)
    }

    /// Prefix for synthesized confirmation handles.
    pub fn handle_prefix(&self) -> &'static str {
        match self {
            PortalFamily::Greenhouse => "GH",
            PortalFamily::Lever => "LV",
            PortalFamily::Workday => "WD",
            PortalFamily::Generic => "APP",
        }
    }
}

impl fmt::Display for PortalFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.provider())
    }
}

/// Host of a URL with any leading `www.` removed.
pub fn company_domain(url: &str) -> Option<String> {
    let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyErrorKind {
    NavigationFailed,
    AuthRequired,
    ApplyControlNotFound,
    FormFillIncomplete,
    UploadFailed,
    CaptchaBlocked,
    SubmitButtonMissing,
    UnverifiedSubmission,
    DriverInternal,
    /// Stopped by a cancellation token before the submit click.
    Cancelled,
}

impl ApplyErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyErrorKind::NavigationFailed => "NavigationFailed",
            ApplyErrorKind::AuthRequired => "AuthRequired",
            ApplyErrorKind::ApplyControlNotFound => "ApplyControlNotFound",
            ApplyErrorKind::FormFillIncomplete => "FormFillIncomplete",
            ApplyErrorKind::UploadFailed => "UploadFailed",
            ApplyErrorKind::CaptchaBlocked => "CaptchaBlocked",
            ApplyErrorKind::SubmitButtonMissing => "SubmitButtonMissing",
            ApplyErrorKind::UnverifiedSubmission => "UnverifiedSubmission",
            ApplyErrorKind::DriverInternal => "DriverInternal",
            ApplyErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Transient failures the Submission Worker may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApplyErrorKind::NavigationFailed | ApplyErrorKind::DriverInternal
        )
    }
}

impl fmt::Display for ApplyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyError {
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    pub fn new(kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApplyError {}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ────────────────────────────────────────────────────────────────────────────

/// Everything the driver may type or upload. Nothing else is ever submitted.
#[derive(Debug)]
pub struct ProfileBundle {
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub portfolio_url: Option<String>,
    pub resume: Option<Document>,
    pub cover_letter: Option<Document>,
    pub custom_answers: HashMap<String, String>,
    pub work_authorized: bool,
    pub requires_sponsorship: bool,
    /// Keyed by `provider` or `provider:domain`.
    pub credentials: HashMap<String, CredentialLease>,
}

impl ProfileBundle {
    pub fn from_profile(profile: &CandidateProfile) -> Self {
        Self {
            full_name: profile.full_name.clone(),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            linkedin_url: profile.linkedin_url.clone(),
            portfolio_url: profile.portfolio_url.clone(),
            resume: profile.resume.clone(),
            cover_letter: profile.cover_letter.clone(),
            custom_answers: profile.custom_answers.clone(),
            work_authorized: profile.work_authorized,
            requires_sponsorship: profile.requires_sponsorship,
            credentials: HashMap::new(),
        }
    }

    pub fn add_credential(&mut self, lease: CredentialLease) {
        if !lease.is_empty() {
            self.credentials.insert(lease.key(), lease);
        }
    }

    /// Domain-specific lease first, then the provider-wide one.
    pub fn credential_for(&self, provider: &str, domain: Option<&str>) -> Option<&CredentialLease> {
        domain
            .and_then(|d| self.credentials.get(&lease_key(provider, Some(d))))
            .or_else(|| self.credentials.get(provider))
            .filter(|lease| !lease.is_empty())
    }

    pub fn first_name(&self) -> Option<&str> {
        self.full_name.split_whitespace().next()
    }

    pub fn last_name(&self) -> Option<String> {
        let rest: Vec<&str> = self.full_name.split_whitespace().skip(1).collect();
        (!rest.is_empty()).then(|| rest.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub headless: bool,
    pub captcha_wait: Duration,
    pub action_timeout: Duration,
    pub budget: Duration,
    pub max_retries: u32,
    /// How long to wait for a success signal after submitting.
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            headless: true,
            captcha_wait: Duration::from_secs(15),
            action_timeout: Duration::from_secs(30),
            budget: Duration::from_secs(300),
            max_retries: 3,
            confirm_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone)]
pub struct Screenshot {
    pub name: String,
    pub png: Bytes,
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screenshot")
            .field("name", &self.name)
            .field("bytes", &self.png.len())
            .finish()
    }
}

/// One state-machine step, kept for the attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub success: bool,
    pub confirmation: Option<String>,
    pub screenshots: Vec<Screenshot>,
    pub error: Option<ApplyError>,
    pub family: PortalFamily,
    pub final_url: Option<String>,
    /// True once the submit control was clicked.
    pub submitted: bool,
    pub steps: Vec<StepRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    #[test]
    fn test_family_detection() {
        assert_eq!(
            PortalFamily::detect("https://boards.greenhouse.io/acme/jobs/42"),
            PortalFamily::Greenhouse
        );
        assert_eq!(
            PortalFamily::detect("https://jobs.lever.co/acme/123/apply"),
            PortalFamily::Lever
        );
        assert_eq!(
            PortalFamily::detect("https://acme.wd5.myworkdayjobs.com/en-US/careers/job/1"),
            PortalFamily::Workday
        );
        assert_eq!(
            PortalFamily::detect("https://careers.acme.com/jobs/1"),
            PortalFamily::Generic
        );
        // Path mentions do not count.
        assert_eq!(
            PortalFamily::detect("https://evil.example/greenhouse.io"),
            PortalFamily::Generic
        );
        assert_eq!(PortalFamily::detect("not a url"), PortalFamily::Generic);
    }

    #[test]
    fn test_company_domain_strips_www() {
        assert_eq!(
            company_domain("https://www.acme.com/careers"),
            Some("acme.com".to_string())
        );
    }

    #[test]
    fn test_name_split() {
        let bundle = ProfileBundle {
            full_name: "Ada  King Lovelace".to_string(),
            email: "ada@x.io".to_string(),
            phone: None,
            linkedin_url: None,
            portfolio_url: None,
            resume: None,
            cover_letter: None,
            custom_answers: HashMap::new(),
            work_authorized: true,
            requires_sponsorship: false,
            credentials: HashMap::new(),
        };
        assert_eq!(bundle.first_name(), Some("Ada"));
        assert_eq!(bundle.last_name().as_deref(), Some("King Lovelace"));
    }

    #[test]
    fn test_credential_lookup_prefers_domain() {
        let mut bundle = ProfileBundle {
            full_name: "Ada".to_string(),
            email: "ada@x.io".to_string(),
            phone: None,
            linkedin_url: None,
            portfolio_url: None,
            resume: None,
            cover_letter: None,
            custom_answers: HashMap::new(),
            work_authorized: true,
            requires_sponsorship: false,
            credentials: HashMap::new(),
        };
        let lease = |domain: Option<&str>, user: &str| {
            CredentialLease::new(
                "workday",
                domain.map(String::from),
                Zeroizing::new(user.to_string()),
                Zeroizing::new("pw".to_string()),
            )
        };
        bundle.add_credential(lease(None, "wide"));
        bundle.add_credential(lease(Some("acme.com"), "acme"));
        bundle.add_credential(CredentialLease::empty("lever", None));

        assert_eq!(
            bundle.credential_for("workday", Some("acme.com")).unwrap().username(),
            "acme"
        );
        assert_eq!(
            bundle.credential_for("workday", Some("other.com")).unwrap().username(),
            "wide"
        );
        assert!(bundle.credential_for("lever", None).is_none());
    }
}

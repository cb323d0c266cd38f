//! Read-only shapes owned by external collaborators (ingestion, profiles,
//! scoring). The core consumes them through `crate::directory::Directory`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub title: String,
    pub company: String,
    pub url: Option<String>,
    pub apply_url: Option<String>,
    pub location: Option<String>,
    pub salary_max: Option<i64>,
    pub recruiter_id: Option<Uuid>,
}

impl Posting {
    /// Explicit apply URL first, primary URL as the fallback.
    pub fn navigation_url(&self) -> Option<&str> {
        self.apply_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .or(self.url.as_deref().filter(|u| !u.trim().is_empty()))
    }

    /// Postings without any external URL are applied to internally.
    pub fn is_external(&self) -> bool {
        self.navigation_url()
            .map(|u| u.starts_with("http://") || u.starts_with("https://"))
            .unwrap_or(false)
    }
}

/// A named document blob supplied by the artifact generator.
#[derive(Clone)]
pub struct Document {
    pub filename: String,
    pub content: Bytes,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("filename", &self.filename)
            .field("bytes", &self.content.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub portfolio_url: Option<String>,
    pub resume: Option<Document>,
    pub cover_letter: Option<Document>,
    /// Screening question fragment → answer, supplied by the candidate.
    pub custom_answers: HashMap<String, String>,
    pub work_authorized: bool,
    pub requires_sponsorship: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationPreferences {
    pub enabled: bool,
    pub daily_cap: u32,
    /// Hours of day (0–23, candidate local time) the candidate prefers.
    pub preferred_hours: Option<Vec<u32>>,
    pub excluded_companies: Vec<String>,
    pub locations: Vec<String>,
    pub min_salary: Option<i64>,
    pub utc_offset_minutes: i32,
}

impl Default for AutomationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_cap: 50,
            preferred_hours: None,
            excluded_companies: Vec::new(),
            locations: Vec::new(),
            min_salary: None,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchScore {
    pub candidate_id: Uuid,
    pub posting_id: Uuid,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

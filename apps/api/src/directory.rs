//! Read access to collaborator-owned data: postings, candidate profiles,
//! automation preferences and match scores.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::models::directory::{
    AutomationPreferences, CandidateProfile, Document, Posting,
};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Corrupt collaborator row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn posting(&self, id: Uuid) -> Result<Option<Posting>, DirectoryError>;

    async fn profile(&self, candidate_id: Uuid) -> Result<Option<CandidateProfile>, DirectoryError>;

    /// Falls back to `AutomationPreferences::default()` for candidates who
    /// never saved any.
    async fn preferences(&self, candidate_id: Uuid) -> Result<AutomationPreferences, DirectoryError>;

    async fn match_score(
        &self,
        candidate_id: Uuid,
        posting_id: Uuid,
    ) -> Result<Option<f64>, DirectoryError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct PostingRow {
    id: Uuid,
    title: String,
    company: String,
    url: Option<String>,
    apply_url: Option<String>,
    location: Option<String>,
    salary_max: Option<i64>,
    recruiter_id: Option<Uuid>,
}

impl From<PostingRow> for Posting {
    fn from(row: PostingRow) -> Self {
        Posting {
            id: row.id,
            title: row.title,
            company: row.company,
            url: row.url,
            apply_url: row.apply_url,
            location: row.location,
            salary_max: row.salary_max,
            recruiter_id: row.recruiter_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: Uuid,
    full_name: String,
    email: String,
    phone: Option<String>,
    linkedin_url: Option<String>,
    portfolio_url: Option<String>,
    resume_filename: Option<String>,
    resume_content: Option<Vec<u8>>,
    cover_letter_filename: Option<String>,
    cover_letter_content: Option<Vec<u8>>,
    custom_answers: Value,
    work_authorized: bool,
    requires_sponsorship: bool,
}

fn document(filename: Option<String>, content: Option<Vec<u8>>) -> Option<Document> {
    match (filename, content) {
        (Some(filename), Some(content)) if !content.is_empty() => Some(Document {
            filename,
            content: Bytes::from(content),
        }),
        _ => None,
    }
}

impl TryFrom<ProfileRow> for CandidateProfile {
    type Error = DirectoryError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        let custom_answers: HashMap<String, String> = serde_json::from_value(row.custom_answers)
            .map_err(|e| DirectoryError::Corrupt(format!("custom_answers of {}: {e}", row.id)))?;
        Ok(CandidateProfile {
            id: row.id,
            full_name: row.full_name,
            email: row.email,
            phone: row.phone,
            linkedin_url: row.linkedin_url,
            portfolio_url: row.portfolio_url,
            resume: document(row.resume_filename, row.resume_content),
            cover_letter: document(row.cover_letter_filename, row.cover_letter_content),
            custom_answers,
            work_authorized: row.work_authorized,
            requires_sponsorship: row.requires_sponsorship,
        })
    }
}

#[derive(Debug, FromRow)]
struct PreferencesRow {
    enabled: bool,
    daily_cap: i32,
    preferred_hours: Option<Vec<i32>>,
    excluded_companies: Vec<String>,
    locations: Vec<String>,
    min_salary: Option<i64>,
    utc_offset_minutes: i32,
}

impl From<PreferencesRow> for AutomationPreferences {
    fn from(row: PreferencesRow) -> Self {
        AutomationPreferences {
            enabled: row.enabled,
            daily_cap: row.daily_cap.max(0) as u32,
            preferred_hours: row.preferred_hours.map(|hours| {
                hours
                    .into_iter()
                    .filter(|h| (0..24).contains(h))
                    .map(|h| h as u32)
                    .collect()
            }),
            excluded_companies: row.excluded_companies,
            locations: row.locations,
            min_salary: row.min_salary,
            utc_offset_minutes: row.utc_offset_minutes,
        }
    }
}

#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn posting(&self, id: Uuid) -> Result<Option<Posting>, DirectoryError> {
        let row: Option<PostingRow> = sqlx::query_as("SELECT * FROM job_postings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Posting::from))
    }

    async fn profile(&self, candidate_id: Uuid) -> Result<Option<CandidateProfile>, DirectoryError> {
        let row: Option<ProfileRow> =
            sqlx::query_as("SELECT * FROM candidate_profiles WHERE id = $1")
                .bind(candidate_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(CandidateProfile::try_from).transpose()
    }

    async fn preferences(&self, candidate_id: Uuid) -> Result<AutomationPreferences, DirectoryError> {
        let row: Option<PreferencesRow> =
            sqlx::query_as("SELECT * FROM automation_preferences WHERE candidate_id = $1")
                .bind(candidate_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(AutomationPreferences::from).unwrap_or_default())
    }

    async fn match_score(
        &self,
        candidate_id: Uuid,
        posting_id: Uuid,
    ) -> Result<Option<f64>, DirectoryError> {
        Ok(sqlx::query_scalar(
            "SELECT score FROM match_scores WHERE candidate_id = $1 AND posting_id = $2",
        )
        .bind(candidate_id)
        .bind(posting_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub use memory::*;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_row_drops_out_of_range_hours() {
        let prefs = AutomationPreferences::from(PreferencesRow {
            enabled: true,
            daily_cap: 20,
            preferred_hours: Some(vec![9, 25, -1, 14]),
            excluded_companies: Vec::new(),
            locations: Vec::new(),
            min_salary: None,
            utc_offset_minutes: 0,
        });
        assert_eq!(prefs.preferred_hours, Some(vec![9, 14]));
    }

    #[test]
    fn test_profile_without_resume_bytes_has_no_document() {
        assert!(document(Some("cv.pdf".to_string()), Some(Vec::new())).is_none());
        assert!(document(None, Some(vec![1, 2])).is_none());
        assert!(document(Some("cv.pdf".to_string()), Some(vec![1])).is_some());
    }

    #[tokio::test]
    async fn test_memory_directory_defaults_preferences() {
        let dir = MemoryDirectory::new();
        let prefs = dir.preferences(Uuid::new_v4()).await.unwrap();
        assert!(prefs.enabled);
        assert_eq!(prefs.daily_cap, 50);
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Enumerations
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    InReview,
    Interview,
    Rejected,
    Offer,
    Accepted,
    Declined,
    Withdrawn,
    Failed,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 10] = [
        ApplicationStatus::Pending,
        ApplicationStatus::Applied,
        ApplicationStatus::InReview,
        ApplicationStatus::Interview,
        ApplicationStatus::Rejected,
        ApplicationStatus::Offer,
        ApplicationStatus::Accepted,
        ApplicationStatus::Declined,
        ApplicationStatus::Withdrawn,
        ApplicationStatus::Failed,
    ];

    /// Statuses the Monitor Pool polls external sources for.
    pub const MONITORED: [ApplicationStatus; 3] = [
        ApplicationStatus::Applied,
        ApplicationStatus::InReview,
        ApplicationStatus::Interview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::InReview => "in_review",
            ApplicationStatus::Interview => "interview",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Offer => "offer",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Declined => "declined",
            ApplicationStatus::Withdrawn => "withdrawn",
            ApplicationStatus::Failed => "failed",
        }
    }

    pub fn is_monitored(&self) -> bool {
        Self::MONITORED.contains(self)
    }

    /// Statuses after which tracking is torn down.
    pub fn ends_tracking(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Rejected
                | ApplicationStatus::Accepted
                | ApplicationStatus::Declined
                | ApplicationStatus::Withdrawn
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown application status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMethod {
    Api,
    Browser,
    Manual,
    Redirect,
}

impl SubmissionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMethod::Api => "api",
            SubmissionMethod::Browser => "browser",
            SubmissionMethod::Manual => "manual",
            SubmissionMethod::Redirect => "redirect",
        }
    }
}

impl FromStr for SubmissionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(SubmissionMethod::Api),
            "browser" => Ok(SubmissionMethod::Browser),
            "manual" => Ok(SubmissionMethod::Manual),
            "redirect" => Ok(SubmissionMethod::Redirect),
            other => Err(format!("unknown submission method '{other}'")),
        }
    }
}

/// Where a piece of status evidence came from. Doubles as `verified_source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Ats,
    Email,
    Manual,
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::Ats => "ats",
            EvidenceSource::Email => "email",
            EvidenceSource::Manual => "manual",
        }
    }

    /// Confidence assigned to observations from this source.
    pub fn confidence(&self) -> f32 {
        match self {
            EvidenceSource::Ats => 0.9,
            EvidenceSource::Email => 0.7,
            EvidenceSource::Manual => 1.0,
        }
    }
}

impl FromStr for EvidenceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ats" => Ok(EvidenceSource::Ats),
            "email" => Ok(EvidenceSource::Email),
            "manual" => Ok(EvidenceSource::Manual),
            other => Err(format!("unknown evidence source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Applied,
    StatusChange,
    EmailReceived,
    InterviewScheduled,
    FollowUp,
    Rejection,
    Offer,
    Withdrawn,
    NoteAdded,
    Verification,
    /// Idempotency sentinel written before the Portal Driver runs.
    SubmissionStarted,
}

impl EventKind {
    const ALL: [EventKind; 11] = [
        EventKind::Applied,
        EventKind::StatusChange,
        EventKind::EmailReceived,
        EventKind::InterviewScheduled,
        EventKind::FollowUp,
        EventKind::Rejection,
        EventKind::Offer,
        EventKind::Withdrawn,
        EventKind::NoteAdded,
        EventKind::Verification,
        EventKind::SubmissionStarted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Applied => "applied",
            EventKind::StatusChange => "status_change",
            EventKind::EmailReceived => "email_received",
            EventKind::InterviewScheduled => "interview_scheduled",
            EventKind::FollowUp => "follow_up",
            EventKind::Rejection => "rejection",
            EventKind::Offer => "offer",
            EventKind::Withdrawn => "withdrawn",
            EventKind::NoteAdded => "note_added",
            EventKind::Verification => "verification",
            EventKind::SubmissionStarted => "submission_started",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Entities
// ────────────────────────────────────────────────────────────────────────────

/// One entry of an Application's artifact log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    pub location: String,
}

impl ArtifactRef {
    pub fn screenshot(location: impl Into<String>) -> Self {
        Self {
            kind: "screenshot".to_string(),
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub candidate_id: Uuid,
    pub posting_id: Uuid,
    pub method: SubmissionMethod,
    pub status: ApplicationStatus,
    pub external_confirmation: Option<String>,
    /// The URL actually used for navigation.
    pub apply_url: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
    pub is_verified: bool,
    pub verified_source: Option<EvidenceSource>,
    pub email_confirmed: bool,
    pub tracking_enabled: bool,
    /// Set while a submission looked complete but produced no confirmation.
    pub unverified_submission: bool,
    pub last_error: Option<String>,
    pub prepared_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Application {
    /// True when the Monitor Pool should keep polling this application.
    pub fn is_monitorable(&self) -> bool {
        self.tracking_enabled
            && (self.status.is_monitored()
                || (self.status == ApplicationStatus::Pending && self.unverified_submission))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub id: Uuid,
    pub application_id: Uuid,
    pub kind: EventKind,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ApplicationEvent {
    pub fn attempt_id(&self) -> Option<&str> {
        self.metadata.get("attempt_id").and_then(|v| v.as_str())
    }
}

/// An event before it is stamped by the store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Value,
}

impl NewEvent {
    pub fn new(kind: EventKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One row of a TrackingConfig's observation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub source: EvidenceSource,
    pub status: Option<ApplicationStatus>,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
    pub detail: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub application_id: Uuid,
    pub ats_system: Option<String>,
    pub external_handle: Option<String>,
    pub check_frequency_minutes: i32,
    pub next_check: DateTime<Utc>,
    pub email_monitoring: bool,
    pub keywords: Vec<String>,
    pub history: Vec<ObservationRecord>,
    pub last_check: Option<DateTime<Utc>>,
}

impl TrackingConfig {
    pub const MIN_CHECK_MINUTES: i32 = 30;
    pub const HISTORY_LIMIT: usize = 50;

    pub fn new(application_id: Uuid, check_frequency_minutes: i32, now: DateTime<Utc>) -> Self {
        let minutes = check_frequency_minutes.max(Self::MIN_CHECK_MINUTES);
        Self {
            application_id,
            ats_system: None,
            external_handle: None,
            check_frequency_minutes: minutes,
            next_check: now + chrono::Duration::minutes(minutes as i64),
            email_monitoring: true,
            keywords: Vec::new(),
            history: Vec::new(),
            last_check: None,
        }
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.check_frequency_minutes.max(Self::MIN_CHECK_MINUTES) as i64)
    }

    pub fn push_history(&mut self, records: impl IntoIterator<Item = ObservationRecord>) {
        self.history.extend(records);
        if self.history.len() > Self::HISTORY_LIMIT {
            let excess = self.history.len() - Self::HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in ApplicationStatus::ALL {
            assert_eq!(status.as_str().parse::<ApplicationStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ApplicationStatus::InReview).unwrap();
        assert_eq!(json, "\"in_review\"");
    }

    #[test]
    fn test_tracking_interval_clamped_to_thirty_minutes() {
        let now = Utc::now();
        let tracking = TrackingConfig::new(Uuid::new_v4(), 5, now);
        assert_eq!(tracking.check_frequency_minutes, 30);
        assert_eq!(tracking.next_check, now + chrono::Duration::minutes(30));
    }

    #[test]
    fn test_history_keeps_most_recent_records() {
        let now = Utc::now();
        let mut tracking = TrackingConfig::new(Uuid::new_v4(), 60, now);
        let records = (0..60).map(|i| ObservationRecord {
            source: EvidenceSource::Ats,
            status: None,
            confidence: 0.9,
            observed_at: now,
            detail: format!("check {i}"),
            error: None,
        });
        tracking.push_history(records);
        assert_eq!(tracking.history.len(), TrackingConfig::HISTORY_LIMIT);
        assert_eq!(tracking.history[0].detail, "check 10");
    }
}

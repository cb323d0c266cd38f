//! Application Store: the durable record of applications, their events and
//! their tracking configuration.
//!
//! Every mutation is computed by `rules` against the locked current row and
//! persisted together with its events in one transaction. Two backends:
//! `PgApplicationStore` (production) and `MemoryApplicationStore` (tests).

pub mod lease;
#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod rules;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::application::{
    Application, ApplicationEvent, ApplicationStatus, ArtifactRef, EvidenceSource, NewEvent,
    ObservationRecord, SubmissionMethod, TrackingConfig,
};

pub use lease::{ApplicationLease, LeaseRegistry};
#[cfg(test)]
pub use memory::MemoryApplicationStore;
pub use postgres::PgApplicationStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Application {0} not found")]
    NotFound(Uuid),

    #[error("Application already exists for candidate {candidate_id} and posting {posting_id}")]
    Duplicate { candidate_id: Uuid, posting_id: Uuid },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Input to `create_application`.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub candidate_id: Uuid,
    pub posting_id: Uuid,
    pub method: SubmissionMethod,
    /// Caller asserts the application is being submitted right away.
    pub submit_intent: bool,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Application),
    AlreadyExists(Application),
}

impl CreateOutcome {
    pub fn into_application(self) -> Application {
        match self {
            CreateOutcome::Created(app) | CreateOutcome::AlreadyExists(app) => app,
        }
    }

    pub fn already_exists(&self) -> bool {
        matches!(self, CreateOutcome::AlreadyExists(_))
    }
}

/// Verification flags to merge onto an application.
#[derive(Debug, Clone, Default)]
pub struct VerificationPatch {
    pub is_verified: Option<bool>,
    pub verified_source: Option<EvidenceSource>,
    pub email_confirmed: Option<bool>,
    /// Clears the evidence-ambiguous marker.
    pub resolve_unverified: bool,
}

/// Partial update of a TrackingConfig. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TrackingPatch {
    pub enabled: Option<bool>,
    pub ats_system: Option<String>,
    pub external_handle: Option<String>,
    pub check_frequency_minutes: Option<i32>,
    pub next_check: Option<DateTime<Utc>>,
    pub email_monitoring: Option<bool>,
    pub keywords: Option<Vec<String>>,
    pub append_history: Vec<ObservationRecord>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl TrackingPatch {
    /// Whether the patch carries a user-facing configuration change (as opposed
    /// to routine monitor bookkeeping).
    pub fn is_configuration_change(&self) -> bool {
        self.enabled.is_some()
            || self.ats_system.is_some()
            || self.external_handle.is_some()
            || self.check_frequency_minutes.is_some()
            || self.email_monitoring.is_some()
            || self.keywords.is_some()
    }
}

/// Everything a status transition writes besides the status itself.
#[derive(Debug, Clone)]
pub struct TransitionEvidence {
    pub event: NewEvent,
    /// Further events committed in the same transaction (e.g. `email_received`).
    pub extra_events: Vec<NewEvent>,
    pub verification: Option<VerificationPatch>,
    pub tracking: Option<TrackingPatch>,
}

impl TransitionEvidence {
    pub fn new(event: NewEvent) -> Self {
        Self {
            event,
            extra_events: Vec::new(),
            verification: None,
            tracking: None,
        }
    }
}

/// Result of one Portal Driver attempt, as committed by the Submission Worker.
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Applied { confirmation: Option<String> },
    Failed { kind: String, message: String },
    /// Looked submitted, but no confirmation was found. Stays `pending`.
    Unverified { message: String },
}

#[derive(Debug, Clone)]
pub struct SubmissionCommit {
    pub attempt_id: String,
    pub navigation_url: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
    pub outcome: SubmissionOutcome,
    pub check_frequency_minutes: i32,
    pub at: DateTime<Utc>,
    /// Source recorded when the commit also verifies the application.
    pub verified_source: Option<EvidenceSource>,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Creates a `pending` application. Duplicates on (candidate, posting)
    /// return the existing row instead of a second one.
    async fn create_application(&self, new: NewApplication) -> Result<CreateOutcome, StoreError>;

    async fn get_application(&self, id: Uuid) -> Result<Application, StoreError>;

    async fn find_application(
        &self,
        candidate_id: Uuid,
        posting_id: Uuid,
    ) -> Result<Option<Application>, StoreError>;

    /// Most recently updated applications of a candidate.
    async fn list_for_candidate(
        &self,
        candidate_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Application>, StoreError>;

    async fn list_by_status(
        &self,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<Application>, StoreError>;

    /// Events in append order.
    async fn events(&self, id: Uuid) -> Result<Vec<ApplicationEvent>, StoreError>;

    /// Validates `to` against the state machine and commits status, events,
    /// verification and tracking changes together.
    async fn transition(
        &self,
        id: Uuid,
        to: ApplicationStatus,
        evidence: TransitionEvidence,
    ) -> Result<Application, StoreError>;

    /// Pure append; never touches status.
    async fn append_event(&self, id: Uuid, event: NewEvent) -> Result<ApplicationEvent, StoreError>;

    async fn attach_artifact(&self, id: Uuid, artifact: ArtifactRef) -> Result<(), StoreError>;

    async fn tracking(&self, id: Uuid) -> Result<Option<TrackingConfig>, StoreError>;

    /// Creates the TrackingConfig on first use. Intervals are clamped to ≥30 min.
    async fn update_tracking(
        &self,
        id: Uuid,
        patch: TrackingPatch,
    ) -> Result<TrackingConfig, StoreError>;

    async fn set_verification(
        &self,
        id: Uuid,
        patch: VerificationPatch,
        event: NewEvent,
    ) -> Result<Application, StoreError>;

    /// Commits the result of a Portal Driver attempt.
    async fn commit_submission(
        &self,
        id: Uuid,
        commit: SubmissionCommit,
    ) -> Result<Application, StoreError>;

    /// Sets or clears the Scheduler slot of a pending application.
    async fn set_schedule(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<(), StoreError>;

    /// Tracked applications whose `next_check ≤ now`.
    async fn find_due_for_monitoring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError>;

    /// Pending applications whose scheduled slot has arrived, earliest first.
    async fn find_due_for_submission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError>;
}

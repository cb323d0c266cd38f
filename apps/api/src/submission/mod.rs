//! Submission Worker: runs one Portal Driver attempt for one application
//! and commits the outcome.
//!
//! Every attempt writes a `submission_started` sentinel before the browser
//! opens and an attempt log before the store commit, so an interrupted
//! process can finish the commit later instead of submitting twice.

pub mod attempt_log;
pub mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::directory::DirectoryError;
use crate::models::application::Application;
use crate::portal::ApplyErrorKind;
use crate::scheduler::Tier;
use crate::store::StoreError;
use crate::vault::VaultError;

pub use attempt_log::{AttemptLog, AttemptRecord};
pub use worker::{MonitorHook, SubmissionWorker, WorkerDeps, WorkerSettings};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone)]
pub struct SubmissionTask {
    pub application_id: Uuid,
    /// Overrides the posting's own URL (e.g. an external link the caller followed).
    pub navigation_url: Option<String>,
    /// `None` for interactive submissions.
    pub tier: Option<Tier>,
    /// The worker skips the task before this instant.
    pub earliest_start: DateTime<Utc>,
    /// 1-based.
    pub attempt: u32,
    /// Hard stop for the whole attempt. The driver budget is clamped to it.
    pub deadline: Option<Instant>,
}

impl SubmissionTask {
    pub fn now(application_id: Uuid) -> Self {
        Self {
            application_id,
            navigation_url: None,
            tier: None,
            earliest_start: Utc::now(),
            attempt: 1,
            deadline: None,
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.navigation_url = url;
        self
    }

    /// Time left before the deadline, `None` when the task has none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Applied {
        confirmation: Option<String>,
    },
    Failed {
        kind: ApplyErrorKind,
        message: String,
    },
    /// Submit clicked, no confirmation seen. Application stays pending.
    Unverified {
        message: String,
    },
    /// Transient failure; nothing committed, try again after `after`.
    Retry {
        kind: ApplyErrorKind,
        after: Duration,
    },
    Cancelled,
    /// Never started: lease held, status moved on, or candidate busy.
    Skipped {
        reason: String,
    },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub application: Application,
    pub outcome: AttemptOutcome,
}

impl AttemptReport {
    pub fn skipped(application: Application, reason: &str) -> Self {
        tracing::debug!(application_id = %application.id, reason, "Submission skipped");
        Self {
            application,
            outcome: AttemptOutcome::Skipped {
                reason: reason.to_string(),
            },
        }
    }
}

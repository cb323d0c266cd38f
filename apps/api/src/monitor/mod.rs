//! Monitor Pool: collects status evidence for live applications (ATS status
//! endpoints, the candidate's inbox) and commits the transitions it supports.

pub mod ats;
pub mod classify;
pub mod fusion;
pub mod inbox;
pub mod limiter;
pub mod pool;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::directory::DirectoryError;
use crate::models::application::{ApplicationStatus, EvidenceSource, ObservationRecord};
use crate::store::StoreError;
use crate::vault::VaultError;

pub use ats::{AtsProvider, AtsStatus, HttpAtsProvider};
pub use inbox::{GmailInbox, Inbox, MessageMeta};
pub use pool::{
    CheckReport, MonitorDeps, MonitorPool, MonitorSettings, MonitorStatus, StartOptions, SyncSummary,
};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("No status endpoint configured for {0}")]
    Unsupported(String),

    #[error("Application {id} is {status}; only applied, in-review, interview or unconfirmed submissions are monitored")]
    NotMonitorable { id: Uuid, status: ApplicationStatus },

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// One piece of status evidence from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub source: EvidenceSource,
    pub status: Option<ApplicationStatus>,
    pub confidence: f32,
    pub observed_at: DateTime<Utc>,
    pub detail: String,
    /// An inbox confirmation of the submission itself.
    pub confirms_submission: bool,
    pub message_id: Option<String>,
}

impl Observation {
    pub fn new(source: EvidenceSource, status: Option<ApplicationStatus>, observed_at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        Self {
            source,
            status,
            confidence: source.confidence(),
            observed_at,
            detail: detail.into(),
            confirms_submission: false,
            message_id: None,
        }
    }

    pub fn record(&self) -> ObservationRecord {
        ObservationRecord {
            source: self.source,
            status: self.status,
            confidence: self.confidence,
            observed_at: self.observed_at,
            detail: self.detail.clone(),
            error: None,
        }
    }
}

/// A source that could not be consulted this tick. Kept in the history, never
/// acted on.
pub fn failure_record(source: EvidenceSource, at: DateTime<Utc>, error: &impl std::fmt::Display) -> ObservationRecord {
    ObservationRecord {
        source,
        status: None,
        confidence: 0.0,
        observed_at: at,
        detail: format!("{} source unavailable", source.as_str()),
        error: Some(error.to_string()),
    }
}

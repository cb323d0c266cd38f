//! `<ARTIFACT_DIR>/<application>/<attempt>/attempt.json`, written as soon as
//! the Portal Driver returns and before the store commit. Crash recovery
//! reads it back to finish an interrupted commit without re-submitting.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::portal::{ApplyError, ApplyResult, PortalFamily, StepRecord};

pub const ATTEMPT_LOG_NAME: &str = "attempt.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub application_id: Uuid,
    pub attempt_id: String,
    pub url: String,
    pub family: PortalFamily,
    pub success: bool,
    pub submitted: bool,
    pub confirmation: Option<String>,
    pub error: Option<ApplyError>,
    pub final_url: Option<String>,
    pub screenshots: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn from_result(application_id: Uuid, attempt_id: &str, url: &str, result: &ApplyResult) -> Self {
        Self {
            application_id,
            attempt_id: attempt_id.to_string(),
            url: url.to_string(),
            family: result.family,
            success: result.success,
            submitted: result.submitted,
            confirmation: result.confirmation.clone(),
            error: result.error.clone(),
            final_url: result.final_url.clone(),
            screenshots: result.screenshots.iter().map(|s| s.name.clone()).collect(),
            steps: result.steps.clone(),
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptLog {
    root: PathBuf,
}

impl AttemptLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, application_id: Uuid, attempt_id: &str) -> PathBuf {
        self.root
            .join(application_id.to_string())
            .join(attempt_id)
            .join(ATTEMPT_LOG_NAME)
    }

    pub async fn write(&self, record: &AttemptRecord) -> std::io::Result<PathBuf> {
        let path = self.path(record.application_id, &record.attempt_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(record)?;
        // Write-then-rename so a crash never leaves a truncated log behind.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// `None` when the attempt never got as far as writing its log.
    pub async fn read(&self, application_id: Uuid, attempt_id: &str) -> Option<AttemptRecord> {
        let path = self.path(application_id, attempt_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable attempt log");
                None
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::attempt_log::{AttemptLog, AttemptRecord, ATTEMPT_LOG_NAME};
use super::{AttemptOutcome, AttemptReport, SubmissionError, SubmissionTask};
use crate::artifacts::ArtifactStore;
use crate::directory::Directory;
use crate::events::{EventBus, ServerEvent};
use crate::models::application::{
    Application, ApplicationStatus, ArtifactRef, EventKind, NewEvent,
};
use crate::portal::{
    company_domain, ApplyErrorKind, ApplyResult, DriverConfig, PageFactory, PortalDriver,
    PortalFamily, ProfileBundle,
};
use crate::store::{
    ApplicationLease, ApplicationStore, LeaseRegistry, SubmissionCommit, SubmissionOutcome,
};
use crate::vault::Vault;

/// Arms status monitoring once an application is live.
#[async_trait]
pub trait MonitorHook: Send + Sync {
    async fn arm(&self, application_id: Uuid);
}

#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn ApplicationStore>,
    pub leases: LeaseRegistry,
    pub directory: Arc<dyn Directory>,
    pub vault: Arc<Vault>,
    pub pages: Arc<dyn PageFactory>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub bus: EventBus,
    pub monitor: Arc<dyn MonitorHook>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub driver: DriverConfig,
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    pub check_interval_minutes: i32,
    pub attempt_log: AttemptLog,
}

pub struct SubmissionWorker {
    deps: WorkerDeps,
    settings: WorkerSettings,
    /// One outstanding submission per candidate.
    candidates: LeaseRegistry,
}

fn new_attempt_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        rand::random::<u32>()
    )
}

impl SubmissionWorker {
    pub fn new(deps: WorkerDeps, settings: WorkerSettings) -> Self {
        Self {
            deps,
            settings,
            candidates: LeaseRegistry::new(),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Scheduler entry point: skips when the application or its candidate is
    /// already busy.
    pub async fn try_run(
        &self,
        task: SubmissionTask,
        cancel: CancellationToken,
    ) -> Result<AttemptReport, SubmissionError> {
        let app = self.deps.store.get_application(task.application_id).await?;
        let Some(_candidate) = self.candidates.try_acquire(app.candidate_id) else {
            return Ok(AttemptReport::skipped(app, "candidate has a submission in flight"));
        };
        let Some(lease) = self.deps.leases.try_acquire(app.id) else {
            return Ok(AttemptReport::skipped(app, "application is leased elsewhere"));
        };
        self.execute(task, lease, cancel).await
    }

    /// Interactive entry point: waits for the candidate's previous
    /// submission and the application lease.
    pub async fn run(
        &self,
        task: SubmissionTask,
        cancel: CancellationToken,
    ) -> Result<AttemptReport, SubmissionError> {
        let app = self.deps.store.get_application(task.application_id).await?;
        let _candidate = self.candidates.acquire(app.candidate_id).await;
        let lease = self.deps.leases.acquire(app.id).await;
        self.execute(task, lease, cancel).await
    }

    async fn execute(
        &self,
        task: SubmissionTask,
        lease: ApplicationLease,
        cancel: CancellationToken,
    ) -> Result<AttemptReport, SubmissionError> {
        let store = &self.deps.store;
        let id = lease.application_id;
        let app = store.get_application(id).await?;

        if app.status != ApplicationStatus::Pending {
            return Ok(AttemptReport::skipped(app, "application is no longer pending"));
        }
        if app.unverified_submission {
            return Ok(AttemptReport::skipped(app, "earlier submission awaits confirmation"));
        }
        if cancel.is_cancelled() {
            return Ok(AttemptReport {
                application: app,
                outcome: AttemptOutcome::Cancelled,
            });
        }
        if Utc::now() < task.earliest_start {
            return Ok(AttemptReport::skipped(app, "slot not reached"));
        }
        if task.remaining().is_some_and(|left| left.is_zero()) {
            return Ok(AttemptReport::skipped(app, "deadline passed before start"));
        }

        let posting = self.deps.directory.posting(app.posting_id).await?;
        let recruiter_id = posting.as_ref().and_then(|p| p.recruiter_id);
        let url = task
            .navigation_url
            .clone()
            .or_else(|| posting.as_ref().and_then(|p| p.navigation_url().map(String::from)));
        let Some(url) = url else {
            let message = format!("posting {} has no URL to navigate to", app.posting_id);
            return self
                .fail_without_attempt(app, recruiter_id, ApplyErrorKind::NavigationFailed, message)
                .await;
        };
        let Some(profile) = self.deps.directory.profile(app.candidate_id).await? else {
            let message = format!("candidate {} has no profile", app.candidate_id);
            return self
                .fail_without_attempt(app, recruiter_id, ApplyErrorKind::FormFillIncomplete, message)
                .await;
        };

        let family = PortalFamily::detect(&url);
        let mut bundle = ProfileBundle::from_profile(&profile);
        let domain = company_domain(&url);
        bundle.add_credential(
            self.deps
                .vault
                .acquire(app.candidate_id, family.provider(), domain.as_deref())
                .await?,
        );

        let attempt_id = new_attempt_id();
        store
            .append_event(
                id,
                NewEvent::new(EventKind::SubmissionStarted, "Submission started").with_metadata(json!({
                    "attempt_id": attempt_id,
                    "navigation_url": url,
                    "family": family.provider(),
                    "attempt": task.attempt,
                })),
            )
            .await?;
        info!(
            application_id = %id,
            %family,
            tier = task.tier.map(|t| t.as_str()).unwrap_or("interactive"),
            attempt = task.attempt,
            %attempt_id,
            "Submission attempt started"
        );

        let mut config = self.settings.driver.clone();
        if let Some(left) = task.remaining() {
            config.budget = config.budget.min(left);
        }
        let driver = PortalDriver::new(self.deps.pages.clone(), config, cancel.child_token());
        let result = driver.apply(&url, &bundle).await;
        // Plaintext credentials are wiped here.
        drop(bundle);

        let record = AttemptRecord::from_result(id, &attempt_id, &url, &result);
        if let Err(e) = self.settings.attempt_log.write(&record).await {
            error!(application_id = %id, %attempt_id, error = %e, "Failed to write attempt log");
        }
        let artifacts = self.store_artifacts(id, &attempt_id, &result, &record).await;

        self.commit(app, recruiter_id, task, attempt_id, url, result, artifacts)
            .await
    }

    async fn store_artifacts(
        &self,
        id: Uuid,
        attempt_id: &str,
        result: &ApplyResult,
        record: &AttemptRecord,
    ) -> Vec<ArtifactRef> {
        let mut refs = Vec::new();
        for shot in &result.screenshots {
            let key = format!("{id}/{attempt_id}/{}", shot.name);
            match self.deps.artifacts.put(&key, "image/png", shot.png.clone()).await {
                Ok(location) => refs.push(ArtifactRef::screenshot(location)),
                Err(e) => warn!(application_id = %id, screenshot = %shot.name, error = %e, "Screenshot upload failed"),
            }
        }
        let key = format!("{id}/{attempt_id}/{ATTEMPT_LOG_NAME}");
        match serde_json::to_vec(record) {
            Ok(body) => match self
                .deps
                .artifacts
                .put(&key, "application/json", body.into())
                .await
            {
                Ok(location) => refs.push(ArtifactRef {
                    kind: "attempt_log".to_string(),
                    location,
                }),
                Err(e) => warn!(application_id = %id, error = %e, "Attempt log upload failed"),
            },
            Err(e) => warn!(application_id = %id, error = %e, "Attempt log not serializable"),
        }
        refs
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        app: Application,
        recruiter_id: Option<Uuid>,
        task: SubmissionTask,
        attempt_id: String,
        url: String,
        result: ApplyResult,
        artifacts: Vec<ArtifactRef>,
    ) -> Result<AttemptReport, SubmissionError> {
        let store = &self.deps.store;
        let id = app.id;

        if let (Some(error), false) = (result.error.as_ref(), result.success) {
            let retryable = error.kind.is_transient() && task.attempt < self.settings.max_attempts;
            if error.kind == ApplyErrorKind::Cancelled || retryable {
                // Attempt closed without a status change; the application stays pending.
                let after = self.backoff(task.attempt);
                let (title, outcome) = if error.kind == ApplyErrorKind::Cancelled {
                    ("Submission cancelled", AttemptOutcome::Cancelled)
                } else {
                    (
                        "Submission attempt failed; will retry",
                        AttemptOutcome::Retry {
                            kind: error.kind,
                            after,
                        },
                    )
                };
                for artifact in artifacts {
                    store.attach_artifact(id, artifact).await?;
                }
                store
                    .append_event(
                        id,
                        NewEvent::new(EventKind::NoteAdded, title)
                            .describe(error.message.clone())
                            .with_metadata(json!({
                                "attempt_id": attempt_id,
                                "error_kind": error.kind.as_str(),
                                "attempt": task.attempt,
                                "retry_in_secs": matches!(outcome, AttemptOutcome::Retry { .. }).then(|| after.as_secs()),
                            })),
                    )
                    .await?;
                let application = store.get_application(id).await?;
                info!(application_id = %id, kind = %error.kind, "Submission attempt closed without status change");
                return Ok(AttemptReport {
                    application,
                    outcome,
                });
            }
        }

        let (outcome, report_outcome) = match (&result.error, result.success) {
            (None, true) | (Some(_), true) => (
                SubmissionOutcome::Applied {
                    confirmation: result.confirmation.clone(),
                },
                AttemptOutcome::Applied {
                    confirmation: result.confirmation.clone(),
                },
            ),
            (Some(e), false) if e.kind == ApplyErrorKind::UnverifiedSubmission => (
                SubmissionOutcome::Unverified {
                    message: e.message.clone(),
                },
                AttemptOutcome::Unverified {
                    message: e.message.clone(),
                },
            ),
            (Some(e), false) => (
                SubmissionOutcome::Failed {
                    kind: e.kind.as_str().to_string(),
                    message: e.message.clone(),
                },
                AttemptOutcome::Failed {
                    kind: e.kind,
                    message: e.message.clone(),
                },
            ),
            (None, false) => (
                SubmissionOutcome::Failed {
                    kind: ApplyErrorKind::DriverInternal.as_str().to_string(),
                    message: "driver returned neither success nor error".to_string(),
                },
                AttemptOutcome::Failed {
                    kind: ApplyErrorKind::DriverInternal,
                    message: "driver returned neither success nor error".to_string(),
                },
            ),
        };

        let application = store
            .commit_submission(
                id,
                SubmissionCommit {
                    attempt_id,
                    navigation_url: Some(url),
                    artifacts,
                    outcome,
                    check_frequency_minutes: self.settings.check_interval_minutes,
                    at: Utc::now(),
                    verified_source: None,
                },
            )
            .await?;

        self.announce(&application, recruiter_id, &report_outcome);
        if application.is_monitorable() {
            self.deps.monitor.arm(id).await;
        }
        Ok(AttemptReport {
            application,
            outcome: report_outcome,
        })
    }

    async fn fail_without_attempt(
        &self,
        app: Application,
        recruiter_id: Option<Uuid>,
        kind: ApplyErrorKind,
        message: String,
    ) -> Result<AttemptReport, SubmissionError> {
        warn!(application_id = %app.id, %kind, %message, "Submission cannot start");
        let application = self
            .deps
            .store
            .commit_submission(
                app.id,
                SubmissionCommit {
                    attempt_id: new_attempt_id(),
                    navigation_url: None,
                    artifacts: Vec::new(),
                    outcome: SubmissionOutcome::Failed {
                        kind: kind.as_str().to_string(),
                        message: message.clone(),
                    },
                    check_frequency_minutes: self.settings.check_interval_minutes,
                    at: Utc::now(),
                    verified_source: None,
                },
            )
            .await?;
        let outcome = AttemptOutcome::Failed { kind, message };
        self.announce(&application, recruiter_id, &outcome);
        Ok(AttemptReport {
            application,
            outcome,
        })
    }

    fn announce(&self, app: &Application, recruiter_id: Option<Uuid>, outcome: &AttemptOutcome) {
        let (stage, message, confirmation) = match outcome {
            AttemptOutcome::Applied { confirmation } => (
                "applied",
                "Application submitted".to_string(),
                confirmation.clone(),
            ),
            AttemptOutcome::Failed { kind, message } => ("failed", format!("{kind}: {message}"), None),
            AttemptOutcome::Unverified { message } => ("unverified", message.clone(), None),
            _ => return,
        };
        self.deps.bus.publish_application(
            app.candidate_id,
            recruiter_id,
            ServerEvent::ApplicationUpdate {
                application_id: app.id,
                status: app.status,
                stage: stage.to_string(),
                message,
                confirmation,
                timestamp: Utc::now(),
            },
        );
    }

    /// `retry_base · 2^(attempt-1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.settings
            .retry_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    // ── crash recovery ──────────────────────────────────────────────────────

    /// Resolves every pending application whose last `submission_started`
    /// sentinel has no matching completion event. Never re-submits.
    pub async fn recover_interrupted(&self) -> Result<usize, SubmissionError> {
        let store = &self.deps.store;
        let mut recovered = 0;
        for app in store.list_by_status(&[ApplicationStatus::Pending]).await? {
            let events = store.events(app.id).await?;
            let Some(sentinel) = events
                .iter()
                .rev()
                .find(|e| e.kind == EventKind::SubmissionStarted)
            else {
                continue;
            };
            let Some(attempt_id) = sentinel.attempt_id().map(String::from) else {
                continue;
            };
            let closed = events
                .iter()
                .any(|e| e.kind != EventKind::SubmissionStarted && e.attempt_id() == Some(attempt_id.as_str()));
            if closed {
                continue;
            }

            let Some(_lease) = self.deps.leases.try_acquire(app.id) else {
                continue;
            };
            let record = self.settings.attempt_log.read(app.id, &attempt_id).await;
            let outcome = match &record {
                Some(r) if r.success => SubmissionOutcome::Applied {
                    confirmation: r.confirmation.clone(),
                },
                Some(r) => match &r.error {
                    Some(e) if e.kind == ApplyErrorKind::UnverifiedSubmission => SubmissionOutcome::Unverified {
                        message: e.message.clone(),
                    },
                    Some(e) if e.kind.is_transient() || e.kind == ApplyErrorKind::Cancelled => {
                        // Nothing reached the portal's submit; close the sentinel and let the
                        // scheduler try again.
                        store
                            .append_event(
                                app.id,
                                NewEvent::new(EventKind::NoteAdded, "Interrupted attempt closed")
                                    .describe(e.message.clone())
                                    .with_metadata(json!({
                                        "attempt_id": attempt_id,
                                        "error_kind": e.kind.as_str(),
                                        "recovered": true,
                                    })),
                            )
                            .await?;
                        recovered += 1;
                        continue;
                    }
                    Some(e) => SubmissionOutcome::Failed {
                        kind: e.kind.as_str().to_string(),
                        message: e.message.clone(),
                    },
                    None => SubmissionOutcome::Unverified {
                        message: "attempt log has neither success nor error".to_string(),
                    },
                },
                None => SubmissionOutcome::Unverified {
                    message: "process stopped before the attempt finished".to_string(),
                },
            };

            let url = record.as_ref().map(|r| r.url.clone());
            let artifacts = record
                .as_ref()
                .map(|_| {
                    vec![ArtifactRef {
                        kind: "attempt_log".to_string(),
                        location: self
                            .settings
                            .attempt_log
                            .path(app.id, &attempt_id)
                            .to_string_lossy()
                            .into_owned(),
                    }]
                })
                .unwrap_or_default();
            warn!(application_id = %app.id, %attempt_id, log_found = record.is_some(), "Recovering interrupted submission");
            let committed = store
                .commit_submission(
                    app.id,
                    SubmissionCommit {
                        attempt_id,
                        navigation_url: url,
                        artifacts,
                        outcome,
                        check_frequency_minutes: self.settings.check_interval_minutes,
                        at: Utc::now(),
                        verified_source: None,
                    },
                )
                .await?;
            if committed.is_monitorable() {
                self.deps.monitor.arm(committed.id).await;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "Interrupted submissions resolved");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Group;
    use crate::testing::{Fixture, ScriptedPage, GREENHOUSE_URL as GH_URL};

    async fn fixture(page: ScriptedPage) -> (Fixture, SubmissionWorker) {
        let f = Fixture::new(GH_URL, vec![Arc::new(page)]).await;
        let worker = f.worker();
        (f, worker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_attempt_commits_applied() {
        let (h, worker) = fixture(ScriptedPage::greenhouse_form(GH_URL)).await;
        h.vault
            .store_credential(h.candidate, "greenhouse", None, "ada@x.io", "pw")
            .await
            .unwrap();
        let mut session = h.bus.subscribe(Group::User(h.candidate));
        let app = h.pending().await;

        let report = worker
            .run(SubmissionTask::now(app.id), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(report.outcome, AttemptOutcome::Applied { .. }));
        let app = report.application;
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert_eq!(app.external_confirmation.as_deref(), Some("GH-4821"));
        assert_eq!(app.apply_url.as_deref(), Some(GH_URL));
        assert_eq!(app.artifacts.iter().filter(|a| a.kind == "screenshot").count(), 3);
        assert_eq!(h.monitor.armed(), vec![app.id]);

        let events = h.store.events(app.id).await.unwrap();
        let started = events.iter().find(|e| e.kind == EventKind::SubmissionStarted).unwrap();
        let applied: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Applied).collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].attempt_id(), started.attempt_id());

        let update = session.rx.recv().await.unwrap();
        assert!(matches!(update, ServerEvent::ApplicationUpdate { status: ApplicationStatus::Applied, .. }));
        assert!(session.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_captcha_marks_failed_without_retry() {
        let page = ScriptedPage::greenhouse_form(GH_URL);
        page.show("iframe[src*='recaptcha']");
        let (h, worker) = fixture(page).await;
        let app = h.pending().await;

        let report = worker
            .run(SubmissionTask::now(app.id), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            AttemptOutcome::Failed { kind: ApplyErrorKind::CaptchaBlocked, .. }
        ));
        assert_eq!(report.application.status, ApplicationStatus::Failed);
        assert_eq!(report.application.last_error.as_deref(), Some("CaptchaBlocked"));
        assert!(report.application.artifacts.iter().any(|a| a.location.ends_with("03-terminal.png")));
        assert!(h.monitor.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_then_fails() {
        let page = ScriptedPage::greenhouse_form(GH_URL);
        page.fail_navigation();
        let (h, worker) = fixture(page).await;
        let app = h.pending().await;

        let mut task = SubmissionTask::now(app.id);
        let report = worker.run(task.clone(), CancellationToken::new()).await.unwrap();
        match report.outcome {
            AttemptOutcome::Retry { kind, after } => {
                assert_eq!(kind, ApplyErrorKind::NavigationFailed);
                assert_eq!(after, Duration::from_secs(60));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(report.application.status, ApplicationStatus::Pending);

        task.attempt = 3;
        let report = worker.run(task, CancellationToken::new()).await.unwrap();
        assert_eq!(report.application.status, ApplicationStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_outside_its_window_is_skipped() {
        let (h, worker) = fixture(ScriptedPage::greenhouse_form(GH_URL)).await;
        let app = h.pending().await;

        let mut early = SubmissionTask::now(app.id);
        early.earliest_start = Utc::now() + chrono::Duration::hours(1);
        let report = worker.run(early, CancellationToken::new()).await.unwrap();
        assert!(matches!(report.outcome, AttemptOutcome::Skipped { ref reason } if reason == "slot not reached"));

        let mut late = SubmissionTask::now(app.id);
        late.deadline = Some(tokio::time::Instant::now());
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = worker.run(late, CancellationToken::new()).await.unwrap();
        assert!(matches!(report.outcome, AttemptOutcome::Skipped { ref reason } if reason == "deadline passed before start"));

        assert_eq!(report.application.status, ApplicationStatus::Pending);
        assert_eq!(h.pages.opened(), 0);
        let events = h.store.events(app.id).await.unwrap();
        assert!(events.iter().all(|e| e.kind != EventKind::SubmissionStarted));
    }

    #[test]
    fn test_remaining_time_is_clamped_at_zero() {
        let mut task = SubmissionTask::now(Uuid::new_v4());
        assert_eq!(task.remaining(), None);
        task.deadline = Some(tokio::time::Instant::now() - Duration::from_secs(5));
        assert_eq!(task.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_leaves_pending() {
        let (h, worker) = fixture(ScriptedPage::greenhouse_form(GH_URL)).await;
        let app = h.pending().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = worker.run(SubmissionTask::now(app.id), cancel).await.unwrap();
        assert!(matches!(report.outcome, AttemptOutcome::Cancelled));
        assert_eq!(report.application.status, ApplicationStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverified_submission_stays_pending_and_is_monitored() {
        let page = ScriptedPage::greenhouse_form(GH_URL);
        page.clear_click_effects("#submit_app");
        let (h, worker) = fixture(page).await;
        let app = h.pending().await;

        let report = worker
            .run(SubmissionTask::now(app.id), CancellationToken::new())
            .await
            .unwrap();
        let app = report.application;
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert!(app.unverified_submission);
        assert_eq!(h.monitor.armed(), vec![app.id]);

        // No automatic second attempt.
        let again = worker
            .run(SubmissionTask::now(app.id), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(again.outcome, AttemptOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_recovery_commits_logged_success_once() {
        let h = Fixture::new(GH_URL, Vec::new()).await;
        let worker = h.worker();
        let app = h.pending().await;
        h.store
            .append_event(
                app.id,
                NewEvent::new(EventKind::SubmissionStarted, "Submission started")
                    .with_metadata(json!({"attempt_id": "att-crash"})),
            )
            .await
            .unwrap();
        worker
            .settings
            .attempt_log
            .write(&AttemptRecord {
                application_id: app.id,
                attempt_id: "att-crash".to_string(),
                url: GH_URL.to_string(),
                family: PortalFamily::Greenhouse,
                success: true,
                submitted: true,
                confirmation: Some("GH-9".to_string()),
                error: None,
                final_url: None,
                screenshots: Vec::new(),
                steps: Vec::new(),
                finished_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(worker.recover_interrupted().await.unwrap(), 1);
        assert_eq!(worker.recover_interrupted().await.unwrap(), 0);

        let app = h.store.get_application(app.id).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert_eq!(app.external_confirmation.as_deref(), Some("GH-9"));
        let events = h.store.events(app.id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::Applied).count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_without_log_marks_unverified() {
        let h = Fixture::new(GH_URL, Vec::new()).await;
        let worker = h.worker();
        let app = h.pending().await;
        h.store
            .append_event(
                app.id,
                NewEvent::new(EventKind::SubmissionStarted, "Submission started")
                    .with_metadata(json!({"attempt_id": "att-lost"})),
            )
            .await
            .unwrap();

        worker.recover_interrupted().await.unwrap();
        let app = h.store.get_application(app.id).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert!(app.unverified_submission);
        assert_eq!(app.last_error.as_deref(), Some("UnverifiedSubmission"));
    }
}

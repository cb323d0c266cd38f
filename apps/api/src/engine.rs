//! The root value of the service. Owns the Scheduler, the Monitor Pool, the
//! Submission Worker and the Event Bus, and exposes the operations the HTTP
//! routes and session transport call on behalf of an `Identity`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::auth::{Identity, Role};
use crate::directory::{Directory, DirectoryError};
use crate::events::{EventBus, ServerEvent};
use crate::models::application::{
    Application, ApplicationEvent, ApplicationStatus, EventKind, EvidenceSource, NewEvent,
    SubmissionMethod,
};
use crate::models::directory::Posting;
use crate::monitor::{
    AtsProvider, Inbox, MonitorDeps, MonitorError, MonitorPool, MonitorSettings, MonitorStatus,
    StartOptions, SyncSummary,
};
use crate::portal::page::PageFactory;
use crate::scheduler::{ScheduleResult, Scheduler, SchedulerError, SchedulerSettings};
use crate::store::rules::evidence_may_reach;
use crate::store::{
    ApplicationStore, CreateOutcome, LeaseRegistry, NewApplication, StoreError, SubmissionCommit,
    SubmissionOutcome, TrackingPatch, TransitionEvidence, VerificationPatch,
};
use crate::submission::{
    AttemptOutcome, MonitorHook, SubmissionError, SubmissionTask, SubmissionWorker, WorkerDeps,
    WorkerSettings,
};
use crate::vault::Vault;

const DEFAULT_SYNC_DAYS: i64 = 30;
const DEFAULT_SYNC_RESULTS: u32 = 10;
const MAX_LIST: i64 = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Posting {0} not found")]
    PostingNotFound(Uuid),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// Outbound seams the engine is built from.
pub struct EngineParts {
    pub store: Arc<dyn ApplicationStore>,
    pub directory: Arc<dyn Directory>,
    pub vault: Arc<Vault>,
    pub pages: Arc<dyn PageFactory>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub ats: Arc<dyn AtsProvider>,
    pub inbox: Arc<dyn Inbox>,
    pub bus: EventBus,
}

pub struct EngineSettings {
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResponse {
    pub success: bool,
    pub already_applied: bool,
    pub application: Application,
}

#[derive(Debug, Clone, Serialize)]
pub struct DynamicApplyResponse {
    pub success: bool,
    pub application_id: Uuid,
    pub confirmation_number: Option<String>,
    pub external_link_followed: bool,
    pub already_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub application: Application,
}

pub struct Engine {
    store: Arc<dyn ApplicationStore>,
    directory: Arc<dyn Directory>,
    leases: LeaseRegistry,
    bus: EventBus,
    worker: Arc<SubmissionWorker>,
    scheduler: Arc<Scheduler>,
    monitor: MonitorPool,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(parts: EngineParts, settings: EngineSettings, shutdown: CancellationToken) -> Self {
        let leases = LeaseRegistry::new();
        let monitor = MonitorPool::new(
            MonitorDeps {
                store: parts.store.clone(),
                leases: leases.clone(),
                directory: parts.directory.clone(),
                vault: parts.vault.clone(),
                ats: parts.ats,
                inbox: parts.inbox,
                bus: parts.bus.clone(),
            },
            settings.monitor,
            shutdown.clone(),
        );
        let worker = Arc::new(SubmissionWorker::new(
            WorkerDeps {
                store: parts.store.clone(),
                leases: leases.clone(),
                directory: parts.directory.clone(),
                vault: parts.vault,
                pages: parts.pages,
                artifacts: parts.artifacts,
                bus: parts.bus.clone(),
                monitor: Arc::new(monitor.clone()),
            },
            settings.worker,
        ));
        let scheduler = Arc::new(Scheduler::new(
            parts.store.clone(),
            parts.directory.clone(),
            worker.clone(),
            parts.bus.clone(),
            settings.scheduler,
            shutdown.clone(),
        ));
        Self {
            store: parts.store,
            directory: parts.directory,
            leases,
            bus: parts.bus,
            worker,
            scheduler,
            monitor,
            shutdown,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn monitor(&self) -> &MonitorPool {
        &self.monitor
    }

    /// Startup reconciliation, then the scheduler and monitor supervisor
    /// loops. Both loops end when the shutdown token fires.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        match self.worker.recover_interrupted().await {
            Ok(recovered) => info!(recovered, "Interrupted submissions reconciled"),
            Err(e) => error!(error = %e, "Submission recovery failed"),
        }
        if let Err(e) = self.scheduler.rebuild_from_store().await {
            error!(error = %e, "Schedule rebuild failed");
        }
        vec![
            tokio::spawn(self.scheduler.clone().run()),
            tokio::spawn(self.monitor.clone().run()),
        ]
    }

    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.cancel();
    }

    // ────────────────────────────────────────────────────────────────────────
    // Access
    // ────────────────────────────────────────────────────────────────────────

    fn require_candidate(&self, identity: Identity) -> Result<Uuid, EngineError> {
        match identity.role {
            Role::Candidate => Ok(identity.user_id),
            Role::Recruiter => Err(EngineError::Forbidden(
                "Only candidates may perform this operation".to_string(),
            )),
        }
    }

    /// The application and its posting, if `identity` may see it: the
    /// candidate who owns it or the recruiter who owns its posting.
    async fn readable(&self, identity: Identity, id: Uuid) -> Result<(Application, Option<Posting>), EngineError> {
        let app = self.store.get_application(id).await?;
        let posting = self.directory.posting(app.posting_id).await?;
        let allowed = match identity.role {
            Role::Candidate => app.candidate_id == identity.user_id,
            Role::Recruiter => posting.as_ref().and_then(|p| p.recruiter_id) == Some(identity.user_id),
        };
        if !allowed {
            warn!(application_id = %id, user_id = %identity.user_id, role = %identity.role, "Cross-tenant access refused");
            return Err(EngineError::Forbidden(format!("Application {id} belongs to someone else")));
        }
        Ok((app, posting))
    }

    async fn owned(&self, identity: Identity, id: Uuid) -> Result<(Application, Option<Posting>), EngineError> {
        self.require_candidate(identity)?;
        self.readable(identity, id).await
    }

    fn publish(&self, app: &Application, posting: Option<&Posting>, event: ServerEvent) {
        self.bus
            .publish_application(app.candidate_id, posting.and_then(|p| p.recruiter_id), event);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Applying
    // ────────────────────────────────────────────────────────────────────────

    /// Records an application without driving any portal. Idempotent per
    /// (candidate, posting).
    pub async fn apply(
        &self,
        identity: Identity,
        posting_id: Uuid,
        method: Option<SubmissionMethod>,
    ) -> Result<ApplyResponse, EngineError> {
        let candidate_id = self.require_candidate(identity)?;
        let posting = self
            .directory
            .posting(posting_id)
            .await?
            .ok_or(EngineError::PostingNotFound(posting_id))?;
        let method = method.unwrap_or(SubmissionMethod::Manual);

        let outcome = self
            .store
            .create_application(NewApplication {
                candidate_id,
                posting_id,
                method,
                submit_intent: method != SubmissionMethod::Manual,
            })
            .await?;
        let already_applied = outcome.already_exists();
        let application = outcome.into_application();
        if !already_applied {
            self.publish(
                &application,
                Some(&posting),
                ServerEvent::ApplicationCreated {
                    application: application.clone(),
                },
            );
        }
        Ok(ApplyResponse {
            success: true,
            already_applied,
            application,
        })
    }

    /// Creates the application and submits it right away: through the portal
    /// for external postings, directly for internal ones.
    pub async fn apply_dynamically(
        &self,
        identity: Identity,
        posting_id: Uuid,
    ) -> Result<DynamicApplyResponse, EngineError> {
        let candidate_id = self.require_candidate(identity)?;
        let posting = self
            .directory
            .posting(posting_id)
            .await?
            .ok_or(EngineError::PostingNotFound(posting_id))?;
        let external = posting.is_external();

        let outcome = self
            .store
            .create_application(NewApplication {
                candidate_id,
                posting_id,
                method: if external {
                    SubmissionMethod::Browser
                } else {
                    SubmissionMethod::Api
                },
                submit_intent: true,
            })
            .await?;
        let app = match outcome {
            CreateOutcome::AlreadyExists(app) => {
                info!(application_id = %app.id, "Apply repeated; returning existing application");
                return Ok(DynamicApplyResponse {
                    success: true,
                    application_id: app.id,
                    confirmation_number: app.external_confirmation.clone(),
                    external_link_followed: false,
                    already_applied: true,
                    error: None,
                    retry_at: None,
                    application: app,
                });
            }
            CreateOutcome::Created(app) => app,
        };
        self.publish(
            &app,
            Some(&posting),
            ServerEvent::ApplicationCreated {
                application: app.clone(),
            },
        );

        if !external {
            let application = self.submit_internal(&app, &posting).await?;
            return Ok(DynamicApplyResponse {
                success: true,
                application_id: application.id,
                confirmation_number: None,
                external_link_followed: false,
                already_applied: false,
                error: None,
                retry_at: None,
                application,
            });
        }

        let task = SubmissionTask::now(app.id).with_url(posting.navigation_url().map(String::from));
        let cancel = self.scheduler.candidate_token(candidate_id).child_token();
        let report = self.worker.run(task, cancel).await?;

        let mut response = DynamicApplyResponse {
            success: report.outcome.is_success(),
            application_id: app.id,
            confirmation_number: report.application.external_confirmation.clone(),
            external_link_followed: true,
            already_applied: false,
            error: None,
            retry_at: None,
            application: report.application,
        };
        match report.outcome {
            AttemptOutcome::Applied { .. } => {}
            AttemptOutcome::Failed { kind, message } => {
                response.error = Some(format!("{kind}: {message}"));
            }
            AttemptOutcome::Unverified { message } => {
                response.error = Some(format!("UnverifiedSubmission: {message}"));
            }
            AttemptOutcome::Retry { kind, after } => {
                let at = self.scheduler.retry_later(app.id, 1, after).await?;
                response.error = Some(format!("{kind}: retry scheduled"));
                response.retry_at = Some(at);
                response.application = self.store.get_application(app.id).await?;
            }
            AttemptOutcome::Cancelled => {
                response.error = Some("Submission cancelled".to_string());
            }
            AttemptOutcome::Skipped { reason } => {
                response.error = Some(reason);
            }
        }
        Ok(response)
    }

    /// Internal postings are received by the platform itself; the record is
    /// the submission.
    async fn submit_internal(&self, app: &Application, posting: &Posting) -> Result<Application, EngineError> {
        let lease = self.leases.acquire(app.id).await;
        let committed = self
            .store
            .commit_submission(
                app.id,
                SubmissionCommit {
                    attempt_id: format!("internal-{}", Uuid::new_v4().simple()),
                    navigation_url: None,
                    artifacts: Vec::new(),
                    outcome: SubmissionOutcome::Applied { confirmation: None },
                    check_frequency_minutes: self.worker.settings().check_interval_minutes,
                    at: Utc::now(),
                    verified_source: None,
                },
            )
            .await?;
        drop(lease);
        info!(application_id = %app.id, "Internal application submitted");

        self.publish(
            &committed,
            Some(posting),
            ServerEvent::ApplicationUpdate {
                application_id: committed.id,
                status: committed.status,
                stage: "applied".to_string(),
                message: format!("Application sent to {}", posting.company),
                confirmation: None,
                timestamp: Utc::now(),
            },
        );
        self.monitor.arm(committed.id).await;
        Ok(committed)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Manual evidence
    // ────────────────────────────────────────────────────────────────────────

    /// The candidate asserts the application was submitted.
    pub async fn confirm_applied(
        &self,
        identity: Identity,
        id: Uuid,
        confirmation: Option<String>,
    ) -> Result<Application, EngineError> {
        let (_, posting) = self.owned(identity, id).await?;
        self.mark_confirmed(id, posting.as_ref(), confirmation, "Application confirmed by candidate")
            .await
    }

    /// Manual verification of a submitted application. A plain `pending`
    /// application has nothing to verify.
    pub async fn verify(&self, identity: Identity, id: Uuid) -> Result<Application, EngineError> {
        let (app, posting) = self.owned(identity, id).await?;
        if app.status == ApplicationStatus::Pending && !app.unverified_submission {
            return Err(EngineError::Invalid(format!("Application {id} has not been submitted")));
        }
        self.mark_confirmed(id, posting.as_ref(), None, "Application verified by candidate")
            .await
    }

    async fn mark_confirmed(
        &self,
        id: Uuid,
        posting: Option<&Posting>,
        confirmation: Option<String>,
        title: &str,
    ) -> Result<Application, EngineError> {
        let lease = self.leases.acquire(id).await;
        let app = self.store.get_application(id).await?;
        let verification = VerificationPatch {
            is_verified: Some(true),
            verified_source: Some(EvidenceSource::Manual),
            email_confirmed: None,
            resolve_unverified: true,
        };
        let metadata = json!({ "source": EvidenceSource::Manual.as_str(), "confirmation": confirmation });

        if app.status != ApplicationStatus::Pending {
            if app.status == ApplicationStatus::Failed || app.status.ends_tracking() {
                return Err(StoreError::InvalidTransition {
                    from: app.status,
                    to: ApplicationStatus::Applied,
                }
                .into());
            }
            let updated = self
                .store
                .set_verification(
                    id,
                    verification,
                    NewEvent::new(EventKind::Verification, title).with_metadata(metadata),
                )
                .await?;
            drop(lease);
            self.publish(&updated, posting, ServerEvent::verification(&updated));
            return Ok(updated);
        }

        self.scheduler.cancel_application(id).await?;
        let now = Utc::now();
        let minutes = self.worker.settings().check_interval_minutes;
        let mut evidence =
            TransitionEvidence::new(NewEvent::new(EventKind::Applied, title).with_metadata(metadata));
        evidence.verification = Some(verification);
        evidence.tracking = Some(TrackingPatch {
            enabled: Some(true),
            external_handle: confirmation,
            check_frequency_minutes: Some(minutes),
            next_check: Some(now + chrono::Duration::minutes(minutes.max(30) as i64)),
            ..Default::default()
        });
        let updated = self
            .store
            .transition(id, ApplicationStatus::Applied, evidence)
            .await?;
        drop(lease);
        info!(application_id = %id, "Submission confirmed manually");

        self.publish(
            &updated,
            posting,
            ServerEvent::StatusUpdated {
                application_id: id,
                from: ApplicationStatus::Pending,
                to: ApplicationStatus::Applied,
                source: EvidenceSource::Manual,
                timestamp: now,
            },
        );
        self.publish(&updated, posting, ServerEvent::verification(&updated));
        self.monitor.arm(id).await;
        Ok(updated)
    }

    /// Candidates may withdraw, retry a failed submission, or answer an
    /// offer; recruiters may move their postings' applications through
    /// review. Everything else is refused.
    pub async fn update_status(
        &self,
        identity: Identity,
        id: Uuid,
        status: ApplicationStatus,
        notes: Option<String>,
    ) -> Result<Application, EngineError> {
        let (_, posting) = self.readable(identity, id).await?;
        let allowed = match identity.role {
            Role::Candidate => matches!(
                status,
                ApplicationStatus::Withdrawn
                    | ApplicationStatus::Accepted
                    | ApplicationStatus::Declined
                    | ApplicationStatus::Pending
            ),
            Role::Recruiter => evidence_may_reach(status) && status != ApplicationStatus::Applied,
        };
        if !allowed {
            return Err(EngineError::Forbidden(format!(
                "A {} may not set status {status}",
                identity.role
            )));
        }

        let lease = self.leases.acquire(id).await;
        let app = self.store.get_application(id).await?;
        let from = app.status;

        if status == ApplicationStatus::Withdrawn && from == ApplicationStatus::Pending {
            // Not yet submitted: withdrawing just drops the intent.
            self.scheduler.cancel_application(id).await?;
            self.store
                .update_tracking(
                    id,
                    TrackingPatch {
                        enabled: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            let mut event = NewEvent::new(EventKind::NoteAdded, "Withdrawn before submission");
            if let Some(notes) = notes {
                event = event.describe(notes);
            }
            self.store.append_event(id, event).await?;
            drop(lease);
            info!(application_id = %id, "Pending application withdrawn");
            return Ok(self.store.get_application(id).await?);
        }

        let kind = match status {
            ApplicationStatus::Withdrawn => EventKind::Withdrawn,
            ApplicationStatus::Rejected => EventKind::Rejection,
            ApplicationStatus::Offer => EventKind::Offer,
            ApplicationStatus::Interview => EventKind::InterviewScheduled,
            _ => EventKind::StatusChange,
        };
        let mut event = NewEvent::new(kind, format!("Status changed to {status}")).with_metadata(json!({
            "source": EvidenceSource::Manual.as_str(),
            "actor": identity.user_id,
            "role": identity.role.as_str(),
        }));
        if let Some(notes) = notes {
            event = event.describe(notes);
        }
        let mut evidence = TransitionEvidence::new(event);
        if status == ApplicationStatus::Pending {
            // Manual retry: make it schedulable again.
            evidence.tracking = Some(TrackingPatch {
                enabled: Some(true),
                ..Default::default()
            });
        }
        let updated = self.store.transition(id, status, evidence).await?;
        drop(lease);
        info!(application_id = %id, %from, to = %status, role = %identity.role, "Status updated manually");

        if status.ends_tracking() {
            self.monitor.detach(id);
        }
        self.publish(
            &updated,
            posting.as_ref(),
            ServerEvent::StatusUpdated {
                application_id: id,
                from,
                to: status,
                source: EvidenceSource::Manual,
                timestamp: Utc::now(),
            },
        );
        Ok(updated)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Monitoring
    // ────────────────────────────────────────────────────────────────────────

    pub async fn start_monitoring(
        &self,
        identity: Identity,
        id: Uuid,
        options: StartOptions,
    ) -> Result<MonitorStatus, EngineError> {
        self.owned(identity, id).await?;
        Ok(self.monitor.start(id, options).await?)
    }

    pub async fn stop_monitoring(&self, identity: Identity, id: Uuid) -> Result<MonitorStatus, EngineError> {
        self.owned(identity, id).await?;
        Ok(self.monitor.stop(id).await?)
    }

    pub async fn monitor_status(&self, identity: Identity, id: Uuid) -> Result<MonitorStatus, EngineError> {
        self.readable(identity, id).await?;
        Ok(self.monitor.status(id).await?)
    }

    pub async fn sync_gmail(
        &self,
        identity: Identity,
        since_days: Option<i64>,
        max_results_per_query: Option<u32>,
    ) -> Result<SyncSummary, EngineError> {
        let candidate_id = self.require_candidate(identity)?;
        Ok(self
            .monitor
            .sync_gmail_confirmations(
                candidate_id,
                since_days.unwrap_or(DEFAULT_SYNC_DAYS),
                max_results_per_query.unwrap_or(DEFAULT_SYNC_RESULTS).clamp(1, 100),
            )
            .await?)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ────────────────────────────────────────────────────────────────────────

    pub async fn schedule(&self, identity: Identity, application_ids: &[Uuid]) -> Result<ScheduleResult, EngineError> {
        let candidate_id = self.require_candidate(identity)?;
        if application_ids.is_empty() {
            return Err(EngineError::Invalid("application_ids must not be empty".to_string()));
        }
        Ok(self.scheduler.plan(candidate_id, application_ids).await?)
    }

    pub async fn cancel_schedule(&self, identity: Identity, id: Uuid) -> Result<Application, EngineError> {
        self.owned(identity, id).await?;
        self.scheduler.cancel_application(id).await?;
        Ok(self.store.get_application(id).await?)
    }

    pub async fn disable_automation(&self, identity: Identity) -> Result<usize, EngineError> {
        let candidate_id = self.require_candidate(identity)?;
        Ok(self.scheduler.disable_automation(candidate_id).await?)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────────────

    pub async fn list(&self, identity: Identity, limit: Option<i64>) -> Result<Vec<Application>, EngineError> {
        let limit = limit.unwrap_or(50).clamp(1, MAX_LIST);
        Ok(self.store.list_for_candidate(identity.user_id, limit).await?)
    }

    pub async fn events(&self, identity: Identity, id: Uuid) -> Result<Vec<ApplicationEvent>, EngineError> {
        self.readable(identity, id).await?;
        Ok(self.store.events(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Group;
    use crate::testing::{Fixture, ScriptedPage, GREENHOUSE_URL};

    async fn external() -> (Fixture, Engine) {
        let f = Fixture::new(GREENHOUSE_URL, vec![Arc::new(ScriptedPage::greenhouse_form(GREENHOUSE_URL))]).await;
        f.vault
            .store_credential(f.candidate, "greenhouse", None, "ada@x.io", "pw")
            .await
            .unwrap();
        let engine = f.engine();
        (f, engine)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<ServerEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_dynamically_submits_through_portal() {
        let (f, engine) = external().await;
        let mut session = f.bus.subscribe(Group::User(f.candidate));

        let resp = engine
            .apply_dynamically(Identity::candidate(f.candidate), f.posting)
            .await
            .unwrap();

        assert!(resp.success);
        assert!(resp.external_link_followed);
        assert!(!resp.already_applied);
        assert_eq!(resp.confirmation_number.as_deref(), Some("GH-4821"));
        assert_eq!(resp.application.status, ApplicationStatus::Applied);
        assert_eq!(
            resp.application.artifacts.iter().filter(|a| a.kind == "screenshot").count(),
            3
        );
        assert!(engine.monitor().is_live(resp.application_id));

        let kinds = drain(&mut session.rx);
        assert_eq!(kinds.iter().filter(|k| **k == "application_update").count(), 1);
        assert_eq!(kinds.first(), Some(&"application_created"));
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_apply_reports_already_applied() {
        let (f, engine) = external().await;
        let me = Identity::candidate(f.candidate);

        let first = engine.apply_dynamically(me, f.posting).await.unwrap();
        let second = engine.apply_dynamically(me, f.posting).await.unwrap();

        assert!(second.success);
        assert!(second.already_applied);
        assert_eq!(second.application_id, first.application_id);
        assert_eq!(f.pages.opened(), 1);
        assert_eq!(engine.list(me, None).await.unwrap().len(), 1);
        let applied = engine
            .events(me, first.application_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::Applied)
            .count();
        assert_eq!(applied, 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_internal_posting_is_applied_without_browser() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let internal = f.add_posting(None, "Acme", "Staff Engineer").await;

        let resp = engine
            .apply_dynamically(Identity::candidate(f.candidate), internal)
            .await
            .unwrap();

        assert!(resp.success);
        assert!(!resp.external_link_followed);
        assert_eq!(resp.application.status, ApplicationStatus::Applied);
        assert_eq!(resp.application.method, SubmissionMethod::Api);
        assert_eq!(f.pages.opened(), 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_posting_is_reported() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let err = engine
            .apply(Identity::candidate(f.candidate), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PostingNotFound(_)));
    }

    #[tokio::test]
    async fn test_confirm_applied_resolves_pending() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let me = Identity::candidate(f.candidate);
        let app = engine.apply(me, f.posting, None).await.unwrap().application;
        assert_eq!(app.method, SubmissionMethod::Manual);
        assert!(!app.tracking_enabled);

        let app = engine
            .confirm_applied(me, app.id, Some("GH-1001".to_string()))
            .await
            .unwrap();

        assert_eq!(app.status, ApplicationStatus::Applied);
        assert!(app.is_verified);
        assert_eq!(app.verified_source, Some(EvidenceSource::Manual));
        assert!(app.tracking_enabled);
        let tracking = f.store.tracking(app.id).await.unwrap().unwrap();
        assert_eq!(tracking.external_handle.as_deref(), Some("GH-1001"));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_verify_refuses_unsubmitted_application() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let me = Identity::candidate(f.candidate);
        let app = engine.apply(me, f.posting, None).await.unwrap().application;
        assert!(matches!(engine.verify(me, app.id).await, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_status_permissions() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let recruiter = Uuid::new_v4();
        let posting = Uuid::new_v4();
        f.directory
            .insert_posting(Posting {
                id: posting,
                title: "Platform Engineer".to_string(),
                company: "Acme".to_string(),
                url: None,
                apply_url: None,
                location: None,
                salary_max: None,
                recruiter_id: Some(recruiter),
            })
            .await;
        let me = Identity::candidate(f.candidate);
        let app = engine.apply(me, posting, None).await.unwrap().application;
        engine.confirm_applied(me, app.id, None).await.unwrap();

        let err = engine
            .update_status(me, app.id, ApplicationStatus::Interview, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let stranger = Identity::recruiter(Uuid::new_v4());
        let err = engine
            .update_status(stranger, app.id, ApplicationStatus::Interview, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let mut session = f.bus.subscribe(Group::Recruiter(recruiter));
        let updated = engine
            .update_status(Identity::recruiter(recruiter), app.id, ApplicationStatus::Interview, Some("Onsite next week".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.status, ApplicationStatus::Interview);
        assert!(matches!(
            session.rx.try_recv().unwrap(),
            ServerEvent::StatusUpdated { to: ApplicationStatus::Interview, source: EvidenceSource::Manual, .. }
        ));

        // Backward moves are still refused by the state machine.
        let err = engine
            .update_status(Identity::recruiter(recruiter), app.id, ApplicationStatus::InReview, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::InvalidTransition { .. })));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_withdrawing_pending_application_cancels_slot() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let me = Identity::candidate(f.candidate);
        let app = engine
            .apply(me, f.posting, Some(SubmissionMethod::Browser))
            .await
            .unwrap()
            .application;
        let plan = engine.schedule(me, &[app.id]).await.unwrap();
        assert_eq!(plan.plan.slots.len(), 1);
        assert!(f.store.get_application(app.id).await.unwrap().scheduled_at.is_some());

        let app = engine
            .update_status(me, app.id, ApplicationStatus::Withdrawn, None)
            .await
            .unwrap();

        assert_eq!(app.status, ApplicationStatus::Pending);
        assert!(app.scheduled_at.is_none());
        assert!(!app.tracking_enabled);
    }

    #[tokio::test]
    async fn test_foreign_application_is_hidden() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let app = engine
            .apply(Identity::candidate(f.candidate), f.posting, None)
            .await
            .unwrap()
            .application;

        let other = Identity::candidate(Uuid::new_v4());
        assert!(matches!(engine.events(other, app.id).await, Err(EngineError::Forbidden(_))));
        assert!(matches!(
            engine.schedule(other, &[app.id]).await,
            Err(EngineError::Scheduler(SchedulerError::NotOwned { .. }))
        ));
        assert!(matches!(
            engine.apply(Identity::recruiter(f.candidate), f.posting, None).await,
            Err(EngineError::Forbidden(_))
        ));
    }
}

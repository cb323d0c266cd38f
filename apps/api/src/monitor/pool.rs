use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ats::{map_external_status, AtsProvider};
use super::classify::{classify, EmailSignal};
use super::fusion::fuse;
use super::inbox::{build_query, Inbox, MessageMeta};
use super::limiter::ProviderLimiter;
use super::{failure_record, MonitorError, Observation};
use crate::directory::Directory;
use crate::events::{EventBus, ServerEvent};
use crate::models::application::{
    Application, ApplicationStatus, EventKind, EvidenceSource, NewEvent, ObservationRecord,
    TrackingConfig,
};
use crate::models::directory::Posting;
use crate::portal::PortalFamily;
use crate::store::{
    ApplicationStore, LeaseRegistry, TrackingPatch, TransitionEvidence, VerificationPatch,
};
use crate::submission::MonitorHook;
use crate::vault::Vault;

/// OAuth provider under which inbox grants are stored in the vault.
pub const GMAIL_PROVIDER: &str = "google";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// How often the supervisor looks for applications nobody is watching.
    pub sweep: Duration,
    pub default_interval_minutes: i32,
    pub email_lookback_days: i64,
    pub max_results_per_query: u32,
    pub provider_qps: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sweep: Duration::from_secs(300),
            default_interval_minutes: 60,
            email_lookback_days: 14,
            max_results_per_query: 10,
            provider_qps: 2,
        }
    }
}

#[derive(Clone)]
pub struct MonitorDeps {
    pub store: Arc<dyn ApplicationStore>,
    pub leases: LeaseRegistry,
    pub directory: Arc<dyn Directory>,
    pub vault: Arc<Vault>,
    pub ats: Arc<dyn AtsProvider>,
    pub inbox: Arc<dyn Inbox>,
    pub bus: EventBus,
}

/// Caller-supplied knobs for `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub check_frequency_minutes: Option<i32>,
    pub email_monitoring: Option<bool>,
    pub keywords: Option<Vec<String>>,
    pub external_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub tracking_enabled: bool,
    /// A loop is currently running for the application.
    pub live: bool,
    pub tracking: Option<TrackingConfig>,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub application: Application,
    pub transition: Option<(ApplicationStatus, ApplicationStatus, EvidenceSource)>,
    pub observations: usize,
    pub failures: usize,
    /// Whether monitoring should continue.
    pub live: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub application_ids: Vec<Uuid>,
}

struct PoolInner {
    deps: MonitorDeps,
    limiter: ProviderLimiter,
    settings: MonitorSettings,
    loops: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

/// One cooperative loop per live application; every loop shares the
/// per-provider limiter and the store's application leases.
#[derive(Clone)]
pub struct MonitorPool {
    inner: Arc<PoolInner>,
}

#[async_trait]
impl MonitorHook for MonitorPool {
    async fn arm(&self, application_id: Uuid) {
        self.spawn_loop(application_id);
    }
}

impl MonitorPool {
    pub fn new(deps: MonitorDeps, settings: MonitorSettings, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limiter: ProviderLimiter::new(settings.provider_qps),
                deps,
                settings,
                loops: DashMap::new(),
                shutdown,
            }),
        }
    }

    pub fn is_live(&self, application_id: Uuid) -> bool {
        self.inner.loops.contains_key(&application_id)
    }

    pub fn live_count(&self) -> usize {
        self.inner.loops.len()
    }

    /// Ends the application's loop without touching its tracking row.
    pub fn detach(&self, application_id: Uuid) {
        if let Some((_, token)) = self.inner.loops.remove(&application_id) {
            token.cancel();
            debug!(%application_id, "Monitor loop detached");
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Control
    // ────────────────────────────────────────────────────────────────────────

    pub async fn start(&self, id: Uuid, options: StartOptions) -> Result<MonitorStatus, MonitorError> {
        let deps = &self.inner.deps;
        let app = deps.store.get_application(id).await?;
        let eligible = app.status.is_monitored()
            || (app.status == ApplicationStatus::Pending && app.unverified_submission);
        if !eligible {
            return Err(MonitorError::NotMonitorable {
                id,
                status: app.status,
            });
        }

        let now = Utc::now();
        let minutes = options
            .check_frequency_minutes
            .unwrap_or(self.inner.settings.default_interval_minutes)
            .max(TrackingConfig::MIN_CHECK_MINUTES);
        let family = app.apply_url.as_deref().map(PortalFamily::detect);
        let tracking = deps
            .store
            .update_tracking(
                id,
                TrackingPatch {
                    enabled: Some(true),
                    ats_system: family.filter(PortalFamily::has_ats).map(|f| f.provider().to_string()),
                    external_handle: options.external_handle,
                    check_frequency_minutes: Some(minutes),
                    next_check: Some(now + chrono::Duration::minutes(minutes as i64)),
                    email_monitoring: options.email_monitoring,
                    keywords: options.keywords,
                    ..Default::default()
                },
            )
            .await?;
        info!(application_id = %id, minutes, "Monitoring started");

        self.spawn_loop(id);
        self.publish(
            &app,
            ServerEvent::TrackingUpdate {
                application_id: id,
                active: true,
                next_check: Some(tracking.next_check),
            },
        )
        .await;
        self.status(id).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<MonitorStatus, MonitorError> {
        let deps = &self.inner.deps;
        let app = deps.store.get_application(id).await?;
        if let Some((_, token)) = self.inner.loops.remove(&id) {
            token.cancel();
        }
        if app.tracking_enabled || deps.store.tracking(id).await?.is_some() {
            deps.store
                .update_tracking(
                    id,
                    TrackingPatch {
                        enabled: Some(false),
                        email_monitoring: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
        }
        info!(application_id = %id, "Monitoring stopped");
        self.publish(
            &app,
            ServerEvent::TrackingUpdate {
                application_id: id,
                active: false,
                next_check: None,
            },
        )
        .await;
        self.status(id).await
    }

    pub async fn status(&self, id: Uuid) -> Result<MonitorStatus, MonitorError> {
        let deps = &self.inner.deps;
        let app = deps.store.get_application(id).await?;
        let tracking = deps.store.tracking(id).await?;
        Ok(MonitorStatus {
            application_id: id,
            status: app.status,
            tracking_enabled: app.tracking_enabled,
            live: self.is_live(id),
            tracking,
        })
    }

    // ────────────────────────────────────────────────────────────────────────
    // Loops
    // ────────────────────────────────────────────────────────────────────────

    fn spawn_loop(&self, id: Uuid) {
        let token = match self.inner.loops.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = self.inner.shutdown.child_token();
                slot.insert(token.clone());
                token
            }
        };
        debug!(application_id = %id, "Monitor loop spawned");
        let pool = self.clone();
        tokio::spawn(async move { pool.run_loop(id, token).await });
    }

    async fn run_loop(&self, id: Uuid, token: CancellationToken) {
        let sweep = self.inner.settings.sweep;
        loop {
            let wait = match self.inner.deps.store.tracking(id).await {
                Ok(Some(t)) => (t.next_check - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                Ok(None) => Duration::ZERO,
                Err(e) => {
                    warn!(application_id = %id, error = %e, "Tracking read failed");
                    sweep
                }
            };
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.check_once(id, Utc::now()).await {
                Ok(report) if !report.live => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(application_id = %id, error = %e, "Monitor check failed");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(sweep) => {}
                    }
                }
            }
        }
        self.inner.loops.remove(&id);
        debug!(application_id = %id, "Monitor loop finished");
    }

    /// Starts loops for tracked applications nobody is watching, e.g. after a
    /// restart. Returns how many were started.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, MonitorError> {
        let horizon = now + chrono::Duration::from_std(self.inner.settings.sweep).unwrap_or_else(|_| chrono::Duration::zero());
        let due = self.inner.deps.store.find_due_for_monitoring(horizon).await?;
        let mut started = 0;
        for app in due.iter().filter(|a| a.is_monitorable()) {
            if !self.is_live(app.id) {
                self.spawn_loop(app.id);
                started += 1;
            }
        }
        if started > 0 {
            info!(started, "Monitor loops resumed");
        }
        Ok(started)
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.settings.sweep);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(sweep_secs = self.inner.settings.sweep.as_secs(), "Monitor supervisor started");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!(error = %e, "Monitor sweep failed");
                    }
                }
            }
        }
        info!("Monitor supervisor stopped");
    }

    // ────────────────────────────────────────────────────────────────────────
    // One check
    // ────────────────────────────────────────────────────────────────────────

    /// Consults every configured source once, commits the fused transition if
    /// any, and schedules the next check.
    pub async fn check_once(&self, id: Uuid, now: DateTime<Utc>) -> Result<CheckReport, MonitorError> {
        let deps = &self.inner.deps;
        let _lease = deps.leases.acquire(id).await;

        let app = deps.store.get_application(id).await?;
        if !app.is_monitorable() {
            return Ok(CheckReport {
                application: app,
                transition: None,
                observations: 0,
                failures: 0,
                live: false,
            });
        }
        let tracking = match deps.store.tracking(id).await? {
            Some(t) => t,
            None => TrackingConfig::new(id, self.inner.settings.default_interval_minutes, now),
        };
        let posting = deps.directory.posting(app.posting_id).await?;

        let mut observations = Vec::new();
        let mut failures = Vec::new();
        self.observe_ats(&app, &tracking, posting.as_ref(), now, &mut observations, &mut failures)
            .await;
        if tracking.email_monitoring {
            self.observe_inbox(&app, &tracking, posting.as_ref(), now, &mut observations, &mut failures)
                .await;
        }

        let mut history: Vec<ObservationRecord> = observations.iter().map(Observation::record).collect();
        let failure_count = failures.len();
        history.extend(failures);
        let patch = TrackingPatch {
            append_history: history,
            checked_at: Some(now),
            next_check: Some(now + tracking.interval()),
            ..Default::default()
        };
        let confirmation = observations.iter().find(|o| o.confirms_submission).cloned();

        if let Some(picked) = fuse(app.status, &observations).cloned() {
            if let Some(to) = picked.status {
                let updated = self.commit_transition(&app, to, &picked, confirmation.is_some(), patch).await?;
                return Ok(CheckReport {
                    live: updated.is_monitorable(),
                    application: updated,
                    transition: Some((app.status, to, picked.source)),
                    observations: observations.len(),
                    failures: failure_count,
                });
            }
        }

        deps.store.update_tracking(id, patch).await?;
        if let Some(obs) = confirmation.filter(|_| !app.email_confirmed) {
            let verified = deps
                .store
                .set_verification(
                    id,
                    VerificationPatch {
                        is_verified: Some(true),
                        verified_source: (!app.is_verified).then_some(EvidenceSource::Email),
                        email_confirmed: Some(true),
                        resolve_unverified: false,
                    },
                    NewEvent::new(EventKind::EmailReceived, "Confirmation email received")
                        .describe(obs.detail.clone())
                        .with_metadata(json!({ "message_id": obs.message_id })),
                )
                .await?;
            info!(application_id = %id, "Submission confirmed by email");
            self.publish(&verified, ServerEvent::verification(&verified)).await;
        }

        let application = deps.store.get_application(id).await?;
        debug!(
            application_id = %id,
            observations = observations.len(),
            failures = failure_count,
            "Monitor check without status change"
        );
        Ok(CheckReport {
            live: application.is_monitorable(),
            application,
            transition: None,
            observations: observations.len(),
            failures: failure_count,
        })
    }

    async fn commit_transition(
        &self,
        app: &Application,
        to: ApplicationStatus,
        picked: &Observation,
        email_confirmed: bool,
        patch: TrackingPatch,
    ) -> Result<Application, MonitorError> {
        let from = app.status;
        let mut evidence = TransitionEvidence::new(
            NewEvent::new(EventKind::StatusChange, format!("Status changed to {to}"))
                .describe(picked.detail.clone())
                .with_metadata(json!({
                    "source": picked.source.as_str(),
                    "confidence": picked.confidence,
                    "observed_at": picked.observed_at,
                })),
        );
        if picked.source == EvidenceSource::Email {
            evidence.extra_events.push(
                NewEvent::new(EventKind::EmailReceived, "Status email received")
                    .describe(picked.detail.clone())
                    .with_metadata(json!({ "message_id": picked.message_id, "status": to.as_str() })),
            );
        }
        evidence.verification = Some(VerificationPatch {
            is_verified: Some(true),
            verified_source: (!app.is_verified).then_some(picked.source),
            email_confirmed: email_confirmed.then_some(true),
            resolve_unverified: from == ApplicationStatus::Pending,
        });
        evidence.tracking = Some(patch);

        let updated = self.inner.deps.store.transition(app.id, to, evidence).await?;
        info!(
            application_id = %app.id,
            %from,
            %to,
            source = picked.source.as_str(),
            "Status advanced by monitor"
        );

        self.publish(
            &updated,
            ServerEvent::StatusUpdated {
                application_id: app.id,
                from,
                to,
                source: picked.source,
                timestamp: Utc::now(),
            },
        )
        .await;
        if from == ApplicationStatus::Pending {
            self.publish(&updated, ServerEvent::verification(&updated)).await;
        }
        if !updated.is_monitorable() {
            self.publish(
                &updated,
                ServerEvent::TrackingUpdate {
                    application_id: app.id,
                    active: false,
                    next_check: None,
                },
            )
            .await;
        }
        Ok(updated)
    }

    async fn observe_ats(
        &self,
        app: &Application,
        tracking: &TrackingConfig,
        posting: Option<&Posting>,
        now: DateTime<Utc>,
        observations: &mut Vec<Observation>,
        failures: &mut Vec<ObservationRecord>,
    ) {
        // An explicitly configured ATS wins over URL detection.
        let configured = tracking.ats_system.as_deref().and_then(PortalFamily::from_provider);
        let family = match configured {
            Some(family) => family,
            None => {
                let Some(url) = app
                    .apply_url
                    .as_deref()
                    .or_else(|| posting.and_then(Posting::navigation_url))
                else {
                    return;
                };
                PortalFamily::detect(url)
            }
        };
        let handle = tracking
            .external_handle
            .clone()
            .or_else(|| app.external_confirmation.clone());
        let (true, Some(handle)) = (family.has_ats(), handle) else {
            return;
        };

        self.inner.limiter.acquire(family.provider()).await;
        match self.inner.deps.ats.status(family, &handle).await {
            Ok(reply) => {
                let status = map_external_status(&reply.status);
                let mut detail = format!("{family} reports '{}'", reply.status);
                if let Some(stage) = &reply.stage {
                    detail.push_str(&format!(" ({stage})"));
                }
                if status.is_none() {
                    debug!(application_id = %app.id, external = %reply.status, "Unmapped ATS status");
                }
                observations.push(Observation::new(
                    EvidenceSource::Ats,
                    status,
                    reply.updated_at.unwrap_or(now),
                    detail,
                ));
            }
            Err(MonitorError::Unsupported(provider)) => {
                debug!(application_id = %app.id, provider, "No ATS endpoint configured");
            }
            Err(e) => {
                warn!(application_id = %app.id, %family, error = %e, "ATS source unavailable");
                failures.push(failure_record(EvidenceSource::Ats, now, &e));
            }
        }
    }

    async fn observe_inbox(
        &self,
        app: &Application,
        tracking: &TrackingConfig,
        posting: Option<&Posting>,
        now: DateTime<Utc>,
        observations: &mut Vec<Observation>,
        failures: &mut Vec<ObservationRecord>,
    ) {
        let token = match self.inner.deps.vault.access_token(app.candidate_id, GMAIL_PROVIDER).await {
            Ok(t) => t,
            Err(e) => {
                debug!(application_id = %app.id, error = %e, "Inbox source unavailable");
                failures.push(failure_record(EvidenceSource::Email, now, &e));
                return;
            }
        };
        let lookback = now - chrono::Duration::days(self.inner.settings.email_lookback_days);
        let after = app.applied_at.unwrap_or(app.created_at).max(lookback);
        let (company, title) = posting
            .map(|p| (p.company.as_str(), p.title.as_str()))
            .unwrap_or_default();

        match self
            .scan_inbox(&token, company, title, &tracking.keywords, after, self.inner.settings.max_results_per_query)
            .await
        {
            Ok(messages) => {
                for (msg, signal) in messages {
                    let status = match signal {
                        EmailSignal::Status(s) => Some(s),
                        EmailSignal::Confirmation if app.status == ApplicationStatus::Pending => {
                            Some(ApplicationStatus::Applied)
                        }
                        EmailSignal::Confirmation => None,
                    };
                    let mut obs = Observation::new(
                        EvidenceSource::Email,
                        status,
                        msg.date.unwrap_or(now),
                        format!("{}: {}", msg.from, msg.subject),
                    );
                    obs.confirms_submission = signal == EmailSignal::Confirmation;
                    obs.message_id = Some(msg.id);
                    observations.push(obs);
                }
            }
            Err(e) => {
                warn!(application_id = %app.id, error = %e, "Inbox search failed");
                failures.push(failure_record(EvidenceSource::Email, now, &e));
            }
        }
    }

    /// Relevant messages received after `after`, newest evidence included.
    async fn scan_inbox(
        &self,
        token: &str,
        company: &str,
        title: &str,
        keywords: &[String],
        after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<(MessageMeta, EmailSignal)>, MonitorError> {
        let inbox = &self.inner.deps.inbox;
        let query = build_query(company, title, keywords, after.date_naive());
        self.inner.limiter.acquire("gmail").await;
        let ids = inbox.search(token, &query, max_results).await?;

        let mut found = Vec::new();
        for message_id in ids.into_iter().take(max_results as usize) {
            self.inner.limiter.acquire("gmail").await;
            let msg = inbox.metadata(token, &message_id).await?;
            if msg.date.is_some_and(|d| d < after) {
                continue;
            }
            if let Some(signal) = classify(&msg, company, title) {
                found.push((msg, signal));
            }
        }
        Ok(found)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Inbox sync
    // ────────────────────────────────────────────────────────────────────────

    /// Scans the candidate's inbox for submission confirmations of every
    /// application not yet confirmed by email.
    pub async fn sync_gmail_confirmations(
        &self,
        candidate_id: Uuid,
        since_days: i64,
        max_results: u32,
    ) -> Result<SyncSummary, MonitorError> {
        let deps = &self.inner.deps;
        let token = deps.vault.access_token(candidate_id, GMAIL_PROVIDER).await?;
        let now = Utc::now();
        let since = now - chrono::Duration::days(since_days.max(1));

        let candidates: Vec<Application> = deps
            .store
            .list_for_candidate(candidate_id, 500)
            .await?
            .into_iter()
            .filter(|a| {
                !a.email_confirmed
                    && (a.status.is_monitored()
                        || (a.status == ApplicationStatus::Pending && a.unverified_submission))
            })
            .collect();

        let mut summary = SyncSummary::default();
        for app in candidates {
            summary.checked += 1;
            let _lease = deps.leases.acquire(app.id).await;
            let app = deps.store.get_application(app.id).await?;
            if app.email_confirmed {
                continue;
            }
            let posting = deps.directory.posting(app.posting_id).await?;
            let (company, title) = posting
                .as_ref()
                .map(|p| (p.company.as_str(), p.title.as_str()))
                .unwrap_or_default();
            let after = app.applied_at.unwrap_or(app.created_at).min(now).max(since);

            let messages = self
                .scan_inbox(&token, company, title, &[], after, max_results)
                .await?;
            let Some((msg, _)) = messages
                .into_iter()
                .find(|(_, s)| *s == EmailSignal::Confirmation)
            else {
                continue;
            };

            let detail = format!("{}: {}", msg.from, msg.subject);
            let verification = VerificationPatch {
                is_verified: Some(true),
                verified_source: (!app.is_verified).then_some(EvidenceSource::Email),
                email_confirmed: Some(true),
                resolve_unverified: app.status == ApplicationStatus::Pending,
            };
            let event = NewEvent::new(EventKind::EmailReceived, "Confirmation email received")
                .describe(detail.clone())
                .with_metadata(json!({ "message_id": msg.id }));

            let updated = if app.status == ApplicationStatus::Pending {
                let mut evidence = TransitionEvidence::new(
                    NewEvent::new(EventKind::StatusChange, "Submission confirmed by email")
                        .describe(detail)
                        .with_metadata(json!({
                            "source": EvidenceSource::Email.as_str(),
                            "confidence": EvidenceSource::Email.confidence(),
                        })),
                );
                evidence.extra_events.push(event);
                evidence.verification = Some(verification);
                deps.store
                    .transition(app.id, ApplicationStatus::Applied, evidence)
                    .await?
            } else {
                deps.store.set_verification(app.id, verification, event).await?
            };

            summary.confirmed += 1;
            summary.application_ids.push(app.id);
            self.publish(&updated, ServerEvent::verification(&updated)).await;
        }
        info!(%candidate_id, checked = summary.checked, confirmed = summary.confirmed, "Inbox sync finished");
        Ok(summary)
    }

    async fn publish(&self, app: &Application, event: ServerEvent) {
        let recruiter = match self.inner.deps.directory.posting(app.posting_id).await {
            Ok(posting) => posting.and_then(|p| p.recruiter_id),
            Err(e) => {
                warn!(application_id = %app.id, error = %e, "Posting lookup failed; recruiter not notified");
                None
            }
        };
        self.inner.deps.bus.publish_application(app.candidate_id, recruiter, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Group;
    use crate::monitor::MessageMeta;
    use crate::store::{SubmissionCommit, SubmissionOutcome};
    use crate::testing::{FakeAts, FakeInbox, Fixture, GREENHOUSE_URL};

    struct Harness {
        f: Fixture,
        ats: Arc<FakeAts>,
        inbox: Arc<FakeInbox>,
        pool: MonitorPool,
    }

    async fn harness() -> Harness {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let ats = Arc::new(FakeAts::default());
        let inbox = Arc::new(FakeInbox::default());
        let pool = MonitorPool::new(
            MonitorDeps {
                store: f.store.clone(),
                leases: f.leases.clone(),
                directory: f.directory.clone(),
                vault: f.vault.clone(),
                ats: ats.clone(),
                inbox: inbox.clone(),
                bus: f.bus.clone(),
            },
            MonitorSettings::default(),
            CancellationToken::new(),
        );
        Harness { f, ats, inbox, pool }
    }

    async fn commit(f: &Fixture, id: Uuid, outcome: SubmissionOutcome) -> Application {
        f.store
            .commit_submission(
                id,
                SubmissionCommit {
                    attempt_id: "20261018T090000-0000abcd".to_string(),
                    navigation_url: Some(GREENHOUSE_URL.to_string()),
                    artifacts: Vec::new(),
                    outcome,
                    check_frequency_minutes: 60,
                    at: Utc::now() - chrono::Duration::hours(2),
                    verified_source: None,
                },
            )
            .await
            .unwrap()
    }

    async fn applied(f: &Fixture, confirmation: &str) -> Application {
        let app = f.pending().await;
        commit(
            f,
            app.id,
            SubmissionOutcome::Applied {
                confirmation: Some(confirmation.to_string()),
            },
        )
        .await
    }

    async fn grant_inbox(f: &Fixture) {
        f.vault
            .store_oauth_token(f.candidate, GMAIL_PROVIDER, "refresh-1")
            .await
            .unwrap();
        f.tokens.push_ok("access-1", 3600);
    }

    fn message(id: &str, subject: &str, from: &str, date: DateTime<Utc>) -> MessageMeta {
        MessageMeta {
            id: id.to_string(),
            subject: subject.to_string(),
            from: from.to_string(),
            date: Some(date),
            snippet: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ats_interview_advances_application() {
        let h = harness().await;
        let app = applied(&h.f, "GH-777").await;
        h.ats.set("GH-777", "interview");
        let mut session = h.f.bus.subscribe(Group::User(h.f.candidate));

        let now = Utc::now();
        let report = h.pool.check_once(app.id, now).await.unwrap();

        assert_eq!(
            report.transition,
            Some((ApplicationStatus::Applied, ApplicationStatus::Interview, EvidenceSource::Ats))
        );
        assert!(report.live);
        assert_eq!(report.application.status, ApplicationStatus::Interview);

        let tracking = h.f.store.tracking(app.id).await.unwrap().unwrap();
        assert_eq!(tracking.next_check, now + chrono::Duration::minutes(60));
        assert_eq!(tracking.last_check, Some(now));

        let event = session.rx.try_recv().unwrap();
        assert!(matches!(
            event,
            ServerEvent::StatusUpdated {
                to: ApplicationStatus::Interview,
                source: EvidenceSource::Ats,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rejection_email_ends_tracking() {
        let h = harness().await;
        let app = applied(&h.f, "GH-778").await;
        grant_inbox(&h.f).await;
        h.inbox.push(message(
            "m-1",
            "We regret to inform you…",
            "talent@acme.com",
            Utc::now() - chrono::Duration::minutes(10),
        ));

        let report = h.pool.check_once(app.id, Utc::now()).await.unwrap();

        assert_eq!(report.application.status, ApplicationStatus::Rejected);
        assert!(!report.live);
        assert!(!report.application.tracking_enabled);
        let kinds: Vec<EventKind> = h.f.store.events(app.id).await.unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::EmailReceived));
        assert!(kinds.contains(&EventKind::StatusChange));
        assert!(!h.f.store.tracking(app.id).await.unwrap().unwrap().email_monitoring);
    }

    #[tokio::test]
    async fn test_messages_older_than_submission_are_ignored() {
        let h = harness().await;
        let app = applied(&h.f, "GH-779").await;
        grant_inbox(&h.f).await;
        h.inbox.push(message(
            "m-old",
            "We regret to inform you…",
            "talent@acme.com",
            Utc::now() - chrono::Duration::days(3),
        ));

        let report = h.pool.check_once(app.id, Utc::now()).await.unwrap();
        assert!(report.transition.is_none());
        assert_eq!(report.application.status, ApplicationStatus::Applied);
    }

    #[tokio::test]
    async fn test_source_failure_is_recorded_without_change() {
        let h = harness().await;
        let app = applied(&h.f, "GH-780").await;
        h.ats.fail("GH-780");

        let report = h.pool.check_once(app.id, Utc::now()).await.unwrap();

        assert!(report.transition.is_none());
        assert!(report.live);
        // ATS outage plus the inbox grant that was never given.
        assert_eq!(report.failures, 2);
        let history = h.f.store.tracking(app.id).await.unwrap().unwrap().history;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.error.is_some() && r.status.is_none()));
        assert_eq!(h.f.store.get_application(app.id).await.unwrap().status, ApplicationStatus::Applied);
    }

    #[tokio::test]
    async fn test_confirmation_email_resolves_unverified_submission() {
        let h = harness().await;
        let app = h.f.pending().await;
        commit(
            &h.f,
            app.id,
            SubmissionOutcome::Unverified {
                message: "no confirmation found".to_string(),
            },
        )
        .await;
        grant_inbox(&h.f).await;
        h.inbox.push(message(
            "m-2",
            "Thank you for your application",
            "Acme Careers <jobs@acme.com>",
            Utc::now(),
        ));

        let report = h.pool.check_once(app.id, Utc::now()).await.unwrap();

        let app = report.application;
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert!(!app.unverified_submission);
        assert!(app.email_confirmed);
        assert!(app.is_verified);
        assert_eq!(app.verified_source, Some(EvidenceSource::Email));
    }

    #[tokio::test]
    async fn test_confirmation_email_on_applied_marks_verified() {
        let h = harness().await;
        let app = applied(&h.f, "GH-781").await;
        grant_inbox(&h.f).await;
        h.inbox.push(message(
            "m-3",
            "Application received: Senior Engineer",
            "no-reply@greenhouse.io",
            Utc::now(),
        ));

        let report = h.pool.check_once(app.id, Utc::now()).await.unwrap();

        assert!(report.transition.is_none());
        assert!(report.application.email_confirmed);
        assert_eq!(report.application.status, ApplicationStatus::Applied);
    }

    #[tokio::test]
    async fn test_start_stop_and_status() {
        let h = harness().await;
        let app = applied(&h.f, "GH-782").await;

        let started = h
            .pool
            .start(
                app.id,
                StartOptions {
                    check_frequency_minutes: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(started.live);
        assert_eq!(started.tracking.unwrap().check_frequency_minutes, 30);

        let stopped = h.pool.stop(app.id).await.unwrap();
        assert!(!stopped.live);
        assert!(!stopped.tracking_enabled);
        assert!(!stopped.tracking.unwrap().email_monitoring);
    }

    #[tokio::test]
    async fn test_start_refuses_pending_application() {
        let h = harness().await;
        let app = h.f.pending().await;
        let err = h.pool.start(app.id, StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, MonitorError::NotMonitorable { status: ApplicationStatus::Pending, .. }));
    }

    #[tokio::test]
    async fn test_gmail_sync_confirms_applications() {
        let h = harness().await;
        let app = applied(&h.f, "GH-783").await;
        grant_inbox(&h.f).await;
        h.inbox.push(message(
            "m-4",
            "Thank you for applying to Acme",
            "jobs@acme.com",
            Utc::now(),
        ));

        let summary = h.pool.sync_gmail_confirmations(h.f.candidate, 30, 10).await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.application_ids, vec![app.id]);
        assert!(h.f.store.get_application(app.id).await.unwrap().email_confirmed);

        let again = h.pool.sync_gmail_confirmations(h.f.candidate, 30, 10).await.unwrap();
        assert_eq!(again.checked, 0);
    }

    #[tokio::test]
    async fn test_gmail_sync_without_grant_fails() {
        let h = harness().await;
        let err = h.pool.sync_gmail_confirmations(h.f.candidate, 30, 10).await.unwrap_err();
        assert!(matches!(err, MonitorError::Vault(_)));
    }
}

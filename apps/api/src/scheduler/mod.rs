//! Scheduler: assigns submission slots and dispatches due submissions to the
//! Submission Worker.
//!
//! Slots live in the store (`Application.scheduled_at`); the tick loop only
//! ever asks the store what is due, so a restart loses nothing but the
//! in-memory retry counters.

pub mod planner;
pub mod tiers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::directory::{Directory, DirectoryError};
use crate::events::{EventBus, Group, ServerEvent};
use crate::models::application::{Application, ApplicationStatus};
use crate::store::{ApplicationStore, StoreError};
use crate::submission::{AttemptOutcome, SubmissionTask, SubmissionWorker};

pub use planner::{BookedSlot, PlanItem, SchedulePlan, ScheduledSlot, SkipReason, SkippedItem};
pub use tiers::Tier;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Application {application_id} does not belong to candidate {candidate_id}")]
    NotOwned {
        application_id: Uuid,
        candidate_id: Uuid,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    /// Portal sessions allowed at once across all candidates.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResult {
    /// Present when at least one slot was assigned.
    pub batch_id: Option<Uuid>,
    #[serde(flatten)]
    pub plan: SchedulePlan,
}

#[derive(Debug)]
struct Batch {
    candidate_id: Uuid,
    total: usize,
    completed: usize,
    succeeded: usize,
}

pub struct Scheduler {
    store: Arc<dyn ApplicationStore>,
    directory: Arc<dyn Directory>,
    worker: Arc<SubmissionWorker>,
    bus: EventBus,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    /// Candidates with a submission currently dispatched.
    in_flight: DashMap<Uuid, Uuid>,
    /// Attempts already made per application (transient retries only).
    attempts: DashMap<Uuid, u32>,
    /// Stop signal per candidate; cancelled by `disable_automation`.
    candidates: DashMap<Uuid, CancellationToken>,
    batches: DashMap<Uuid, Batch>,
    batch_of: DashMap<Uuid, Uuid>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        directory: Arc<dyn Directory>,
        worker: Arc<SubmissionWorker>,
        bus: EventBus,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            directory,
            worker,
            bus,
            permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            settings,
            in_flight: DashMap::new(),
            attempts: DashMap::new(),
            candidates: DashMap::new(),
            batches: DashMap::new(),
            batch_of: DashMap::new(),
            shutdown,
        }
    }

    /// Token cancelled when the candidate disables automation.
    pub fn candidate_token(&self, candidate_id: Uuid) -> CancellationToken {
        self.candidates
            .entry(candidate_id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    async fn score(&self, app: &Application) -> Result<f64, DirectoryError> {
        Ok(self
            .directory
            .match_score(app.candidate_id, app.posting_id)
            .await?
            .unwrap_or(0.0))
    }

    // ── planning ────────────────────────────────────────────────────────────

    pub async fn plan(
        &self,
        candidate_id: Uuid,
        application_ids: &[Uuid],
    ) -> Result<ScheduleResult, SchedulerError> {
        self.plan_at(candidate_id, application_ids, Utc::now()).await
    }

    /// Assigns slots to the given applications of one candidate and persists
    /// them. Applications that are not schedulable are reported as skipped.
    pub async fn plan_at(
        &self,
        candidate_id: Uuid,
        application_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, SchedulerError> {
        let prefs = self.directory.preferences(candidate_id).await?;
        let mut items = Vec::new();
        let mut not_pending = Vec::new();
        for &id in application_ids {
            let app = self.store.get_application(id).await?;
            if app.candidate_id != candidate_id {
                return Err(SchedulerError::NotOwned {
                    application_id: id,
                    candidate_id,
                });
            }
            if app.status != ApplicationStatus::Pending || !app.tracking_enabled || app.unverified_submission {
                not_pending.push(SkippedItem {
                    application_id: id,
                    reason: SkipReason::NotPending,
                });
                continue;
            }
            let posting = self.directory.posting(app.posting_id).await?;
            items.push(PlanItem {
                application_id: id,
                score: self.score(&app).await?,
                prepared_at: app.prepared_at,
                company: posting.as_ref().map(|p| p.company.clone()).unwrap_or_default(),
                location: posting.as_ref().and_then(|p| p.location.clone()),
                salary_max: posting.as_ref().and_then(|p| p.salary_max),
            });
        }

        let mut booked = Vec::new();
        for app in self.store.list_by_status(&[ApplicationStatus::Pending]).await? {
            if app.candidate_id != candidate_id || application_ids.contains(&app.id) {
                continue;
            }
            if let Some(at) = app.scheduled_at {
                booked.push(BookedSlot {
                    tier: Tier::for_score(self.score(&app).await?),
                    at,
                });
            }
        }

        let mut plan = planner::plan(now, &prefs, items, &booked);
        for slot in &plan.slots {
            self.store.set_schedule(slot.application_id, Some(slot.at)).await?;
            self.attempts.remove(&slot.application_id);
        }
        for skipped in &plan.skipped {
            self.store.set_schedule(skipped.application_id, None).await?;
        }
        plan.skipped.extend(not_pending);

        let batch_id = (!plan.slots.is_empty()).then(|| {
            let batch_id = Uuid::new_v4();
            for slot in &plan.slots {
                if let Some((_, previous)) = self.batch_of.remove(&slot.application_id) {
                    self.shrink_batch(previous);
                }
                self.batch_of.insert(slot.application_id, batch_id);
            }
            self.batches.insert(
                batch_id,
                Batch {
                    candidate_id,
                    total: plan.slots.len(),
                    completed: 0,
                    succeeded: 0,
                },
            );
            batch_id
        });

        info!(
            %candidate_id,
            scheduled = plan.slots.len(),
            skipped = plan.skipped.len(),
            batch_id = ?batch_id,
            "Submission schedule planned"
        );
        Ok(ScheduleResult { batch_id, plan })
    }

    /// Removes a pending slot before it fires. An in-flight attempt finishes.
    pub async fn cancel_application(&self, application_id: Uuid) -> Result<(), SchedulerError> {
        let app = self.store.get_application(application_id).await?;
        if app.status == ApplicationStatus::Pending && app.scheduled_at.is_some() {
            self.store.set_schedule(application_id, None).await?;
        }
        self.attempts.remove(&application_id);
        if let Some((_, batch_id)) = self.batch_of.remove(&application_id) {
            self.shrink_batch(batch_id);
        }
        debug!(%application_id, "Scheduled submission cancelled");
        Ok(())
    }

    /// Clears every slot of the candidate and stops its in-flight driver
    /// before the submit click. Returns how many slots were removed.
    pub async fn disable_automation(&self, candidate_id: Uuid) -> Result<usize, SchedulerError> {
        if let Some((_, token)) = self.candidates.remove(&candidate_id) {
            token.cancel();
        }
        let mut removed = 0;
        for app in self.store.list_by_status(&[ApplicationStatus::Pending]).await? {
            if app.candidate_id == candidate_id && app.scheduled_at.is_some() {
                self.cancel_application(app.id).await?;
                removed += 1;
            }
        }
        info!(%candidate_id, removed, "Automation disabled");
        Ok(removed)
    }

    /// Startup reconciliation: drops slots of candidates whose automation is
    /// off. Returns how many slots remain.
    pub async fn rebuild_from_store(&self) -> Result<usize, SchedulerError> {
        let mut kept = 0;
        let mut dropped = 0;
        for app in self.store.list_by_status(&[ApplicationStatus::Pending]).await? {
            if app.scheduled_at.is_none() {
                continue;
            }
            let prefs = self.directory.preferences(app.candidate_id).await?;
            if prefs.enabled && !app.unverified_submission {
                kept += 1;
            } else {
                self.store.set_schedule(app.id, None).await?;
                dropped += 1;
            }
        }
        info!(kept, dropped, "Schedule rebuilt from store");
        Ok(kept)
    }

    /// Books the next attempt of a transiently failed submission.
    pub async fn retry_later(
        &self,
        application_id: Uuid,
        attempt: u32,
        after: Duration,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.attempts.insert(application_id, attempt);
        let at = Utc::now() + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::minutes(1));
        self.store.set_schedule(application_id, Some(at)).await?;
        Ok(at)
    }

    // ── dispatch ────────────────────────────────────────────────────────────

    /// Hands every due application to the worker, up to the free permits and
    /// one per candidate.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<JoinHandle<()>>, SchedulerError> {
        let mut handles = Vec::new();
        for app in self.store.find_due_for_submission(now).await? {
            if self.in_flight.contains_key(&app.candidate_id) {
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("Submission pool saturated");
                break;
            };
            self.in_flight.insert(app.candidate_id, app.id);
            let attempt = self.attempts.get(&app.id).map(|a| *a).unwrap_or(0) + 1;
            let token = self.candidate_token(app.candidate_id).child_token();
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let candidate_id = app.candidate_id;
                this.dispatch(app, attempt, token).await;
                this.in_flight.remove(&candidate_id);
                drop(permit);
            }));
        }
        if !handles.is_empty() {
            debug!(dispatched = handles.len(), "Scheduler tick");
        }
        Ok(handles)
    }

    async fn dispatch(&self, app: Application, attempt: u32, cancel: CancellationToken) {
        let application_id = app.id;
        let tier = match self.score(&app).await {
            Ok(score) => Some(Tier::for_score(score)),
            Err(e) => {
                warn!(%application_id, error = %e, "Match score unavailable");
                None
            }
        };
        let task = SubmissionTask {
            application_id,
            navigation_url: None,
            tier,
            // Due by the tick's clock, which may run ahead of the wall clock.
            earliest_start: app.scheduled_at.map_or_else(Utc::now, |at| at.min(Utc::now())),
            attempt,
            deadline: Some(Instant::now() + self.worker.settings().driver.budget),
        };
        let report = match self.worker.try_run(task, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(%application_id, error = %e, "Submission dispatch failed");
                if let Err(e) = self.store.set_schedule(application_id, None).await {
                    warn!(%application_id, error = %e, "Could not clear slot");
                }
                self.attempts.remove(&application_id);
                self.record_progress(application_id, false);
                return;
            }
        };

        match report.outcome {
            AttemptOutcome::Retry { after, kind } => {
                match self.retry_later(application_id, attempt, after).await {
                    Ok(at) => info!(%application_id, %kind, attempt, retry_at = %at, "Submission rescheduled"),
                    Err(e) => warn!(%application_id, error = %e, "Could not reschedule"),
                }
            }
            AttemptOutcome::Cancelled => {
                if let Err(e) = self.store.set_schedule(application_id, None).await {
                    warn!(%application_id, error = %e, "Could not clear slot");
                }
            }
            AttemptOutcome::Skipped { reason } => {
                debug!(%application_id, reason, "Due submission skipped");
            }
            outcome => {
                self.attempts.remove(&application_id);
                self.record_progress(application_id, outcome.is_success());
            }
        }
    }

    fn record_progress(&self, application_id: Uuid, success: bool) {
        let Some((_, batch_id)) = self.batch_of.remove(&application_id) else {
            return;
        };
        let Some(mut batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        batch.completed += 1;
        if success {
            batch.succeeded += 1;
        }
        let (candidate_id, completed, total) = (batch.candidate_id, batch.completed, batch.total);
        drop(batch);
        self.bus.publish(
            Group::User(candidate_id),
            ServerEvent::BulkApplicationProgress {
                batch_id,
                completed,
                total,
                application_id,
                success,
            },
        );
        self.finish_batch_if_done(batch_id);
    }

    fn shrink_batch(&self, batch_id: Uuid) {
        if let Some(mut batch) = self.batches.get_mut(&batch_id) {
            batch.total = batch.total.saturating_sub(1);
        }
        self.finish_batch_if_done(batch_id);
    }

    fn finish_batch_if_done(&self, batch_id: Uuid) {
        let Some((_, batch)) = self.batches.remove_if(&batch_id, |_, b| b.completed >= b.total) else {
            return;
        };
        if batch.completed == 0 {
            return;
        }
        info!(%batch_id, total = batch.total, succeeded = batch.succeeded, "Submission batch complete");
        self.bus.publish(
            Group::User(batch.candidate_id),
            ServerEvent::BulkApplicationComplete {
                batch_id,
                total: batch.total,
                succeeded: batch.succeeded,
                failed: batch.completed - batch.succeeded,
            },
        );
    }

    /// Tick loop; returns when the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.settings.tick.as_secs(), concurrency = self.settings.concurrency, "Scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::rules::{self, Mutation};
use super::{
    ApplicationStore, CreateOutcome, NewApplication, StoreError, SubmissionCommit, TrackingPatch,
    TransitionEvidence, VerificationPatch,
};
use crate::models::application::{
    Application, ApplicationEvent, ApplicationStatus, ArtifactRef, NewEvent, TrackingConfig,
};

#[derive(Default)]
struct Tables {
    applications: HashMap<Uuid, Application>,
    events: HashMap<Uuid, Vec<ApplicationEvent>>,
    tracking: HashMap<Uuid, TrackingConfig>,
}

impl Tables {
    fn app(&self, id: Uuid) -> Result<&Application, StoreError> {
        self.applications.get(&id).ok_or(StoreError::NotFound(id))
    }

    fn last_event_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.events
            .get(&id)
            .and_then(|events| events.last())
            .map(|e| e.created_at)
    }

    fn apply(&mut self, mutation: Mutation) {
        let id = mutation.application.id;
        self.applications.insert(id, mutation.application);
        if let Some(tracking) = mutation.tracking {
            self.tracking.insert(id, tracking);
        }
        self.events.entry(id).or_default().extend(mutation.events);
    }
}

/// Process-local store. A single lock around all tables gives every
/// operation the same all-or-nothing behaviour as a database transaction.
#[derive(Default)]
pub struct MemoryApplicationStore {
    tables: RwLock<Tables>,
}

impl MemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationStore for MemoryApplicationStore {
    async fn create_application(&self, new: NewApplication) -> Result<CreateOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .applications
            .values()
            .find(|a| a.candidate_id == new.candidate_id && a.posting_id == new.posting_id)
        {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        let mutation = rules::plan_create(&new, Utc::now());
        let app = mutation.application.clone();
        tables.apply(mutation);
        Ok(CreateOutcome::Created(app))
    }

    async fn get_application(&self, id: Uuid) -> Result<Application, StoreError> {
        self.tables.read().await.app(id).cloned()
    }

    async fn find_application(
        &self,
        candidate_id: Uuid,
        posting_id: Uuid,
    ) -> Result<Option<Application>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .applications
            .values()
            .find(|a| a.candidate_id == candidate_id && a.posting_id == posting_id)
            .cloned())
    }

    async fn list_for_candidate(
        &self,
        candidate_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Application>, StoreError> {
        let tables = self.tables.read().await;
        let mut apps: Vec<Application> = tables
            .applications
            .values()
            .filter(|a| a.candidate_id == candidate_id)
            .cloned()
            .collect();
        apps.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        apps.truncate(limit.max(0) as usize);
        Ok(apps)
    }

    async fn list_by_status(
        &self,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<Application>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .applications
            .values()
            .filter(|a| statuses.contains(&a.status))
            .cloned()
            .collect())
    }

    async fn events(&self, id: Uuid) -> Result<Vec<ApplicationEvent>, StoreError> {
        let tables = self.tables.read().await;
        tables.app(id)?;
        Ok(tables.events.get(&id).cloned().unwrap_or_default())
    }

    async fn transition(
        &self,
        id: Uuid,
        to: ApplicationStatus,
        evidence: TransitionEvidence,
    ) -> Result<Application, StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        let tracking = tables.tracking.get(&id).cloned();
        let mutation =
            rules::plan_transition(app, tracking, to, evidence, tables.last_event_at(id), Utc::now())?;
        let app = mutation.application.clone();
        tables.apply(mutation);
        Ok(app)
    }

    async fn append_event(&self, id: Uuid, event: NewEvent) -> Result<ApplicationEvent, StoreError> {
        let mut tables = self.tables.write().await;
        tables.app(id)?;
        let mut stamped = rules::stamp_events(id, vec![event], tables.last_event_at(id), Utc::now());
        let event = stamped.remove(0);
        tables.events.entry(id).or_default().push(event.clone());
        Ok(event)
    }

    async fn attach_artifact(&self, id: Uuid, artifact: ArtifactRef) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        let mutation = rules::plan_artifact(app, artifact, tables.last_event_at(id), Utc::now());
        tables.apply(mutation);
        Ok(())
    }

    async fn tracking(&self, id: Uuid) -> Result<Option<TrackingConfig>, StoreError> {
        let tables = self.tables.read().await;
        tables.app(id)?;
        Ok(tables.tracking.get(&id).cloned())
    }

    async fn update_tracking(
        &self,
        id: Uuid,
        patch: TrackingPatch,
    ) -> Result<TrackingConfig, StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        let tracking = tables.tracking.get(&id).cloned();
        let mutation =
            rules::plan_tracking(app, tracking, &patch, tables.last_event_at(id), Utc::now());
        let tracking = mutation.tracking.clone();
        tables.apply(mutation);
        tracking.ok_or_else(|| StoreError::Invariant(format!("tracking for {id} not produced")))
    }

    async fn set_verification(
        &self,
        id: Uuid,
        patch: VerificationPatch,
        event: NewEvent,
    ) -> Result<Application, StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        let mutation =
            rules::plan_verification(app, &patch, event, tables.last_event_at(id), Utc::now());
        let app = mutation.application.clone();
        tables.apply(mutation);
        Ok(app)
    }

    async fn commit_submission(
        &self,
        id: Uuid,
        commit: SubmissionCommit,
    ) -> Result<Application, StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        let tracking = tables.tracking.get(&id).cloned();
        let mutation = rules::plan_submission(app, tracking, commit, tables.last_event_at(id))?;
        let app = mutation.application.clone();
        tables.apply(mutation);
        Ok(app)
    }

    async fn set_schedule(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let app = tables.app(id)?.clone();
        if let Some(mutation) = rules::plan_schedule(app, at, tables.last_event_at(id), Utc::now())? {
            tables.apply(mutation);
        }
        Ok(())
    }

    async fn find_due_for_monitoring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .applications
            .values()
            .filter(|a| a.is_monitorable())
            .filter(|a| {
                tables
                    .tracking
                    .get(&a.id)
                    .map(|t| t.next_check <= now)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn find_due_for_submission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError> {
        let tables = self.tables.read().await;
        let mut due: Vec<Application> = tables
            .applications
            .values()
            .filter(|a| a.status == ApplicationStatus::Pending)
            .filter(|a| a.scheduled_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|a| a.scheduled_at);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::{EventKind, SubmissionMethod};
    use crate::store::SubmissionOutcome;
    use chrono::Duration;

    fn new_app(candidate: Uuid, posting: Uuid) -> NewApplication {
        NewApplication {
            candidate_id: candidate,
            posting_id: posting,
            method: SubmissionMethod::Browser,
            submit_intent: true,
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_returns_existing_row() {
        let store = MemoryApplicationStore::new();
        let (c, p) = (Uuid::new_v4(), Uuid::new_v4());
        let first = store.create_application(new_app(c, p)).await.unwrap();
        let second = store.create_application(new_app(c, p)).await.unwrap();
        assert!(!first.already_exists());
        assert!(second.already_exists());
        assert_eq!(first.into_application().id, second.into_application().id);
        assert_eq!(store.list_for_candidate(c, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_store_untouched() {
        let store = MemoryApplicationStore::new();
        let app = store
            .create_application(new_app(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        let before = store.events(app.id).await.unwrap().len();
        let err = store
            .transition(
                app.id,
                ApplicationStatus::Offer,
                TransitionEvidence::new(NewEvent::new(EventKind::StatusChange, "Offer")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.events(app.id).await.unwrap().len(), before);
        assert_eq!(
            store.get_application(app.id).await.unwrap().status,
            ApplicationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_append_event_does_not_change_status() {
        let store = MemoryApplicationStore::new();
        let app = store
            .create_application(new_app(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        store
            .append_event(app.id, NewEvent::new(EventKind::FollowUp, "Followed up"))
            .await
            .unwrap();
        let events = store.events(app.id).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::FollowUp);
        assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(
            store.get_application(app.id).await.unwrap().status,
            ApplicationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_due_for_monitoring_respects_next_check() {
        let store = MemoryApplicationStore::new();
        let app = store
            .create_application(new_app(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        let at = Utc::now();
        store
            .commit_submission(
                app.id,
                SubmissionCommit {
                    attempt_id: "a1".to_string(),
                    navigation_url: None,
                    artifacts: Vec::new(),
                    outcome: SubmissionOutcome::Applied {
                        confirmation: Some("GH-1".to_string()),
                    },
                    check_frequency_minutes: 60,
                    at,
                    verified_source: None,
                },
            )
            .await
            .unwrap();

        assert!(store.find_due_for_monitoring(at).await.unwrap().is_empty());
        let due = store
            .find_due_for_monitoring(at + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_due_for_submission_orders_by_slot() {
        let store = MemoryApplicationStore::new();
        let candidate = Uuid::new_v4();
        let now = Utc::now();
        let late = store
            .create_application(new_app(candidate, Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        let early = store
            .create_application(new_app(candidate, Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        store
            .set_schedule(late.id, Some(now - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .set_schedule(early.id, Some(now - Duration::minutes(5)))
            .await
            .unwrap();

        let due = store.find_due_for_submission(now).await.unwrap();
        assert_eq!(
            due.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );
        assert!(store
            .find_due_for_submission(now - Duration::minutes(10))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_schedule_changes_are_logged() {
        let store = MemoryApplicationStore::new();
        let app = store
            .create_application(new_app(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap()
            .into_application();
        let before = store.events(app.id).await.unwrap().len();
        let slot = Utc::now() + Duration::hours(2);

        store.set_schedule(app.id, Some(slot)).await.unwrap();
        store.set_schedule(app.id, Some(slot)).await.unwrap();
        store.set_schedule(app.id, None).await.unwrap();
        store.set_schedule(app.id, None).await.unwrap();

        let events = store.events(app.id).await.unwrap();
        let notes: Vec<&str> = events[before..].iter().map(|e| e.title.as_str()).collect();
        assert_eq!(notes, vec!["Submission scheduled", "Scheduled slot cleared"]);
        assert!(events[before..].iter().all(|e| e.kind == EventKind::NoteAdded));
        assert_eq!(store.get_application(app.id).await.unwrap().scheduled_at, None);
    }

    #[tokio::test]
    async fn test_missing_application_is_not_found() {
        let store = MemoryApplicationStore::new();
        let err = store.get_application(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

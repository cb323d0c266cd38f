use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::rules::{self, Mutation};
use super::{
    ApplicationStore, CreateOutcome, NewApplication, StoreError, SubmissionCommit, TrackingPatch,
    TransitionEvidence, VerificationPatch,
};
use crate::models::application::{
    Application, ApplicationEvent, ApplicationStatus, ArtifactRef, NewEvent, ObservationRecord,
    TrackingConfig,
};

// ────────────────────────────────────────────────────────────────────────────
// Rows
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct ApplicationRow {
    id: Uuid,
    candidate_id: Uuid,
    posting_id: Uuid,
    method: String,
    status: String,
    external_confirmation: Option<String>,
    apply_url: Option<String>,
    artifacts: Value,
    is_verified: bool,
    verified_source: Option<String>,
    email_confirmed: bool,
    tracking_enabled: bool,
    unverified_submission: bool,
    last_error: Option<String>,
    prepared_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    applied_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    last_check: Option<DateTime<Utc>>,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = StoreError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        let artifacts: Vec<ArtifactRef> = serde_json::from_value(row.artifacts)
            .map_err(|e| StoreError::Corrupt(format!("artifacts of {}: {e}", row.id)))?;
        Ok(Application {
            id: row.id,
            candidate_id: row.candidate_id,
            posting_id: row.posting_id,
            method: row.method.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            external_confirmation: row.external_confirmation,
            apply_url: row.apply_url,
            artifacts,
            is_verified: row.is_verified,
            verified_source: row
                .verified_source
                .map(|s| s.parse())
                .transpose()
                .map_err(StoreError::Corrupt)?,
            email_confirmed: row.email_confirmed,
            tracking_enabled: row.tracking_enabled,
            unverified_submission: row.unverified_submission,
            last_error: row.last_error,
            prepared_at: row.prepared_at,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            applied_at: row.applied_at,
            updated_at: row.updated_at,
            last_check: row.last_check,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    application_id: Uuid,
    kind: String,
    title: String,
    description: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ApplicationEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(ApplicationEvent {
            id: row.id,
            application_id: row.application_id,
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
            title: row.title,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TrackingRow {
    application_id: Uuid,
    ats_system: Option<String>,
    external_handle: Option<String>,
    check_frequency_minutes: i32,
    next_check: DateTime<Utc>,
    email_monitoring: bool,
    keywords: Vec<String>,
    history: Value,
    last_check: Option<DateTime<Utc>>,
}

impl TryFrom<TrackingRow> for TrackingConfig {
    type Error = StoreError;

    fn try_from(row: TrackingRow) -> Result<Self, Self::Error> {
        let history: Vec<ObservationRecord> = serde_json::from_value(row.history)
            .map_err(|e| StoreError::Corrupt(format!("history of {}: {e}", row.application_id)))?;
        Ok(TrackingConfig {
            application_id: row.application_id,
            ats_system: row.ats_system,
            external_handle: row.external_handle,
            check_frequency_minutes: row.check_frequency_minutes,
            next_check: row.next_check,
            email_monitoring: row.email_monitoring,
            keywords: row.keywords,
            history,
            last_check: row.last_check,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────────────

/// Postgres-backed store. Each mutating call locks the application row
/// `FOR UPDATE`, plans the change with `rules`, and writes row, tracking and
/// events in one transaction.
#[derive(Clone)]
pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Application, StoreError> {
        let row: Option<ApplicationRow> =
            sqlx::query_as("SELECT * FROM applications WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn load_tracking(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<TrackingConfig>, StoreError> {
        let row: Option<TrackingRow> =
            sqlx::query_as("SELECT * FROM application_tracking WHERE application_id = $1")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        row.map(TrackingConfig::try_from).transpose()
    }

    async fn last_event_at(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT MAX(created_at) FROM application_events WHERE application_id = $1",
        )
        .bind(id)
        .fetch_one(&mut **tx)
        .await?)
    }

    async fn write_application(
        tx: &mut Transaction<'_, Postgres>,
        app: &Application,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE applications SET
                status = $2, external_confirmation = $3, apply_url = $4, artifacts = $5,
                is_verified = $6, verified_source = $7, email_confirmed = $8,
                tracking_enabled = $9, unverified_submission = $10, last_error = $11,
                scheduled_at = $12, applied_at = $13, updated_at = $14, last_check = $15
            WHERE id = $1
            "#,
        )
        .bind(app.id)
        .bind(app.status.as_str())
        .bind(&app.external_confirmation)
        .bind(&app.apply_url)
        .bind(to_json(&app.artifacts)?)
        .bind(app.is_verified)
        .bind(app.verified_source.map(|s| s.as_str()))
        .bind(app.email_confirmed)
        .bind(app.tracking_enabled)
        .bind(app.unverified_submission)
        .bind(&app.last_error)
        .bind(app.scheduled_at)
        .bind(app.applied_at)
        .bind(app.updated_at)
        .bind(app.last_check)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_tracking(
        tx: &mut Transaction<'_, Postgres>,
        tracking: &TrackingConfig,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO application_tracking
                (application_id, ats_system, external_handle, check_frequency_minutes,
                 next_check, email_monitoring, keywords, history, last_check)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (application_id) DO UPDATE SET
                ats_system = EXCLUDED.ats_system,
                external_handle = EXCLUDED.external_handle,
                check_frequency_minutes = EXCLUDED.check_frequency_minutes,
                next_check = EXCLUDED.next_check,
                email_monitoring = EXCLUDED.email_monitoring,
                keywords = EXCLUDED.keywords,
                history = EXCLUDED.history,
                last_check = EXCLUDED.last_check
            "#,
        )
        .bind(tracking.application_id)
        .bind(&tracking.ats_system)
        .bind(&tracking.external_handle)
        .bind(tracking.check_frequency_minutes)
        .bind(tracking.next_check)
        .bind(tracking.email_monitoring)
        .bind(&tracking.keywords)
        .bind(to_json(&tracking.history)?)
        .bind(tracking.last_check)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_events(
        tx: &mut Transaction<'_, Postgres>,
        events: &[ApplicationEvent],
    ) -> Result<(), StoreError> {
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO application_events
                    (id, application_id, kind, title, description, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.id)
            .bind(event.application_id)
            .bind(event.kind.as_str())
            .bind(&event.title)
            .bind(&event.description)
            .bind(&event.metadata)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn persist(
        tx: &mut Transaction<'_, Postgres>,
        mutation: &Mutation,
    ) -> Result<(), StoreError> {
        Self::write_application(tx, &mutation.application).await?;
        if let Some(tracking) = &mutation.tracking {
            Self::write_tracking(tx, tracking).await?;
        }
        Self::write_events(tx, &mutation.events).await
    }
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    async fn create_application(&self, new: NewApplication) -> Result<CreateOutcome, StoreError> {
        let mutation = rules::plan_create(&new, Utc::now());
        let app = &mutation.application;

        let mut tx = self.pool.begin().await?;
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO applications
                (id, candidate_id, posting_id, method, status, artifacts, is_verified,
                 email_confirmed, tracking_enabled, unverified_submission,
                 prepared_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, '[]'::jsonb, FALSE, FALSE, $6, FALSE, $7, $7, $7)
            ON CONFLICT (candidate_id, posting_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(app.id)
        .bind(app.candidate_id)
        .bind(app.posting_id)
        .bind(app.method.as_str())
        .bind(app.status.as_str())
        .bind(app.tracking_enabled)
        .bind(app.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return self
                .find_application(new.candidate_id, new.posting_id)
                .await?
                .map(CreateOutcome::AlreadyExists)
                .ok_or(StoreError::Duplicate {
                    candidate_id: new.candidate_id,
                    posting_id: new.posting_id,
                });
        }

        Self::write_events(&mut tx, &mutation.events).await?;
        tx.commit().await?;
        Ok(CreateOutcome::Created(mutation.application))
    }

    async fn get_application(&self, id: Uuid) -> Result<Application, StoreError> {
        let row: Option<ApplicationRow> = sqlx::query_as("SELECT * FROM applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn find_application(
        &self,
        candidate_id: Uuid,
        posting_id: Uuid,
    ) -> Result<Option<Application>, StoreError> {
        let row: Option<ApplicationRow> = sqlx::query_as(
            "SELECT * FROM applications WHERE candidate_id = $1 AND posting_id = $2",
        )
        .bind(candidate_id)
        .bind(posting_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Application::try_from).transpose()
    }

    async fn list_for_candidate(
        &self,
        candidate_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Application>, StoreError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            "SELECT * FROM applications WHERE candidate_id = $1 ORDER BY updated_at DESC LIMIT $2",
        )
        .bind(candidate_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn list_by_status(
        &self,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<Application>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows =
            sqlx::query_as::<_, ApplicationRow>("SELECT * FROM applications WHERE status = ANY($1)")
                .bind(statuses)
                .fetch_all(&self.pool)
                .await?;
        collect(rows)
    }

    async fn events(&self, id: Uuid) -> Result<Vec<ApplicationEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM application_events WHERE application_id = $1 ORDER BY created_at, seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: ApplicationStatus,
        evidence: TransitionEvidence,
    ) -> Result<Application, StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let tracking = Self::load_tracking(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let mutation = rules::plan_transition(app, tracking, to, evidence, last, Utc::now())?;
        Self::persist(&mut tx, &mutation).await?;
        tx.commit().await?;
        Ok(mutation.application)
    }

    async fn append_event(&self, id: Uuid, event: NewEvent) -> Result<ApplicationEvent, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_row(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let stamped = rules::stamp_events(id, vec![event], last, Utc::now());
        Self::write_events(&mut tx, &stamped).await?;
        tx.commit().await?;
        stamped
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Invariant("event not stamped".to_string()))
    }

    async fn attach_artifact(&self, id: Uuid, artifact: ArtifactRef) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let mutation = rules::plan_artifact(app, artifact, last, Utc::now());
        Self::persist(&mut tx, &mutation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn tracking(&self, id: Uuid) -> Result<Option<TrackingConfig>, StoreError> {
        let row: Option<TrackingRow> =
            sqlx::query_as("SELECT * FROM application_tracking WHERE application_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TrackingConfig::try_from).transpose()
    }

    async fn update_tracking(
        &self,
        id: Uuid,
        patch: TrackingPatch,
    ) -> Result<TrackingConfig, StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let tracking = Self::load_tracking(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let mutation = rules::plan_tracking(app, tracking, &patch, last, Utc::now());
        Self::persist(&mut tx, &mutation).await?;
        tx.commit().await?;
        mutation
            .tracking
            .ok_or_else(|| StoreError::Invariant(format!("tracking for {id} not produced")))
    }

    async fn set_verification(
        &self,
        id: Uuid,
        patch: VerificationPatch,
        event: NewEvent,
    ) -> Result<Application, StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let mutation = rules::plan_verification(app, &patch, event, last, Utc::now());
        Self::persist(&mut tx, &mutation).await?;
        tx.commit().await?;
        Ok(mutation.application)
    }

    async fn commit_submission(
        &self,
        id: Uuid,
        commit: SubmissionCommit,
    ) -> Result<Application, StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let tracking = Self::load_tracking(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        let mutation = rules::plan_submission(app, tracking, commit, last)?;
        Self::persist(&mut tx, &mutation).await?;
        tx.commit().await?;
        Ok(mutation.application)
    }

    async fn set_schedule(&self, id: Uuid, at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let app = Self::lock_row(&mut tx, id).await?;
        let last = Self::last_event_at(&mut tx, id).await?;
        if let Some(mutation) = rules::plan_schedule(app, at, last, Utc::now())? {
            Self::persist(&mut tx, &mutation).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn find_due_for_monitoring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT a.* FROM applications a
            JOIN application_tracking t ON t.application_id = a.id
            WHERE a.tracking_enabled
              AND (a.status IN ('applied', 'in_review', 'interview')
                   OR (a.status = 'pending' AND a.unverified_submission))
              AND t.next_check <= $1
            ORDER BY t.next_check
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn find_due_for_submission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Application>, StoreError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT * FROM applications
            WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= $1
            ORDER BY scheduled_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}

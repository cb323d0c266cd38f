//! Pure mutation rules shared by every store backend.
//!
//! Each `plan_*` function takes the locked current state and returns the full
//! `Mutation` to persist. Backends never change an application any other way.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    NewApplication, StoreError, SubmissionCommit, SubmissionOutcome, TrackingPatch,
    TransitionEvidence, VerificationPatch,
};
use crate::models::application::{
    Application, ApplicationEvent, ApplicationStatus, ArtifactRef, EventKind, NewEvent,
    TrackingConfig,
};

/// Default monitor interval used when tracking is armed without an explicit one.
pub const DEFAULT_CHECK_MINUTES: i32 = 60;

/// The state machine. Every edge not listed here is forbidden.
///
/// `in_review` moves forward on the same evidence as `applied`
/// (interview, rejected, offer); monitored `in_review` rows would
/// otherwise have no exit but withdrawal.
pub fn is_permitted(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;
    matches!(
        (from, to),
        (Pending, Applied)
            | (Pending, Failed)
            | (Applied, InReview | Interview | Rejected | Offer)
            | (InReview, Interview | Rejected | Offer)
            | (Interview, Rejected | Offer)
            | (Offer, Accepted | Declined)
            | (Applied | InReview | Interview, Withdrawn)
            | (Failed, Pending)
    )
}

pub fn check_transition(from: ApplicationStatus, to: ApplicationStatus) -> Result<(), StoreError> {
    if is_permitted(from, to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

/// Statuses external evidence (ATS, inbox, recruiter) may move an application to.
pub fn evidence_may_reach(to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;
    matches!(to, Applied | InReview | Interview | Rejected | Offer)
}

/// The persisted result of one store operation.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub application: Application,
    /// `Some` means upsert this tracking row.
    pub tracking: Option<TrackingConfig>,
    pub events: Vec<ApplicationEvent>,
}

/// Stamps pending events so timestamps never go backwards within an application.
pub fn stamp_events(
    application_id: Uuid,
    events: Vec<NewEvent>,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<ApplicationEvent> {
    let created_at = match last_event_at {
        Some(last) if last > now => last,
        _ => now,
    };
    events
        .into_iter()
        .map(|e| ApplicationEvent {
            id: Uuid::new_v4(),
            application_id,
            kind: e.kind,
            title: e.title,
            description: e.description,
            metadata: e.metadata,
            created_at,
        })
        .collect()
}

fn merge_metadata(metadata: Value, extra: Value) -> Value {
    match (metadata, extra) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (k, v) in extra {
                base.entry(k).or_insert(v);
            }
            Value::Object(base)
        }
        (Value::Null, extra) => extra,
        (base, _) => base,
    }
}

pub fn plan_create(new: &NewApplication, now: DateTime<Utc>) -> Mutation {
    let application = Application {
        id: Uuid::new_v4(),
        candidate_id: new.candidate_id,
        posting_id: new.posting_id,
        method: new.method,
        status: ApplicationStatus::Pending,
        external_confirmation: None,
        apply_url: None,
        artifacts: Vec::new(),
        is_verified: false,
        verified_source: None,
        email_confirmed: false,
        tracking_enabled: new.submit_intent,
        unverified_submission: false,
        last_error: None,
        prepared_at: now,
        scheduled_at: None,
        created_at: now,
        applied_at: None,
        updated_at: now,
        last_check: None,
    };
    let event = NewEvent::new(EventKind::NoteAdded, "Application created").with_metadata(json!({
        "method": new.method.as_str(),
        "submit_intent": new.submit_intent,
    }));
    let events = stamp_events(application.id, vec![event], None, now);
    Mutation {
        application,
        tracking: None,
        events,
    }
}

fn apply_verification(app: &mut Application, patch: &VerificationPatch) {
    if let Some(verified) = patch.is_verified {
        app.is_verified = verified;
    }
    if let Some(source) = patch.verified_source {
        app.verified_source = Some(source);
    }
    if let Some(confirmed) = patch.email_confirmed {
        app.email_confirmed = confirmed;
    }
    if patch.resolve_unverified {
        app.unverified_submission = false;
        if app.last_error.as_deref() == Some("UnverifiedSubmission") {
            app.last_error = None;
        }
    }
}

fn apply_tracking_patch(
    app: &mut Application,
    tracking: Option<TrackingConfig>,
    patch: &TrackingPatch,
    now: DateTime<Utc>,
) -> TrackingConfig {
    let mut tracking =
        tracking.unwrap_or_else(|| TrackingConfig::new(app.id, DEFAULT_CHECK_MINUTES, now));

    if let Some(enabled) = patch.enabled {
        app.tracking_enabled = enabled;
    }
    if let Some(ats) = &patch.ats_system {
        tracking.ats_system = Some(ats.clone());
    }
    if let Some(handle) = &patch.external_handle {
        tracking.external_handle = Some(handle.clone());
    }
    if let Some(minutes) = patch.check_frequency_minutes {
        tracking.check_frequency_minutes = minutes.max(TrackingConfig::MIN_CHECK_MINUTES);
    }
    if let Some(next) = patch.next_check {
        tracking.next_check = next;
    }
    if let Some(email) = patch.email_monitoring {
        tracking.email_monitoring = email;
    }
    if let Some(keywords) = &patch.keywords {
        tracking.keywords = keywords.clone();
    }
    if !patch.append_history.is_empty() {
        tracking.push_history(patch.append_history.iter().cloned());
    }
    if let Some(checked) = patch.checked_at {
        tracking.last_check = Some(checked);
        app.last_check = Some(checked);
    }
    tracking
}

pub fn plan_transition(
    mut app: Application,
    tracking: Option<TrackingConfig>,
    to: ApplicationStatus,
    evidence: TransitionEvidence,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Mutation, StoreError> {
    let from = app.status;
    check_transition(from, to)?;

    app.status = to;
    app.updated_at = now;
    if to == ApplicationStatus::Applied && app.applied_at.is_none() {
        app.applied_at = Some(now);
    }
    if to == ApplicationStatus::Pending {
        // Manual retry of a failed submission.
        app.last_error = None;
        app.unverified_submission = false;
    }
    if let Some(patch) = &evidence.verification {
        apply_verification(&mut app, patch);
    }

    let mut tracking = match &evidence.tracking {
        Some(patch) => Some(apply_tracking_patch(&mut app, tracking, patch, now)),
        None => tracking,
    };
    if to.ends_tracking() {
        app.tracking_enabled = false;
    }
    if let Some(t) = tracking.as_mut() {
        if to.ends_tracking() {
            t.email_monitoring = false;
        }
    }

    let mut events = vec![NewEvent {
        metadata: merge_metadata(
            evidence.event.metadata,
            json!({ "from": from.as_str(), "to": to.as_str() }),
        ),
        ..evidence.event
    }];
    events.extend(evidence.extra_events);
    let events = stamp_events(app.id, events, last_event_at, now);

    let tracking = if evidence.tracking.is_some() || to.ends_tracking() {
        tracking
    } else {
        None
    };

    Ok(Mutation {
        application: app,
        tracking,
        events,
    })
}

pub fn plan_submission(
    mut app: Application,
    tracking: Option<TrackingConfig>,
    commit: SubmissionCommit,
    last_event_at: Option<DateTime<Utc>>,
) -> Result<Mutation, StoreError> {
    let now = commit.at;
    let SubmissionCommit {
        attempt_id,
        navigation_url,
        artifacts,
        outcome,
        check_frequency_minutes,
        verified_source,
        ..
    } = commit;

    if navigation_url.is_some() {
        app.apply_url = navigation_url.clone();
    }
    app.artifacts.extend(artifacts);
    app.scheduled_at = None;
    app.updated_at = now;

    let (event, tracking) = match outcome {
        SubmissionOutcome::Applied { confirmation } => {
            check_transition(app.status, ApplicationStatus::Applied)?;
            app.status = ApplicationStatus::Applied;
            app.applied_at = Some(now);
            if app.external_confirmation.is_none() {
                app.external_confirmation = confirmation.clone();
            }
            app.unverified_submission = false;
            app.last_error = None;
            app.tracking_enabled = true;
            if let Some(source) = verified_source {
                app.is_verified = true;
                app.verified_source = Some(source);
            }

            let mut t = tracking
                .unwrap_or_else(|| TrackingConfig::new(app.id, check_frequency_minutes, now));
            t.next_check = now + t.interval();
            if t.external_handle.is_none() {
                t.external_handle = app.external_confirmation.clone();
            }

            let event = NewEvent::new(EventKind::Applied, "Application submitted").with_metadata(
                json!({
                    "attempt_id": attempt_id,
                    "confirmation": app.external_confirmation,
                    "navigation_url": app.apply_url,
                    "method": app.method.as_str(),
                    "from": "pending",
                    "to": "applied",
                }),
            );
            (event, Some(t))
        }
        SubmissionOutcome::Failed { kind, message } => {
            check_transition(app.status, ApplicationStatus::Failed)?;
            app.status = ApplicationStatus::Failed;
            app.last_error = Some(kind.clone());
            let event = NewEvent::new(EventKind::StatusChange, "Submission failed")
                .describe(message.clone())
                .with_metadata(json!({
                    "attempt_id": attempt_id,
                    "error_kind": kind,
                    "message": message,
                    "from": "pending",
                    "to": "failed",
                }));
            (event, None)
        }
        SubmissionOutcome::Unverified { message } => {
            if app.status != ApplicationStatus::Pending {
                return Err(StoreError::Invariant(format!(
                    "unverified submission recorded on {} application {}",
                    app.status, app.id
                )));
            }
            app.unverified_submission = true;
            app.tracking_enabled = true;
            app.last_error = Some("UnverifiedSubmission".to_string());

            let mut t = tracking
                .unwrap_or_else(|| TrackingConfig::new(app.id, check_frequency_minutes, now));
            t.email_monitoring = true;
            t.next_check = now + t.interval();

            let event = NewEvent::new(EventKind::Verification, "Submission unconfirmed")
                .describe(message.clone())
                .with_metadata(json!({
                    "attempt_id": attempt_id,
                    "outcome": "unverified",
                    "error_kind": "UnverifiedSubmission",
                    "message": message,
                }));
            (event, Some(t))
        }
    };

    let events = stamp_events(app.id, vec![event], last_event_at, now);
    Ok(Mutation {
        application: app,
        tracking,
        events,
    })
}

pub fn plan_verification(
    mut app: Application,
    patch: &VerificationPatch,
    event: NewEvent,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Mutation {
    apply_verification(&mut app, patch);
    app.updated_at = now;
    let events = stamp_events(app.id, vec![event], last_event_at, now);
    Mutation {
        application: app,
        tracking: None,
        events,
    }
}

pub fn plan_artifact(
    mut app: Application,
    artifact: ArtifactRef,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Mutation {
    let event = NewEvent::new(EventKind::NoteAdded, "Artifact attached").with_metadata(json!({
        "kind": artifact.kind,
        "location": artifact.location,
    }));
    app.artifacts.push(artifact);
    app.updated_at = now;
    let events = stamp_events(app.id, vec![event], last_event_at, now);
    Mutation {
        application: app,
        tracking: None,
        events,
    }
}

pub fn plan_tracking(
    mut app: Application,
    tracking: Option<TrackingConfig>,
    patch: &TrackingPatch,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Mutation {
    let tracking = apply_tracking_patch(&mut app, tracking, patch, now);
    let events = if patch.is_configuration_change() {
        app.updated_at = now;
        let event = NewEvent::new(EventKind::NoteAdded, "Tracking updated").with_metadata(json!({
            "tracking_enabled": app.tracking_enabled,
            "check_frequency_minutes": tracking.check_frequency_minutes,
            "email_monitoring": tracking.email_monitoring,
            "ats_system": tracking.ats_system,
        }));
        stamp_events(app.id, vec![event], last_event_at, now)
    } else {
        Vec::new()
    };
    Mutation {
        application: app,
        tracking: Some(tracking),
        events,
    }
}

/// `None` when the slot is already `at`; nothing is written then.
pub fn plan_schedule(
    mut app: Application,
    at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, StoreError> {
    if at.is_some() && app.status != ApplicationStatus::Pending {
        return Err(StoreError::Invariant(format!(
            "cannot schedule {} application {}",
            app.status, app.id
        )));
    }
    if app.scheduled_at == at {
        return Ok(None);
    }
    let event = match at {
        Some(at) => NewEvent::new(EventKind::NoteAdded, "Submission scheduled")
            .describe(format!("Submission scheduled for {}", at.to_rfc3339()))
            .with_metadata(json!({ "scheduled_at": at })),
        None => NewEvent::new(EventKind::NoteAdded, "Scheduled slot cleared")
            .with_metadata(json!({ "previous": app.scheduled_at })),
    };
    app.scheduled_at = at;
    app.updated_at = now;
    let events = stamp_events(app.id, vec![event], last_event_at, now);
    Ok(Some(Mutation {
        application: app,
        tracking: None,
        events,
    }))
}

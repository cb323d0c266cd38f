use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::engine::{ApplyResponse, DynamicApplyResponse};
use crate::errors::AppError;
use crate::models::application::{Application, ApplicationEvent, ApplicationStatus, SubmissionMethod};
use crate::monitor::{MonitorStatus, StartOptions, SyncSummary};
use crate::scheduler::ScheduleResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub method: Option<SubmissionMethod>,
}

#[derive(Debug, Deserialize)]
pub struct DynamicApplyRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub confirmation_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartMonitoringRequest {
    pub application_id: Uuid,
    pub check_frequency_minutes: Option<i32>,
    pub email_monitoring: Option<bool>,
    pub keywords: Option<Vec<String>>,
    pub external_handle: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopMonitoringRequest {
    pub application_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub since_days: Option<i64>,
    pub max_results_per_query: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub application_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: ApplicationStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct DisableResponse {
    pub cancelled: usize,
}

/// POST /api/v1/applications/apply/:job_id
/// 201 on creation, 200 with `already_applied` when the application exists.
pub async fn handle_apply(
    State(state): State<AppState>,
    identity: Identity,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ApplyRequest>>,
) -> Result<(StatusCode, Json<ApplyResponse>), AppError> {
    let method = body.and_then(|Json(b)| b.method);
    let resp = state.engine.apply(identity, job_id, method).await?;
    let status = if resp.already_applied {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(resp)))
}

/// POST /api/v1/applications/apply-dynamically
pub async fn handle_apply_dynamically(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<DynamicApplyRequest>,
) -> Result<(StatusCode, Json<DynamicApplyResponse>), AppError> {
    let resp = state.engine.apply_dynamically(identity, req.job_id).await?;
    let status = if resp.already_applied {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(resp)))
}

/// POST /api/v1/applications/confirm-applied/:id
pub async fn handle_confirm_applied(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    body: Option<Json<ConfirmRequest>>,
) -> Result<Json<Application>, AppError> {
    let confirmation = body.and_then(|Json(b)| b.confirmation_number);
    let app = state.engine.confirm_applied(identity, id, confirmation).await?;
    Ok(Json(app))
}

/// POST /api/v1/applications/verify/:id
pub async fn handle_verify(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Application>, AppError> {
    Ok(Json(state.engine.verify(identity, id).await?))
}

/// POST /api/v1/applications/start-monitoring
pub async fn handle_start_monitoring(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<StartMonitoringRequest>,
) -> Result<Json<MonitorStatus>, AppError> {
    let options = StartOptions {
        check_frequency_minutes: req.check_frequency_minutes,
        email_monitoring: req.email_monitoring,
        keywords: req.keywords,
        external_handle: req.external_handle,
    };
    let status = state
        .engine
        .start_monitoring(identity, req.application_id, options)
        .await?;
    Ok(Json(status))
}

/// POST /api/v1/applications/stop-monitoring
pub async fn handle_stop_monitoring(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<StopMonitoringRequest>,
) -> Result<Json<MonitorStatus>, AppError> {
    Ok(Json(state.engine.stop_monitoring(identity, req.application_id).await?))
}

/// GET /api/v1/applications/monitor-status/:id
pub async fn handle_monitor_status(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<MonitorStatus>, AppError> {
    Ok(Json(state.engine.monitor_status(identity, id).await?))
}

/// POST /api/v1/applications/sync-gmail-confirmations
pub async fn handle_sync_gmail(
    State(state): State<AppState>,
    identity: Identity,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<SyncSummary>, AppError> {
    let Json(req) = body.unwrap_or_default();
    let summary = state
        .engine
        .sync_gmail(identity, req.since_days, req.max_results_per_query)
        .await?;
    Ok(Json(summary))
}

/// POST /api/v1/applications/schedule
pub async fn handle_schedule(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResult>, AppError> {
    Ok(Json(state.engine.schedule(identity, &req.application_ids).await?))
}

/// DELETE /api/v1/applications/schedule/:id
pub async fn handle_cancel_schedule(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Application>, AppError> {
    Ok(Json(state.engine.cancel_schedule(identity, id).await?))
}

/// POST /api/v1/applications/automation/disable
pub async fn handle_disable_automation(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<DisableResponse>, AppError> {
    let cancelled = state.engine.disable_automation(identity).await?;
    Ok(Json(DisableResponse { cancelled }))
}

/// POST /api/v1/applications/:id/status
pub async fn handle_update_status(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Application>, AppError> {
    let app = state
        .engine
        .update_status(identity, id, req.status, req.notes)
        .await?;
    Ok(Json(app))
}

/// GET /api/v1/applications
pub async fn handle_list(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Application>>, AppError> {
    Ok(Json(state.engine.list(identity, query.limit).await?))
}

/// GET /api/v1/applications/:id/events
pub async fn handle_events(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ApplicationEvent>>, AppError> {
    Ok(Json(state.engine.events(identity, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::auth::{issue_token, Authenticator};
    use crate::routes::build_router;
    use crate::testing::{Fixture, GREENHOUSE_URL};

    const SECRET: &str = "route-secret";

    fn router(f: &Fixture) -> Router {
        build_router(AppState {
            engine: Arc::new(f.engine()),
            auth: Authenticator::new(SECRET),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_routes_require_bearer_token() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let app = router(&f);

        let (status, body) = call(&app, "GET", "/api/v1/applications", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = call(&app, "GET", "/api/v1/applications", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "jobpilot-api");
    }

    #[tokio::test]
    async fn test_apply_then_repeat_returns_ok() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let app = router(&f);
        let token = issue_token(SECRET, Identity::candidate(f.candidate), 600);
        let uri = format!("/api/v1/applications/apply/{}", f.posting);

        let (status, body) = call(&app, "POST", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["already_applied"], false);
        assert_eq!(body["application"]["status"], "pending");

        let (status, body) = call(&app, "POST", &uri, Some(&token), Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["already_applied"], true);

        let (status, body) = call(&app, "GET", "/api/v1/applications", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let app = router(&f);
        let token = issue_token(SECRET, Identity::candidate(f.candidate), 600);

        let uri = format!("/api/v1/applications/apply/{}", Uuid::new_v4());
        let (status, body) = call(&app, "POST", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let app_id = f.pending().await.id;
        let stranger = issue_token(SECRET, Identity::candidate(Uuid::new_v4()), 600);
        let uri = format!("/api/v1/applications/{app_id}/events");
        let (status, _) = call(&app, "GET", &uri, Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/applications/start-monitoring",
            Some(&token),
            Some(serde_json::json!({ "application_id": app_id })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/applications/schedule",
            Some(&token),
            Some(serde_json::json!({ "application_ids": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

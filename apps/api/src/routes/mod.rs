pub mod applications;
pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::events::ws;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/api/v1/applications", get(applications::handle_list))
        .route(
            "/api/v1/applications/apply/:job_id",
            post(applications::handle_apply),
        )
        .route(
            "/api/v1/applications/apply-dynamically",
            post(applications::handle_apply_dynamically),
        )
        .route(
            "/api/v1/applications/confirm-applied/:id",
            post(applications::handle_confirm_applied),
        )
        .route(
            "/api/v1/applications/verify/:id",
            post(applications::handle_verify),
        )
        .route(
            "/api/v1/applications/start-monitoring",
            post(applications::handle_start_monitoring),
        )
        .route(
            "/api/v1/applications/stop-monitoring",
            post(applications::handle_stop_monitoring),
        )
        .route(
            "/api/v1/applications/monitor-status/:id",
            get(applications::handle_monitor_status),
        )
        .route(
            "/api/v1/applications/sync-gmail-confirmations",
            post(applications::handle_sync_gmail),
        )
        .route(
            "/api/v1/applications/schedule",
            post(applications::handle_schedule),
        )
        .route(
            "/api/v1/applications/schedule/:id",
            delete(applications::handle_cancel_schedule),
        )
        .route(
            "/api/v1/applications/automation/disable",
            post(applications::handle_disable_automation),
        )
        .route(
            "/api/v1/applications/:id/status",
            post(applications::handle_update_status),
        )
        .route(
            "/api/v1/applications/:id/events",
            get(applications::handle_events),
        )
        .with_state(state)
}

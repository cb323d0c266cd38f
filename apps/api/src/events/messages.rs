//! Session transport envelopes: `{"type": ..., ...}` in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::application::{Application, ApplicationStatus, EvidenceSource, SubmissionMethod};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished {
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ApplicationCreated {
        application: Application,
    },
    /// Progress of a submission attempt, and its final outcome.
    ApplicationUpdate {
        application_id: Uuid,
        status: ApplicationStatus,
        stage: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmation: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StatusUpdated {
        application_id: Uuid,
        from: ApplicationStatus,
        to: ApplicationStatus,
        source: EvidenceSource,
        timestamp: DateTime<Utc>,
    },
    TrackingUpdate {
        application_id: Uuid,
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_check: Option<DateTime<Utc>>,
    },
    Verification {
        application_id: Uuid,
        is_verified: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<EvidenceSource>,
        email_confirmed: bool,
    },
    BulkApplicationProgress {
        batch_id: Uuid,
        completed: usize,
        total: usize,
        application_id: Uuid,
        success: bool,
    },
    BulkApplicationComplete {
        batch_id: Uuid,
        total: usize,
        succeeded: usize,
        failed: usize,
    },

    // Replies to client messages on the same session.
    Pong {
        timestamp: Value,
    },
    ApplicationsSnapshot {
        applications: Vec<Application>,
    },
    ApplyResult {
        success: bool,
        already_applied: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        application: Option<Application>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StatusUpdateResult {
        success: bool,
        application_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        application: Option<Application>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionEstablished { .. } => "connection_established",
            ServerEvent::ApplicationCreated { .. } => "application_created",
            ServerEvent::ApplicationUpdate { .. } => "application_update",
            ServerEvent::StatusUpdated { .. } => "status_updated",
            ServerEvent::TrackingUpdate { .. } => "tracking_update",
            ServerEvent::Verification { .. } => "verification",
            ServerEvent::BulkApplicationProgress { .. } => "bulk_application_progress",
            ServerEvent::BulkApplicationComplete { .. } => "bulk_application_complete",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::ApplicationsSnapshot { .. } => "applications_snapshot",
            ServerEvent::ApplyResult { .. } => "apply_result",
            ServerEvent::StatusUpdateResult { .. } => "status_update_result",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn verification(app: &Application) -> Self {
        ServerEvent::Verification {
            application_id: app.id,
            is_verified: app.is_verified,
            source: app.verified_source,
            email_confirmed: app.email_confirmed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
    SubscribeToApplications,
    ApplyToJob {
        job_id: Uuid,
        #[serde(default)]
        method: Option<SubmissionMethod>,
    },
    UpdateStatus {
        application_id: Uuid,
        status: ApplicationStatus,
        #[serde(default)]
        notes: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let ping: ClientMessage = serde_json::from_value(json!({"type": "ping", "timestamp": 17})).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { timestamp } if timestamp == json!(17)));

        let id = Uuid::new_v4();
        let update: ClientMessage = serde_json::from_value(json!({
            "type": "update_status",
            "application_id": id,
            "status": "withdrawn",
        }))
        .unwrap();
        assert!(matches!(
            update,
            ClientMessage::UpdateStatus { status: ApplicationStatus::Withdrawn, notes: None, .. }
        ));

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "shutdown"})).is_err());
    }

    #[test]
    fn test_server_event_envelope_carries_type() {
        let event = ServerEvent::TrackingUpdate {
            application_id: Uuid::nil(),
            active: false,
            next_check: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert!(value.get("next_check").is_none());
    }
}

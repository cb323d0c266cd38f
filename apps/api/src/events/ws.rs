//! `GET /ws`: one authenticated session per socket. Bus events for the
//! caller's group and replies to client messages share one writer.

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ClientMessage, Group, ServerEvent};
use crate::auth::{bearer, AuthError, Authenticator, Identity, Role};
use crate::engine::Engine;
use crate::state::AppState;

/// Close code sent when the session token is missing or invalid.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

const REPLY_BUFFER: usize = 32;

#[derive(Deserialize)]
pub struct SessionQuery {
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = session_identity(&state.auth, query.token.as_deref(), &headers);

    ws.on_upgrade(move |socket| async move {
        match identity {
            Ok(identity) => run_session(socket, state, identity).await,
            Err(e) => reject(socket, &e.to_string()).await,
        }
    })
}

/// The `token` query parameter wins over the `Authorization` header.
pub fn session_identity(
    auth: &Authenticator,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<Identity, AuthError> {
    let token = query_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| bearer(headers))
        .ok_or(AuthError::Missing)?;
    auth.verify(token)
}

fn unauthorized_frame(reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: Cow::Owned(reason.to_string()),
    }
}

async fn reject(mut socket: WebSocket, reason: &str) {
    debug!(reason, "Session refused");
    let _ = socket.send(Message::Close(Some(unauthorized_frame(reason)))).await;
}

fn group_of(identity: Identity) -> Group {
    match identity.role {
        Role::Candidate => Group::User(identity.user_id),
        Role::Recruiter => Group::Recruiter(identity.user_id),
    }
}

async fn run_session(socket: WebSocket, state: AppState, identity: Identity) {
    let group = group_of(identity);
    let bus = state.engine.bus().clone();
    let mut subscription = bus.subscribe(group);
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerEvent>(REPLY_BUFFER);
    info!(%group, sessions = bus.session_count(group), "Session opened");

    let writer = tokio::spawn(async move {
        let hello = ServerEvent::ConnectionEstablished {
            user_id: identity.user_id,
            timestamp: Utc::now(),
        };
        if send(&mut sink, &hello).await.is_err() {
            return;
        }
        loop {
            let event = tokio::select! {
                Some(event) = subscription.rx.recv() => event,
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };
            if send(&mut sink, &event).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%group, error = %e, "Session read failed");
                break;
            }
        };
        let reply = handle_message(&state.engine, identity, &text).await;
        if reply_tx.send(reply).await.is_err() {
            break;
        }
    }

    // Dropping the writer drops the subscription with it.
    writer.abort();
    let _ = writer.await;
    info!(%group, sessions = bus.session_count(group), "Session closed");
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "Event not serializable; skipped");
            Ok(())
        }
    }
}

/// Answers one client message. Every message gets exactly one reply.
pub async fn handle_message(engine: &Engine, identity: Identity, text: &str) -> ServerEvent {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return ServerEvent::Error {
                message: format!("Unrecognized message: {e}"),
            }
        }
    };

    match message {
        ClientMessage::Ping { timestamp } => ServerEvent::Pong { timestamp },
        ClientMessage::SubscribeToApplications => match engine.list(identity, None).await {
            Ok(applications) => ServerEvent::ApplicationsSnapshot { applications },
            Err(e) => ServerEvent::Error {
                message: e.to_string(),
            },
        },
        ClientMessage::ApplyToJob { job_id, method } => {
            match engine.apply(identity, job_id, method).await {
                Ok(resp) => ServerEvent::ApplyResult {
                    success: resp.success,
                    already_applied: resp.already_applied,
                    application: Some(resp.application),
                    error: None,
                },
                Err(e) => ServerEvent::ApplyResult {
                    success: false,
                    already_applied: false,
                    application: None,
                    error: Some(e.to_string()),
                },
            }
        }
        ClientMessage::UpdateStatus {
            application_id,
            status,
            notes,
        } => match engine.update_status(identity, application_id, status, notes).await {
            Ok(application) => ServerEvent::StatusUpdateResult {
                success: true,
                application_id,
                application: Some(application),
                error: None,
            },
            Err(e) => ServerEvent::StatusUpdateResult {
                success: false,
                application_id,
                application: None,
                error: Some(e.to_string()),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::ApplicationStatus;
    use crate::testing::{Fixture, GREENHOUSE_URL};
    use serde_json::json;

    #[tokio::test]
    async fn test_ping_echoes_timestamp() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let reply = handle_message(
            &engine,
            Identity::candidate(f.candidate),
            r#"{"type":"ping","timestamp":1718000000}"#,
        )
        .await;
        assert!(matches!(reply, ServerEvent::Pong { timestamp } if timestamp == json!(1718000000)));
    }

    #[tokio::test]
    async fn test_unknown_message_yields_error() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let reply = handle_message(&engine, Identity::candidate(f.candidate), r#"{"type":"dance"}"#).await;
        assert_eq!(reply.kind(), "error");
        let reply = handle_message(&engine, Identity::candidate(f.candidate), "not json").await;
        assert_eq!(reply.kind(), "error");
    }

    #[tokio::test]
    async fn test_apply_to_job_over_session() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let me = Identity::candidate(f.candidate);
        let msg = json!({ "type": "apply_to_job", "job_id": f.posting }).to_string();

        let first = handle_message(&engine, me, &msg).await;
        let second = handle_message(&engine, me, &msg).await;

        assert!(matches!(first, ServerEvent::ApplyResult { success: true, already_applied: false, .. }));
        assert!(matches!(second, ServerEvent::ApplyResult { success: true, already_applied: true, .. }));

        let snapshot = handle_message(&engine, me, r#"{"type":"subscribe_to_applications"}"#).await;
        match snapshot {
            ServerEvent::ApplicationsSnapshot { applications } => {
                assert_eq!(applications.len(), 1);
                assert_eq!(applications[0].status, ApplicationStatus::Pending);
            }
            other => panic!("expected snapshot, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_refused_status_update_reports_failure() {
        let f = Fixture::new(GREENHOUSE_URL, Vec::new()).await;
        let engine = f.engine();
        let me = Identity::candidate(f.candidate);
        let app = engine.apply(me, f.posting, None).await.unwrap().application;
        let msg = json!({
            "type": "update_status",
            "application_id": app.id,
            "status": "offer",
        })
        .to_string();

        let reply = handle_message(&engine, me, &msg).await;

        assert!(matches!(reply, ServerEvent::StatusUpdateResult { success: false, error: Some(_), .. }));
    }

    #[test]
    fn test_session_token_resolution() {
        use crate::auth::issue_token;
        use axum::http::{header::AUTHORIZATION, HeaderValue};

        let auth = Authenticator::new("ws-secret");
        let me = Identity::candidate(uuid::Uuid::new_v4());
        let good = issue_token("ws-secret", me, 600);
        let empty = HeaderMap::new();

        assert!(matches!(session_identity(&auth, None, &empty), Err(AuthError::Missing)));
        assert!(matches!(session_identity(&auth, Some("  "), &empty), Err(AuthError::Missing)));
        assert!(matches!(session_identity(&auth, Some("garbage"), &empty), Err(AuthError::Invalid)));
        let foreign = issue_token("other-secret", me, 600);
        assert!(matches!(session_identity(&auth, Some(&foreign), &empty), Err(AuthError::Invalid)));

        assert_eq!(session_identity(&auth, Some(&good), &empty).unwrap(), me);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {good}")).unwrap());
        assert_eq!(session_identity(&auth, None, &headers).unwrap(), me);
        assert!(matches!(session_identity(&auth, Some("garbage"), &headers), Err(AuthError::Invalid)));
    }

    #[test]
    fn test_refusal_uses_unauthorized_close_code() {
        let frame = unauthorized_frame(&AuthError::Missing.to_string());
        assert_eq!(frame.code, 4001);
        assert_eq!(frame.reason, "Missing bearer token");
    }

    #[test]
    fn test_recruiters_join_recruiter_group() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(group_of(Identity::recruiter(id)), Group::Recruiter(id));
        assert_eq!(group_of(Identity::candidate(id)), Group::User(id));
    }
}

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::SharedState;

use super::events::{ClientMessage, Presence, RoomEvent};
use super::registry::ConnectionHandle;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    /// Authenticated caller identity, resolved upstream of this server.
    pub user_id: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, query.user_id))
}

/// Session lifecycle: `Connecting → (authorization check) → Open → Closed`.
///
/// The check requires the caller identity to resolve to a user who owns the
/// project or has a collaborator record; failing that, the transport is
/// closed without the session ever attaching to the room and no event is
/// sent. After an announced `join`, closing publishes a `UserLeft` with the
/// announced identity — a session that never announced leaves silently.
async fn handle_socket(
    mut socket: WebSocket,
    state: SharedState,
    project_id: Uuid,
    user_id: Option<String>,
) {
    let authorized = match user_id.as_deref().and_then(|raw| Uuid::parse_str(raw).ok()) {
        Some(user_id) => state
            .db
            .call(move |db| db.user_can_access(project_id, user_id))
            .await
            .unwrap_or(false),
        None => false,
    };
    if !authorized {
        debug!(%project_id, "rejecting unauthorized session");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let connection_id = Uuid::new_v4();
    let (handle, rx) = ConnectionHandle::channel(connection_id);
    state.bus.join(project_id, handle);
    debug!(%project_id, connection = %connection_id, "session open");

    let announced = run_session(socket, &state, project_id, connection_id, rx).await;

    // Leave first so the departing connection is excluded from the fan-out.
    state.bus.leave(project_id, connection_id);
    if let Some(presence) = announced {
        state
            .bus
            .publish(project_id, &RoomEvent::user_left(presence));
    }
    debug!(%project_id, connection = %connection_id, "session closed");
}

/// Core socket loop: relays queued room frames out, parses inbound client
/// messages, and keeps the connection alive with ping/pong. Returns the
/// identity the client announced via `join`, if any.
async fn run_session(
    socket: WebSocket,
    state: &SharedState,
    project_id: Uuid,
    connection_id: Uuid,
    mut rx: mpsc::Receiver<String>,
) -> Option<Presence> {
    let (mut sender, mut receiver) = socket.split();

    // Tell the new session who is already announced in the room.
    let roster = RoomEvent::ActiveUsers {
        users: state.bus.registry().active_users(project_id),
    };
    if let Ok(frame) = serde_json::to_string(&roster) {
        if sender.send(Message::Text(frame.into())).await.is_err() {
            return None;
        }
    }

    let mut announced: Option<Presence> = None;

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Room frames queued for this connection ──────────────
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Pruned from the room during fan-out.
                    None => break,
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(
                            state,
                            project_id,
                            connection_id,
                            &mut announced,
                            text.as_str(),
                        );
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore binary and ping frames (pings are answered
                        // by the transport).
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
    announced
}

/// Parse one inbound frame and re-publish it as a room event. Identity
/// fields in the payload are relayed as the client sent them; the
/// authenticated identity gated the connection, not these frames.
/// Malformed or unknown-type frames are ignored with a log line.
pub(crate) fn handle_client_frame(
    state: &SharedState,
    project_id: Uuid,
    connection_id: Uuid,
    announced: &mut Option<Presence>,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(%project_id, error = %err, "ignoring unrecognized client frame");
            return;
        }
    };

    match message {
        ClientMessage::Join { user_id, username } => {
            let presence = Presence { user_id, username };
            state
                .bus
                .registry()
                .set_presence(project_id, connection_id, presence.clone());
            *announced = Some(presence.clone());
            state
                .bus
                .publish(project_id, &RoomEvent::user_joined(presence));
        }
        ClientMessage::FileEdit(edit) => {
            state.bus.publish(project_id, &RoomEvent::FileEdit { edit });
        }
        ClientMessage::ChatMessage(message) => {
            state
                .bus
                .publish(project_id, &RoomEvent::ChatMessage { message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::test_state;

    #[tokio::test]
    async fn test_join_frame_announces_and_publishes() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::channel(connection_id);
        state.bus.join(project_id, handle);

        let mut announced = None;
        handle_client_frame(
            &state,
            project_id,
            connection_id,
            &mut announced,
            r#"{"type":"join","user_id":"u1","username":"ada"}"#,
        );

        let presence = announced.expect("join should record announced identity");
        assert_eq!(presence.username.as_deref(), Some("ada"));

        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "user_event");
        assert_eq!(json["event"]["action"], "joined");

        let roster = state.bus.registry().active_users(project_id);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_chat_frame_republished_verbatim() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::channel(connection_id);
        state.bus.join(project_id, handle);

        let mut announced = None;
        handle_client_frame(
            &state,
            project_id,
            connection_id,
            &mut announced,
            r#"{"type":"chat_message","user_id":"u9","username":"spoof","content":"hi","timestamp":"t0"}"#,
        );

        // Chat does not announce.
        assert!(announced.is_none());
        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "chat_message");
        // Client-supplied identity is forwarded untouched.
        assert_eq!(json["message"]["user_id"], "u9");
        assert_eq!(json["message"]["timestamp"], "t0");
    }

    #[tokio::test]
    async fn test_file_edit_frame_republished() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::channel(connection_id);
        state.bus.join(project_id, handle);

        let mut announced = None;
        handle_client_frame(
            &state,
            project_id,
            connection_id,
            &mut announced,
            r#"{"type":"file_edit","file_id":"f1","content":"x = 1"}"#,
        );

        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "file_edit");
        assert_eq!(json["edit"]["file_id"], "f1");
        assert_eq!(json["edit"]["content"], "x = 1");
    }

    #[tokio::test]
    async fn test_malformed_frames_ignored() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::channel(connection_id);
        state.bus.join(project_id, handle);

        let mut announced = None;
        handle_client_frame(&state, project_id, connection_id, &mut announced, "not json");
        handle_client_frame(
            &state,
            project_id,
            connection_id,
            &mut announced,
            r#"{"type":"leave"}"#,
        );

        assert!(announced.is_none());
        assert!(rx.try_recv().is_err());
    }
}

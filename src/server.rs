use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::HiveConfig;
use crate::db::{DbHandle, HiveDb};
use crate::execution::manager::ExecutionManager;
use crate::execution::sandbox::{DockerSandbox, SandboxRunner};
use crate::realtime::broker::{LocalBroker, RoomBroker};
use crate::realtime::bus::EventBus;
use crate::realtime::registry::RoomRegistry;
use crate::realtime::relay::TcpBroker;
use crate::realtime::session;

/// Build the full application router: REST API plus the per-project
/// WebSocket endpoint.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws/projects/{project_id}", get(session::ws_handler))
        .with_state(state)
}

/// Wire up the store, broadcast fabric and sandbox, then serve until ctrl-c.
pub async fn start_server(config: HiveConfig) -> Result<()> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = DbHandle::new(
        HiveDb::new(&config.server.db_path).context("Failed to initialize database")?,
    );
    let registry = Arc::new(RoomRegistry::new());
    let broker: Arc<dyn RoomBroker> = match config.broker.url.as_deref() {
        Some(url) => Arc::new(
            TcpBroker::connect(url)
                .await
                .context("Failed to connect to broadcast relay")?,
        ),
        None => Arc::new(LocalBroker::new()),
    };
    let bus = Arc::new(EventBus::new(registry, broker));
    let sandbox: Arc<dyn SandboxRunner> = Arc::new(
        DockerSandbox::connect(&config.execution)
            .context("Failed to configure container runtime")?,
    );
    let executions = ExecutionManager::new(
        db.clone(),
        Arc::clone(&bus),
        sandbox,
        config.execution.clone(),
    );

    let state = Arc::new(AppState {
        db,
        bus,
        executions,
    });

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "codehive server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SharedState;
    use crate::api::testing::*;
    use crate::models::ProjectRole;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::time::{Duration, timeout};
    use tokio_tungstenite::{connect_async, tungstenite::Message};
    use uuid::Uuid;

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server(state: SharedState) -> SocketAddr {
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, project: Uuid, user: Uuid) -> WsClient {
        let url = format!("ws://{}/ws/projects/{}?user_id={}", addr, project, user);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    /// Read frames until the next Text frame, skipping keepalive traffic.
    async fn next_json(ws: &mut WsClient) -> serde_json::Value {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection ended unexpectedly")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn join_frame(user_id: &str, username: &str) -> Message {
        Message::Text(
            serde_json::json!({"type": "join", "user_id": user_id, "username": username})
                .to_string(),
        )
    }

    #[tokio::test]
    async fn test_session_flow_join_chat_ordering() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let grace = seed_user(&state, "grace");
        let project = seed_project(&state, &owner, "hive");
        seed_collaborator(&state, &project, &grace, ProjectRole::Editor);
        let addr = spawn_server(state).await;

        // First session: empty roster, then announce.
        let mut ws_a = connect(addr, project.id, owner.id).await;
        let roster = next_json(&mut ws_a).await;
        assert_eq!(roster["type"], "active_users");
        assert!(roster["users"].as_array().unwrap().is_empty());

        ws_a.send(join_frame(&owner.id.to_string(), "ada"))
            .await
            .unwrap();
        let joined = next_json(&mut ws_a).await;
        assert_eq!(joined["type"], "user_event");
        assert_eq!(joined["event"]["action"], "joined");
        assert_eq!(joined["event"]["username"], "ada");

        // Second session sees ada in the roster.
        let mut ws_b = connect(addr, project.id, grace.id).await;
        let roster = next_json(&mut ws_b).await;
        assert_eq!(roster["type"], "active_users");
        assert_eq!(roster["users"][0]["username"], "ada");

        // B joins, then chats: A must observe the join before the chat.
        ws_b.send(join_frame(&grace.id.to_string(), "grace"))
            .await
            .unwrap();
        ws_b.send(Message::Text(
            serde_json::json!({
                "type": "chat_message",
                "user_id": grace.id.to_string(),
                "username": "grace",
                "content": "hello",
            })
            .to_string(),
        ))
        .await
        .unwrap();

        let first = next_json(&mut ws_a).await;
        assert_eq!(first["type"], "user_event");
        assert_eq!(first["event"]["username"], "grace");
        let second = next_json(&mut ws_a).await;
        assert_eq!(second["type"], "chat_message");
        assert_eq!(second["message"]["content"], "hello");
    }

    #[tokio::test]
    async fn test_disconnect_after_join_publishes_user_left() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let grace = seed_user(&state, "grace");
        let project = seed_project(&state, &owner, "hive");
        seed_collaborator(&state, &project, &grace, ProjectRole::Viewer);
        let addr = spawn_server(state).await;

        let mut ws_a = connect(addr, project.id, owner.id).await;
        let _roster = next_json(&mut ws_a).await;

        let mut ws_b = connect(addr, project.id, grace.id).await;
        let _roster = next_json(&mut ws_b).await;
        ws_b.send(join_frame(&grace.id.to_string(), "grace"))
            .await
            .unwrap();
        let joined = next_json(&mut ws_a).await;
        assert_eq!(joined["event"]["action"], "joined");

        ws_b.close(None).await.unwrap();

        let left = next_json(&mut ws_a).await;
        assert_eq!(left["type"], "user_event");
        assert_eq!(left["event"]["action"], "left");
        assert_eq!(left["event"]["username"], "grace");
    }

    #[tokio::test]
    async fn test_abrupt_close_without_join_is_silent() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let grace = seed_user(&state, "grace");
        let project = seed_project(&state, &owner, "hive");
        seed_collaborator(&state, &project, &grace, ProjectRole::Viewer);
        let addr = spawn_server(state).await;

        let mut ws_a = connect(addr, project.id, owner.id).await;
        let _roster = next_json(&mut ws_a).await;

        // Connect and drop without ever announcing.
        let mut ws_c = connect(addr, project.id, grace.id).await;
        let _roster = next_json(&mut ws_c).await;
        drop(ws_c);

        // No user_left (or anything else) may reach A.
        let silence = timeout(Duration::from_millis(300), ws_a.next()).await;
        assert!(silence.is_err(), "unexpected frame after silent disconnect");
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let project = seed_project(&state, &owner, "hive");
        let addr = spawn_server(state).await;

        let mut ws = connect(addr, project.id, Uuid::new_v4()).await;
        // The server closes without sending any room frame.
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_collaborator_is_rejected() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let outsider = seed_user(&state, "mallory");
        let project = seed_project(&state, &owner, "hive");
        let addr = spawn_server(state).await;

        let mut ws = connect(addr, project.id, outsider.id).await;
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_identity_is_rejected() {
        let state = test_state();
        let owner = seed_user(&state, "ada");
        let project = seed_project(&state, &owner, "hive");
        let addr = spawn_server(state).await;

        let url = format!(
            "ws://{}/ws/projects/{}?user_id=not-a-uuid",
            addr, project.id
        );
        let (mut ws, _) = connect_async(url).await.unwrap();
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
    }
}

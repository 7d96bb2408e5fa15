use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::execution::manager::ExecutionManager;
use crate::models::*;
use crate::realtime::bus::EventBus;
use crate::realtime::events::{FileAction, FileEventPayload, RoomEvent};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub bus: Arc<EventBus>,
    pub executions: ExecutionManager,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct AddCollaboratorRequest {
    pub user_id: Uuid,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateFileRequest {
    pub name: Option<String>,
    pub path: Option<String>,
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateFileRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct CreateExecutionRequest {
    pub project_id: Option<Uuid>,
    pub command: Option<String>,
}

#[derive(Deserialize)]
pub struct ExecutionsQuery {
    pub project_id: Option<Uuid>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Authentication required".to_string(),
            ),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::Internal(err.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/users", post(create_user))
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}/collaborators", post(add_collaborator))
        .route(
            "/api/projects/{id}/files",
            get(list_files).post(create_file),
        )
        .route("/api/files/{id}", patch(update_file).delete(delete_file))
        .route(
            "/api/executions",
            get(list_executions).post(create_execution),
        )
        .route("/api/executions/{id}", get(get_execution))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Resolve the caller from the `x-user-id` header. Authentication itself is
/// handled upstream; this server only requires the asserted identity to
/// resolve to a stored user.
async fn require_user(state: &SharedState, headers: &HeaderMap) -> Result<User, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let user_id = Uuid::parse_str(raw).map_err(|_| ApiError::Unauthorized)?;
    state
        .db
        .call(move |db| db.get_user(user_id))
        .await
        .map_err(internal)?
        .ok_or(ApiError::Unauthorized)
}

async fn require_project(state: &SharedState, project_id: Uuid) -> Result<Project, ApiError> {
    state
        .db
        .call(move |db| db.get_project(project_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", project_id)))
}

/// Broadcast a file mutation to the project room, stamped with the
/// authenticated caller's identity.
fn publish_file_event(state: &SharedState, action: FileAction, file: &File, user: &User) {
    state.bus.publish(
        file.project_id,
        &RoomEvent::FileEvent {
            event: FileEventPayload {
                action,
                file_id: file.id.to_string(),
                file_path: file.path.clone(),
                user_id: user.id.to_string(),
                username: user.username.clone(),
            },
        },
    );
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "OK"
}

async fn create_user(
    State(state): State<SharedState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let email = req.email.unwrap_or_default();
    let user = state
        .db
        .call(move |db| db.create_user(&req.username, &email))
        .await
        .map_err(|err| {
            if err.to_string().contains("UNIQUE constraint failed") {
                ApiError::BadRequest("Username is already taken".to_string())
            } else {
                internal(err)
            }
        })?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let owner = require_user(&state, &headers).await?;
    let description = req.description.unwrap_or_default();
    let project = state
        .db
        .call(move |db| db.create_project(&req.name, &description, owner.id))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Project>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let project = require_project(&state, project_id).await?;
    let can = state
        .db
        .call(move |db| db.user_can_access(project_id, user.id))
        .await
        .map_err(internal)?;
    if !can {
        return Err(ApiError::Forbidden(
            "You do not have access to this project".to_string(),
        ));
    }
    Ok(Json(project))
}

async fn add_collaborator(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<AddCollaboratorRequest>,
) -> Result<(StatusCode, Json<Collaborator>), ApiError> {
    let caller = require_user(&state, &headers).await?;
    require_project(&state, project_id).await?;

    let is_admin = state
        .db
        .call(move |db| db.user_is_admin(project_id, caller.id))
        .await
        .map_err(internal)?;
    if !is_admin {
        return Err(ApiError::Forbidden(
            "Only project owner or admin can add collaborators".to_string(),
        ));
    }

    let target_id = req.user_id;
    let target = state
        .db
        .call(move |db| db.get_user(target_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let role = match req.role.as_deref() {
        Some(raw) => raw
            .parse::<ProjectRole>()
            .map_err(ApiError::BadRequest)?,
        None => ProjectRole::Viewer,
    };

    let collaborator = state
        .db
        .call(move |db| db.add_collaborator(project_id, target.id, role))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(collaborator)))
}

async fn list_files(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<File>>, ApiError> {
    let user = require_user(&state, &headers).await?;
    require_project(&state, project_id).await?;
    let can = state
        .db
        .call(move |db| db.user_can_access(project_id, user.id))
        .await
        .map_err(internal)?;
    if !can {
        return Err(ApiError::Forbidden(
            "You do not have access to this project".to_string(),
        ));
    }
    let files = state
        .db
        .call(move |db| db.list_files(project_id))
        .await
        .map_err(internal)?;
    Ok(Json(files))
}

async fn create_file(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<CreateFileRequest>,
) -> Result<(StatusCode, Json<File>), ApiError> {
    let user = require_user(&state, &headers).await?;
    require_project(&state, project_id).await?;
    require_edit_access(&state, project_id, &user).await?;

    let Some(path) = req.path.filter(|p| !p.is_empty()) else {
        return Err(ApiError::BadRequest("File path is required".to_string()));
    };
    let name = req
        .name
        .unwrap_or_else(|| path.rsplit('/').next().unwrap_or(&path).to_string());
    let content = req.content.unwrap_or_default();

    let file = state
        .db
        .call(move |db| db.create_file(project_id, &name, &path, &content))
        .await
        .map_err(|err| {
            if err.to_string().contains("UNIQUE constraint failed") {
                ApiError::BadRequest("A file already exists at this path".to_string())
            } else {
                internal(err)
            }
        })?;

    publish_file_event(&state, FileAction::Created, &file, &user);
    Ok((StatusCode::CREATED, Json(file)))
}

async fn update_file(
    State(state): State<SharedState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UpdateFileRequest>,
) -> Result<Json<File>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let file = require_file(&state, file_id).await?;
    require_edit_access(&state, file.project_id, &user).await?;

    let updated = state
        .db
        .call(move |db| db.update_file_content(file_id, &req.content))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("File {} not found", file_id)))?;

    publish_file_event(&state, FileAction::Updated, &updated, &user);
    Ok(Json(updated))
}

async fn delete_file(
    State(state): State<SharedState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&state, &headers).await?;
    let file = require_file(&state, file_id).await?;
    require_edit_access(&state, file.project_id, &user).await?;

    // Notify collaborators before the record disappears.
    publish_file_event(&state, FileAction::Deleted, &file, &user);
    state
        .db
        .call(move |db| db.delete_file(file_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_file(state: &SharedState, file_id: Uuid) -> Result<File, ApiError> {
    state
        .db
        .call(move |db| db.get_file(file_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("File {} not found", file_id)))
}

async fn require_edit_access(
    state: &SharedState,
    project_id: Uuid,
    user: &User,
) -> Result<(), ApiError> {
    let user_id = user.id;
    let can = state
        .db
        .call(move |db| db.user_can_edit(project_id, user_id))
        .await
        .map_err(internal)?;
    if can {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "You do not have permission to modify files in this project".to_string(),
        ))
    }
}

async fn create_execution(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionRecord>), ApiError> {
    let user = require_user(&state, &headers).await?;
    let (Some(project_id), Some(command)) = (req.project_id, req.command) else {
        return Err(ApiError::BadRequest(
            "Both project_id and command are required".to_string(),
        ));
    };

    require_project(&state, project_id).await?;
    let can = state
        .db
        .call(move |db| db.user_can_access(project_id, user.id))
        .await
        .map_err(internal)?;
    if !can {
        return Err(ApiError::Forbidden(
            "You do not have access to this project".to_string(),
        ));
    }

    let record = state
        .executions
        .execute(project_id, Some(user.id), &command)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let record = state
        .db
        .call(move |db| db.get_execution(execution_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Execution {} not found", execution_id)))?;

    // Visible to the requester that started it or anyone with project access.
    let visible = record.user_id == Some(user.id) || {
        let project_id = record.project_id;
        state
            .db
            .call(move |db| db.user_can_access(project_id, user.id))
            .await
            .map_err(internal)?
    };
    if !visible {
        return Err(ApiError::NotFound(format!(
            "Execution {} not found",
            execution_id
        )));
    }
    Ok(Json(record))
}

async fn list_executions(
    State(state): State<SharedState>,
    Query(query): Query<ExecutionsQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let records = match query.project_id {
        Some(project_id) => state
            .db
            .call(move |db| db.list_executions_for_project(project_id))
            .await
            .map_err(internal)?,
        None => state
            .db
            .call(move |db| db.list_executions_for_user(user.id))
            .await
            .map_err(internal)?,
    };
    Ok(Json(records))
}

// ── Test support ─────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::db::HiveDb;
    use crate::execution::sandbox::testing::{Script, ScriptedRunner};
    use crate::execution::sandbox::SandboxRunner;
    use crate::realtime::broker::LocalBroker;
    use crate::realtime::registry::RoomRegistry;

    /// Application state over an in-memory store and a scripted sandbox.
    pub(crate) fn state_with(script: Script) -> (SharedState, Arc<ScriptedRunner>) {
        let db = DbHandle::new(HiveDb::new_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(
            Arc::new(RoomRegistry::new()),
            Arc::new(LocalBroker::new()),
        ));
        let runner = Arc::new(ScriptedRunner::new(script));
        let executions = ExecutionManager::new(
            db.clone(),
            Arc::clone(&bus),
            Arc::clone(&runner) as Arc<dyn SandboxRunner>,
            ExecutionConfig::default(),
        );
        let state = Arc::new(AppState {
            db,
            bus,
            executions,
        });
        (state, runner)
    }

    pub(crate) fn test_state() -> SharedState {
        state_with(Script::Succeed {
            exit_code: 0,
            stdout: "hello\n".to_string(),
            stderr: String::new(),
        })
        .0
    }

    pub(crate) fn seed_user(state: &SharedState, username: &str) -> User {
        state
            .db
            .lock_sync()
            .unwrap()
            .create_user(username, &format!("{}@example.com", username))
            .unwrap()
    }

    pub(crate) fn seed_project(state: &SharedState, owner: &User, name: &str) -> Project {
        state
            .db
            .lock_sync()
            .unwrap()
            .create_project(name, "", owner.id)
            .unwrap()
    }

    pub(crate) fn seed_collaborator(
        state: &SharedState,
        project: &Project,
        user: &User,
        role: ProjectRole,
    ) {
        state
            .db
            .lock_sync()
            .unwrap()
            .add_collaborator(project.id, user.id, role)
            .unwrap();
    }

    pub(crate) fn seed_file(state: &SharedState, project: &Project, path: &str, content: &str) {
        state
            .db
            .lock_sync()
            .unwrap()
            .create_file(project.id, path, path, content)
            .unwrap();
    }
}

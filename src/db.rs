use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::models::*;

/// Async-safe handle to the store.
///
/// Wraps `HiveDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<HiveDb>>,
}

impl DbHandle {
    pub fn new(db: HiveDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HiveDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, HiveDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct HiveDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl HiveDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS project_collaborators (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    role TEXT NOT NULL DEFAULT 'viewer',
                    joined_at TEXT NOT NULL,
                    UNIQUE(project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS files (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(project_id, path)
                );

                -- No foreign key on project_id: setup failures record a
                -- failed execution for project ids that do not resolve.
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
                    command TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    stdout TEXT NOT NULL DEFAULT '',
                    stderr TEXT NOT NULL DEFAULT '',
                    exit_code INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_collaborators_project
                    ON project_collaborators(project_id);
                CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id);
                CREATE INDEX IF NOT EXISTS idx_executions_project
                    ON executions(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_executions_user
                    ON executions(user_id, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO users (id, username, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), username, email, now()],
            )
            .context("Failed to insert user")?;
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, username, email, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    // ── Projects & collaborators ──────────────────────────────────────

    pub fn create_project(&self, name: &str, description: &str, owner_id: Uuid) -> Result<Project> {
        let id = Uuid::new_v4();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, description, owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.to_string(), name, description, owner_id.to_string(), ts],
            )
            .context("Failed to insert project")?;
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, owner_id, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(ProjectRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        owner_id: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Create or update the collaborator row for (project, user).
    pub fn add_collaborator(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: ProjectRole,
    ) -> Result<Collaborator> {
        self.conn
            .execute(
                "INSERT INTO project_collaborators (id, project_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role",
                params![
                    Uuid::new_v4().to_string(),
                    project_id.to_string(),
                    user_id.to_string(),
                    role.as_str(),
                    now()
                ],
            )
            .context("Failed to upsert collaborator")?;
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, user_id, role, joined_at
                 FROM project_collaborators WHERE project_id = ?1 AND user_id = ?2",
                params![project_id.to_string(), user_id.to_string()],
                |row| {
                    Ok(CollaboratorRow {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        user_id: row.get(2)?,
                        role: row.get(3)?,
                        joined_at: row.get(4)?,
                    })
                },
            )
            .context("Collaborator not found after upsert")?;
        row.into_collaborator()
    }

    /// True when `user_id` resolves to a user who owns the project or has a
    /// collaborator row for it. False when the project does not exist.
    pub fn user_can_access(&self, project_id: Uuid, user_id: Uuid) -> Result<bool> {
        let access: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?2)
                    AND (EXISTS(SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2)
                         OR EXISTS(SELECT 1 FROM project_collaborators
                                   WHERE project_id = ?1 AND user_id = ?2))",
                params![project_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to query project access")?;
        Ok(access != 0)
    }

    /// True for the owner or a collaborator whose role grants edits.
    pub fn user_can_edit(&self, project_id: Uuid, user_id: Uuid) -> Result<bool> {
        let access: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2)
                    OR EXISTS(SELECT 1 FROM project_collaborators
                              WHERE project_id = ?1 AND user_id = ?2
                                AND role IN ('editor', 'admin'))",
                params![project_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to query edit access")?;
        Ok(access != 0)
    }

    /// True for the owner or an admin collaborator.
    pub fn user_is_admin(&self, project_id: Uuid, user_id: Uuid) -> Result<bool> {
        let access: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2)
                    OR EXISTS(SELECT 1 FROM project_collaborators
                              WHERE project_id = ?1 AND user_id = ?2 AND role = 'admin')",
                params![project_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to query admin access")?;
        Ok(access != 0)
    }

    // ── Files ─────────────────────────────────────────────────────────

    pub fn create_file(
        &self,
        project_id: Uuid,
        name: &str,
        path: &str,
        content: &str,
    ) -> Result<File> {
        let id = Uuid::new_v4();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO files (id, project_id, name, path, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id.to_string(), project_id.to_string(), name, path, content, ts],
            )
            .context("Failed to insert file")?;
        self.get_file(id)?.context("File not found after insert")
    }

    pub fn get_file(&self, id: Uuid) -> Result<Option<File>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, name, path, content, created_at, updated_at
                 FROM files WHERE id = ?1",
                params![id.to_string()],
                |row| Self::file_row(row),
            )
            .optional()
            .context("Failed to query file")?;
        row.map(FileRow::into_file).transpose()
    }

    pub fn update_file_content(&self, id: Uuid, content: &str) -> Result<Option<File>> {
        let changed = self
            .conn
            .execute(
                "UPDATE files SET content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, now(), id.to_string()],
            )
            .context("Failed to update file")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_file(id)
    }

    /// Idempotent: deleting an unknown file id is a no-op returning false.
    pub fn delete_file(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM files WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete file")?;
        Ok(changed > 0)
    }

    pub fn list_files(&self, project_id: Uuid) -> Result<Vec<File>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, name, path, content, created_at, updated_at
                 FROM files WHERE project_id = ?1 ORDER BY path",
            )
            .context("Failed to prepare list_files")?;
        let rows = stmt
            .query_map(params![project_id.to_string()], |row| Self::file_row(row))
            .context("Failed to query files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read file row")?.into_file()?);
        }
        Ok(files)
    }

    fn file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
        Ok(FileRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            path: row.get(3)?,
            content: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // ── Executions ────────────────────────────────────────────────────

    /// Create a record in `pending`, the normal entry point of the lifecycle.
    pub fn create_execution(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
        command: &str,
    ) -> Result<ExecutionRecord> {
        self.insert_execution(project_id, user_id, command, ExecutionStatus::Pending, "")
    }

    /// Create a record directly in the given status. Used by the
    /// setup-failure path, which records `failed` without ever being
    /// `pending`.
    pub fn create_execution_with(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
        command: &str,
        status: ExecutionStatus,
        stderr: &str,
    ) -> Result<ExecutionRecord> {
        self.insert_execution(project_id, user_id, command, status, stderr)
    }

    fn insert_execution(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
        command: &str,
        status: ExecutionStatus,
        stderr: &str,
    ) -> Result<ExecutionRecord> {
        let id = Uuid::new_v4();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO executions
                    (id, project_id, user_id, command, status, stderr, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    project_id.to_string(),
                    user_id.map(|u| u.to_string()),
                    command,
                    status.as_str(),
                    stderr,
                    ts
                ],
            )
            .context("Failed to insert execution")?;
        self.get_execution(id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, user_id, command, status, stdout, stderr,
                        exit_code, created_at, updated_at
                 FROM executions WHERE id = ?1",
                params![id.to_string()],
                |row| Self::execution_row(row),
            )
            .optional()
            .context("Failed to query execution")?;
        row.map(ExecutionRow::into_record).transpose()
    }

    /// Persist the mutable lifecycle fields of a record and refresh
    /// `updated_at`; returns the stored record.
    pub fn update_execution(&self, record: &ExecutionRecord) -> Result<ExecutionRecord> {
        self.conn
            .execute(
                "UPDATE executions
                 SET status = ?1, stdout = ?2, stderr = ?3, exit_code = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    record.status.as_str(),
                    record.stdout,
                    record.stderr,
                    record.exit_code,
                    now(),
                    record.id.to_string()
                ],
            )
            .context("Failed to update execution")?;
        self.get_execution(record.id)?
            .context("Execution not found after update")
    }

    pub fn list_executions_for_project(&self, project_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        self.list_executions(
            "SELECT id, project_id, user_id, command, status, stdout, stderr,
                    exit_code, created_at, updated_at
             FROM executions WHERE project_id = ?1
             ORDER BY created_at DESC, rowid DESC",
            project_id,
        )
    }

    pub fn list_executions_for_user(&self, user_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        self.list_executions(
            "SELECT id, project_id, user_id, command, status, stdout, stderr,
                    exit_code, created_at, updated_at
             FROM executions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
            user_id,
        )
    }

    fn list_executions(&self, sql: &str, key: Uuid) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare execution listing")?;
        let rows = stmt
            .query_map(params![key.to_string()], |row| Self::execution_row(row))
            .context("Failed to query executions")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read execution row")?.into_record()?);
        }
        Ok(records)
    }

    fn execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
        Ok(ExecutionRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            command: row.get(3)?,
            status: row.get(4)?,
            stdout: row.get(5)?,
            stderr: row.get(6)?,
            exit_code: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

// ── Raw row structs ───────────────────────────────────────────────────
// SQLite hands back TEXT columns; conversion into typed models happens
// outside the rusqlite closures so parse failures carry context.

struct UserRow {
    id: String,
    username: String,
    email: String,
    created_at: String,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_uuid(&self.id)?,
            username: self.username,
            email: self.email,
            created_at: self.created_at,
        })
    }
}

struct ProjectRow {
    id: String,
    name: String,
    description: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: parse_uuid(&self.id)?,
            name: self.name,
            description: self.description,
            owner_id: parse_uuid(&self.owner_id)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct CollaboratorRow {
    id: String,
    project_id: String,
    user_id: String,
    role: String,
    joined_at: String,
}

impl CollaboratorRow {
    fn into_collaborator(self) -> Result<Collaborator> {
        Ok(Collaborator {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            user_id: parse_uuid(&self.user_id)?,
            role: ProjectRole::from_str(&self.role)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid role column")?,
            joined_at: self.joined_at,
        })
    }
}

struct FileRow {
    id: String,
    project_id: String,
    name: String,
    path: String,
    content: String,
    created_at: String,
    updated_at: String,
}

impl FileRow {
    fn into_file(self) -> Result<File> {
        Ok(File {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            name: self.name,
            path: self.path,
            content: self.content,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ExecutionRow {
    id: String,
    project_id: String,
    user_id: Option<String>,
    command: String,
    status: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn into_record(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            user_id: self.user_id.as_deref().map(parse_uuid).transpose()?,
            command: self.command,
            status: ExecutionStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid status column")?,
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid UUID column: {}", raw))
}

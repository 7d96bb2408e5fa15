use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::db::DbHandle;
use crate::errors::ExecutionError;
use crate::models::{ExecutionRecord, ExecutionStatus};
use crate::realtime::bus::EventBus;
use crate::realtime::events::RoomEvent;

use super::sandbox::SandboxRunner;
use super::snapshot::Snapshot;

/// Drives the execution lifecycle: record creation, snapshot
/// materialization, the sandboxed run, and the broadcasts around each
/// status transition.
///
/// `execute` is synchronous from the caller's perspective — it returns the
/// terminal record. The record store is the source of truth; this manager is
/// its only writer for status transitions, which are forward-only.
pub struct ExecutionManager {
    db: DbHandle,
    bus: Arc<EventBus>,
    runner: Arc<dyn SandboxRunner>,
    config: ExecutionConfig,
}

impl ExecutionManager {
    pub fn new(
        db: DbHandle,
        bus: Arc<EventBus>,
        runner: Arc<dyn SandboxRunner>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            db,
            bus,
            runner,
            config,
        }
    }

    /// Run `command` against a snapshot of the project's files and return
    /// the terminal record.
    ///
    /// Sandbox failures of any kind land the record in `failed`; setup
    /// failures (unknown project, snapshot I/O, store errors mid-flight)
    /// produce a record created directly in `failed` — the one path that
    /// never passes through `pending`. The caller always gets a record back;
    /// only store failures while recording the failure itself propagate.
    pub async fn execute(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
        command: &str,
    ) -> Result<ExecutionRecord> {
        match self.drive(project_id, user_id, command).await {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(%project_id, error = %err, "execution setup failed");
                let stderr = format!("Execution setup failed: {}", err);
                let record = self
                    .db
                    .call({
                        let command = command.to_string();
                        move |db| {
                            db.create_execution_with(
                                project_id,
                                user_id,
                                &command,
                                ExecutionStatus::Failed,
                                &stderr,
                            )
                        }
                    })
                    .await
                    .context("Failed to record execution setup failure")?;
                self.publish_update(&record);
                Ok(record)
            }
        }
    }

    async fn drive(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
        command: &str,
    ) -> Result<ExecutionRecord> {
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or(ExecutionError::ProjectNotFound { id: project_id })?;
        info!(project = %project.name, %project_id, command, "starting execution");

        let mut record = self
            .db
            .call({
                let command = command.to_string();
                move |db| db.create_execution(project_id, user_id, &command)
            })
            .await?;

        record.status = ExecutionStatus::Running;
        record = self.persist(record).await?;
        self.publish_update(&record);

        let files = self.db.call(move |db| db.list_files(project_id)).await?;
        let snapshot = tokio::task::spawn_blocking(move || Snapshot::materialize(&files))
            .await
            .context("Snapshot task panicked")??;

        let outcome = self
            .runner
            .run(snapshot.path(), command, &self.config)
            .await;

        match outcome {
            Ok(run) => {
                record.status = ExecutionStatus::Completed;
                record.stdout = run.stdout;
                record.stderr = run.stderr;
                record.exit_code = Some(run.exit_code);
            }
            Err(err) => {
                record.status = ExecutionStatus::Failed;
                record.stderr = format!("Execution failed: {}", err);
            }
        }

        record = self.persist(record).await?;
        // The snapshot is exclusively this run's; remove it before the run
        // is considered finished. Error paths above are covered by its Drop.
        snapshot.close();

        self.publish_update(&record);
        info!(%project_id, execution = %record.id, status = %record.status, "execution finished");
        Ok(record)
    }

    async fn persist(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        self.db.call(move |db| db.update_execution(&record)).await
    }

    fn publish_update(&self, record: &ExecutionRecord) {
        self.bus
            .publish(record.project_id, &RoomEvent::execution_update(record.view()));
    }
}

//! Typed error hierarchy for the collaboration core.
//!
//! Three enums cover the three subsystems:
//! - `ExecutionError` — execution lifecycle and snapshot failures
//! - `SandboxError` — container launch/wait/collection failures
//! - `BrokerError` — cross-process broadcast transport failures

use thiserror::Error;

/// Errors raised while driving an execution lifecycle. All of these are
/// converted into a `failed` execution record by the manager; none propagate
/// to the transport layer.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: uuid::Uuid },

    #[error("Failed to write snapshot file {path}: {source}")]
    SnapshotWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the container sandbox. Everything here surfaces as a `failed`
/// record with the error text in stderr; the container itself is always
/// targeted for advisory kill/removal on the way out.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to connect to container runtime: {0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("Failed to launch sandbox container: {0}")]
    Launch(#[source] bollard::errors::Error),

    #[error("Error while waiting for sandbox container: {0}")]
    Wait(#[source] bollard::errors::Error),

    #[error("Failed to collect sandbox output: {0}")]
    Logs(#[source] bollard::errors::Error),

    #[error("container was removed")]
    Vanished,

    #[error("Execution exceeded time limit ({0}s)")]
    Timeout(u64),
}

/// Errors from the cross-process broadcast transport. Delivery is
/// best-effort, so these are logged by the bus and never surfaced to
/// publishers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker subscribe failed: {0}")]
    Subscribe(String),

    #[error("Broker publish failed: {0}")]
    Publish(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_project_not_found_is_matchable() {
        let id = uuid::Uuid::new_v4();
        let err = ExecutionError::ProjectNotFound { id };
        match &err {
            ExecutionError::ProjectNotFound { id: got } => assert_eq!(*got, id),
            _ => panic!("Expected ProjectNotFound variant"),
        }
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn execution_error_snapshot_write_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = ExecutionError::SnapshotWrite {
            path: std::path::PathBuf::from("/tmp/snap/a.txt"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/snap/a.txt"));
        assert!(msg.contains("access denied"));
    }

    #[test]
    fn sandbox_timeout_names_the_limit() {
        let err = SandboxError::Timeout(30);
        assert!(err.to_string().contains("time limit"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn sandbox_vanished_matches_source_diagnostic() {
        assert_eq!(SandboxError::Vanished.to_string(), "container was removed");
    }
}

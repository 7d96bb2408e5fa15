use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;

use crate::errors::ExecutionError;
use crate::models::File;

/// Ephemeral directory tree holding a project's files for one execution run.
///
/// Owned exclusively by that run. Removal is guaranteed on every exit path:
/// dropping the snapshot deletes the tree, and the manager calls [`close`]
/// explicitly on the main path so failures get logged.
///
/// [`close`]: Snapshot::close
#[derive(Debug)]
pub struct Snapshot {
    dir: TempDir,
}

impl Snapshot {
    /// Write every file to a fresh, uniquely named directory, preserving
    /// relative paths and creating parent directories as needed.
    pub fn materialize(files: &[File]) -> Result<Self, ExecutionError> {
        let dir = tempfile::Builder::new()
            .prefix("codehive-exec-")
            .tempdir()
            .map_err(|source| ExecutionError::SnapshotWrite {
                path: std::env::temp_dir(),
                source,
            })?;

        for file in files {
            let relative = sanitized_relative_path(&file.path)?;
            let target = dir.path().join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    ExecutionError::SnapshotWrite {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }
            std::fs::write(&target, &file.content).map_err(|source| {
                ExecutionError::SnapshotWrite {
                    path: target.clone(),
                    source,
                }
            })?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the tree now, logging instead of failing: by this point the
    /// record's outcome is already decided.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(path = %path.display(), error = %err, "failed to remove snapshot directory");
        }
    }
}

/// File paths come from stored records; they must stay inside the snapshot
/// root. Absolute paths and parent components are write failures, not
/// traversals.
fn sanitized_relative_path(raw: &str) -> Result<PathBuf, ExecutionError> {
    let mut clean = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(ExecutionError::SnapshotWrite {
                    path: PathBuf::from(raw),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "path escapes the snapshot directory",
                    ),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ExecutionError::SnapshotWrite {
            path: PathBuf::from(raw),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty file path"),
        });
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn file(path: &str, content: &str) -> File {
        File {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            content: content.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_materialize_writes_nested_paths() {
        let snapshot =
            Snapshot::materialize(&[file("a.txt", "x"), file("src/deep/main.py", "print(1)")])
                .unwrap();
        assert_eq!(
            std::fs::read_to_string(snapshot.path().join("a.txt")).unwrap(),
            "x"
        );
        assert_eq!(
            std::fs::read_to_string(snapshot.path().join("src/deep/main.py")).unwrap(),
            "print(1)"
        );
    }

    #[test]
    fn test_close_removes_directory() {
        let snapshot = Snapshot::materialize(&[file("a.txt", "x")]).unwrap();
        let path = snapshot.path().to_path_buf();
        assert!(path.exists());
        snapshot.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let path = {
            let snapshot = Snapshot::materialize(&[file("a.txt", "x")]).unwrap();
            snapshot.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_unique_directory_per_snapshot() {
        let a = Snapshot::materialize(&[]).unwrap();
        let b = Snapshot::materialize(&[]).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        for bad in ["../outside.txt", "/etc/passwd", "src/../../up.txt", ""] {
            let err = Snapshot::materialize(&[file(bad, "x")]).unwrap_err();
            match err {
                ExecutionError::SnapshotWrite { .. } => {}
                other => panic!("expected SnapshotWrite, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_curdir_components_are_normalized() {
        let snapshot = Snapshot::materialize(&[file("./src/./a.py", "ok")]).unwrap();
        assert!(snapshot.path().join("src/a.py").exists());
    }
}

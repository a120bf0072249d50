use crate::{AstDbError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolved `.astdb/` layout under a user-provided root. The engine treats
/// every entry as an opaque path; the collaborator owns the layout.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join(".astdb"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("version.json")
    }

    pub fn asts_dir(&self) -> PathBuf {
        self.root.join("asts")
    }

    pub fn annotations_dir(&self) -> PathBuf {
        self.root.join("annots")
    }

    pub fn grammars_dir(&self) -> PathBuf {
        self.root.join("grammars")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.bin")
    }

    pub fn index_meta_file(&self) -> PathBuf {
        self.root.join("index.meta.json")
    }

    pub fn storage_file(&self) -> PathBuf {
        self.root.join("store.redb")
    }

    pub fn l2_dir(&self) -> PathBuf {
        self.root.join("l2-disk")
    }

    pub fn l3_file(&self) -> PathBuf {
        self.root.join("l3-cache.db")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }
}

/// Advisory single-process lock. Creation fails with `AlreadyExists` while
/// another live process holds the workspace; dropping the guard removes the
/// lock file.
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    AstDbError::AlreadyExists(format!(
                        "workspace lock held: {}",
                        path.display()
                    ))
                } else {
                    AstDbError::Io(e)
                }
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        let lock_path = paths.lock_file();

        let lock = WorkspaceLock::acquire(&lock_path).unwrap();
        assert!(matches!(
            WorkspaceLock::acquire(&lock_path),
            Err(AstDbError::AlreadyExists(_))
        ));

        drop(lock);
        let relock = WorkspaceLock::acquire(&lock_path).unwrap();
        drop(relock);
    }

    #[test]
    fn layout_paths_live_under_astdb_root() {
        let paths = WorkspacePaths::new("/tmp/project");
        assert_eq!(paths.index_file(), PathBuf::from("/tmp/project/.astdb/index.bin"));
        assert_eq!(paths.l3_file(), PathBuf::from("/tmp/project/.astdb/l3-cache.db"));
    }
}

//! Durable, versioned storage of run documents.
//!
//! Each run lives in `<root>/<run_id>.json`. A save is a compare-and-swap on
//! the embedded `version`: it holds an exclusive advisory lock on
//! `<root>/<run_id>.lock` only while comparing and renaming, so a stage call
//! never blocks a reviewer read. Writes go to a temporary file that is
//! renamed over the document, readers never see a partial run.

use crate::core::error::StoreError;
use crate::core::state::RunState;
use anyhow::anyhow;
use chrono::Utc;
use fs2::FileExt;
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", run_id))
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{}.lock", run_id))
    }

    pub async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        validate_run_id(run_id)?;
        let path = self.document_path(run_id);
        let run_id = run_id.to_string();
        blocking(move || read_document(&path, &run_id)).await
    }

    /// Persist `state` if the stored version still equals `expected_version`.
    ///
    /// Returns the stored document with its version bumped. A run that does
    /// not exist yet can only be created with `expected_version == 0`.
    pub async fn save(&self, state: &RunState, expected_version: u64) -> Result<RunState, StoreError> {
        validate_run_id(&state.run_id)?;
        let path = self.document_path(&state.run_id);
        let lock_path = self.lock_path(&state.run_id);
        let mut next = state.clone();

        blocking(move || {
            let _lock = RunLock::acquire(&lock_path)?;

            let stored = match read_document(&path, &next.run_id) {
                Ok(stored) => Some(stored),
                Err(StoreError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let stored_version = stored.as_ref().map_or(0, |s| s.version);

            if stored_version != expected_version {
                return match stored {
                    Some(current) => Err(StoreError::VersionConflict {
                        expected: expected_version,
                        current: Box::new(current),
                    }),
                    None => Err(StoreError::NotFound {
                        run_id: next.run_id.clone(),
                    }),
                };
            }

            next.version = expected_version + 1;
            next.updated_at = Utc::now();
            write_atomic(&path, &next)?;
            debug!("Saved run {} at version {}", next.run_id, next.version);
            Ok(next)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        blocking(move || {
            let mut ids = Vec::new();
            for entry in fs::read_dir(&root)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(stem) = path.file_stem() {
                        ids.push(stem.to_string_lossy().to_string());
                    }
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }

    /// Remove a run. Only an operator action reaches this.
    pub async fn discard(&self, run_id: &str, expected_version: u64) -> Result<(), StoreError> {
        validate_run_id(run_id)?;
        let path = self.document_path(run_id);
        let lock_path = self.lock_path(run_id);
        let run_id = run_id.to_string();

        // The lock file stays behind: a waiter may already hold its inode.
        blocking(move || {
            let _lock = RunLock::acquire(&lock_path)?;
            let stored = read_document(&path, &run_id)?;
            if stored.version != expected_version {
                return Err(StoreError::VersionConflict {
                    expected: expected_version,
                    current: Box::new(stored),
                });
            }
            fs::remove_file(&path)?;
            info!("Discarded run {}", run_id);
            Ok(())
        })
        .await
    }
}

struct RunLock {
    file: File,
}

impl RunLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn validate_run_id(run_id: &str) -> Result<(), StoreError> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Other(anyhow!("invalid run id: {:?}", run_id)))
    }
}

fn read_document(path: &Path, run_id: &str) -> Result<RunState, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, state: &RunState) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Other(anyhow!("store task failed: {}", e)))?
}

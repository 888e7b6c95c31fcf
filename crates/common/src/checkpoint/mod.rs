//! Crash-safe checkpoint persistence
//!
//! A checkpoint is a single flat JSON record per profile describing
//! what the worker was doing and how far it got. Writes are atomic:
//! the full new state goes to a fresh temp file in the target's
//! directory, then a single rename replaces the canonical file, so a
//! crash at any point leaves either the old complete record or the new
//! complete record on disk. Concurrent writers to the same path are
//! resolved by the rename alone (last complete write wins); readers
//! never observe a half-written file.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded retries of the atomic replace step (not the whole write),
/// for transient failures such as a concurrent reader holding a lock.
const REPLACE_ATTEMPTS: u32 = 5;
const REPLACE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors raised by the checkpoint store.
///
/// A failed save never corrupts the last good on-disk state; the
/// canonical file still holds the previous complete record.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("atomic replace failed after {attempts} attempts: {source}")]
    ReplaceExhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// The durable progress record. One current record per profile; each
/// write fully replaces the prior one.
///
/// The schema is intentionally minimal and forward-compatible: unknown
/// keys are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Profile identity the record belongs to
    pub profile: String,
    /// The action the worker was performing
    pub action: String,
    /// Percent complete, clamped to `[0, 100]`
    pub progress: f64,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
}

impl CheckpointState {
    /// Create a record stamped with the current wall-clock time.
    pub fn new(profile: impl Into<String>, action: impl Into<String>, progress: f64) -> Self {
        Self {
            profile: profile.into(),
            action: action.into(),
            progress: progress.clamp(0.0, 100.0),
            timestamp: Utc::now(),
        }
    }
}

/// Durable, crash-safe store for a single checkpoint record.
///
/// Each profile gets its own path, so workers never contend across
/// profiles; rapid successive writes from one worker are serialized by
/// the atomic replace semantics alone.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Create a store persisting to the given canonical path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The canonical checkpoint path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically persist a checkpoint record.
    ///
    /// The record is written in full to a temp file created in the
    /// target's directory, flushed, then renamed onto the canonical
    /// path. Transient replace failures are retried a bounded number
    /// of times with a short fixed delay before surfacing.
    ///
    /// Synchronous: the replace retries sleep the calling thread, so
    /// async callers should run this under `spawn_blocking`.
    pub fn save(&self, state: &CheckpointState) -> Result<(), PersistenceError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let dir = dir.unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let json = serde_json::to_vec(state)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".checkpoint-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match tmp.persist(&self.path) {
                Ok(_) => {
                    debug!(
                        "Checkpoint saved for profile '{}' ({:.1}% of {})",
                        state.profile, state.progress, state.action
                    );
                    return Ok(());
                }
                Err(err) if attempt < REPLACE_ATTEMPTS => {
                    warn!(
                        "Checkpoint replace attempt {} failed ({}), retrying",
                        attempt, err.error
                    );
                    tmp = err.file;
                    std::thread::sleep(REPLACE_RETRY_DELAY);
                }
                Err(err) => {
                    return Err(PersistenceError::ReplaceExhausted {
                        attempts: attempt,
                        source: err.error,
                    });
                }
            }
        }
    }

    /// Load the current checkpoint record, if one exists.
    ///
    /// Only the canonical filename is read; orphaned temp files from a
    /// crashed writer are ignored.
    pub fn load(&self) -> Result<Option<CheckpointState>, PersistenceError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }

    /// Remove the checkpoint record. A missing file is not an error.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Checkpoint cleared at {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("active_session.json"))
    }

    /// Validates a save/load round trip preserves the record.
    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let state = CheckpointState::new("alice", "fetch_followers", 42.5);
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    /// Validates `load` returns `None` when no record exists.
    #[test]
    fn test_load_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    /// Tests each save fully replaces the prior record
    /// (last-writer-wins, single current record).
    #[test]
    fn test_save_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.save(&CheckpointState::new("alice", "fetch_followers", 10.0)).unwrap();
        store.save(&CheckpointState::new("alice", "fetch_followers", 70.0)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.progress, 70.0);
    }

    /// Tests progress is clamped into `[0, 100]`.
    #[test]
    fn test_progress_clamped() {
        assert_eq!(CheckpointState::new("a", "b", -3.0).progress, 0.0);
        assert_eq!(CheckpointState::new("a", "b", 250.0).progress, 100.0);
    }

    /// Tests `clear` removes the record and tolerates a missing file.
    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.save(&CheckpointState::new("alice", "fetch_followers", 99.0)).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());

        // Second clear on a missing file is fine.
        store.clear().unwrap();
    }

    /// Tests orphaned temp files from a crashed writer are ignored by
    /// `load`: only the canonical filename is read.
    #[test]
    fn test_orphaned_temp_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.save(&CheckpointState::new("alice", "fetch_followers", 50.0)).unwrap();

        // Simulate a writer that died between temp creation and rename.
        fs::write(dir.path().join(".checkpoint-orphan.tmp"), b"{\"garbage\":").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.progress, 50.0);
    }

    /// Tests unknown keys in the on-disk record are ignored on read
    /// (forward compatibility).
    #[test]
    fn test_unknown_keys_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        fs::write(
            store.path(),
            br#"{"profile":"alice","action":"sync","progress":12.0,"timestamp":"2026-01-02T03:04:05Z","future_field":true}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.profile, "alice");
        assert_eq!(loaded.progress, 12.0);
    }

    /// Tests the on-disk record is always complete, valid JSON after
    /// every save in a rapid sequence.
    #[test]
    fn test_rapid_saves_never_leave_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        for step in 0..50 {
            store.save(&CheckpointState::new("alice", "sync", f64::from(step) * 2.0)).unwrap();
            let bytes = fs::read(store.path()).unwrap();
            let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert!(parsed.get("profile").is_some());
        }
    }
}

//! Checkpoint persistence.
//!
//! One snapshot per session under `<root>/<session_id>/checkpoint.json`,
//! written to a temporary file and renamed into place so a concurrent
//! reader never observes a half-written snapshot. A missing snapshot and a
//! damaged one are distinct failures: callers can tell "never started"
//! apart from "corrupted, start a fresh session".

use crate::state::{NodeId, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_FILE_NAME: &str = "checkpoint.json";
const SNAPSHOT_TMP_NAME: &str = "checkpoint.json.tmp";
const HISTORY_DIR_NAME: &str = "history";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub last_completed_node: NodeId,
    pub status: SessionStatus,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(last_completed_node: NodeId, status: SessionStatus, state: WorkflowState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            last_completed_node,
            status,
            state,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub last_completed_node: NodeId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for session `{session_id}`")]
    NotFound { session_id: String },
    #[error("checkpoint for session `{session_id}` is corrupted at `{path}`: {source}")]
    Corrupt {
        session_id: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint io failed at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Filesystem-backed store of workflow snapshots, keyed by session id.
///
/// Retains only the latest snapshot per session unless history retention is
/// enabled, in which case every save is also appended under `history/`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    retain_history: bool,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain_history: false,
        }
    }

    pub fn with_history(mut self) -> Self {
        self.retain_history = true;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SNAPSHOT_FILE_NAME)
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.session_dir(&checkpoint.session_id);
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::io(&dir, source))?;

        let payload = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::Corrupt {
                session_id: checkpoint.session_id.clone(),
                path: dir.join(SNAPSHOT_FILE_NAME),
                source,
            }
        })?;

        let tmp = dir.join(SNAPSHOT_TMP_NAME);
        fs::write(&tmp, &payload).map_err(|source| CheckpointError::io(&tmp, source))?;
        let target = dir.join(SNAPSHOT_FILE_NAME);
        fs::rename(&tmp, &target).map_err(|source| CheckpointError::io(&target, source))?;

        if self.retain_history {
            let history_dir = dir.join(HISTORY_DIR_NAME);
            fs::create_dir_all(&history_dir)
                .map_err(|source| CheckpointError::io(&history_dir, source))?;
            let seq = self.history_len(&checkpoint.session_id)?;
            let entry = history_dir.join(format!("checkpoint_{seq:05}.json"));
            fs::write(&entry, &payload).map_err(|source| CheckpointError::io(&entry, source))?;
        }

        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.snapshot_path(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    session_id: session_id.to_string(),
                })
            }
            Err(source) => return Err(CheckpointError::io(&path, source)),
        };

        serde_json::from_str(&contents).map_err(|source| CheckpointError::Corrupt {
            session_id: session_id.to_string(),
            path,
            source,
        })
    }

    /// Summaries of every session with a readable snapshot, sorted by id.
    /// Unreadable snapshots are skipped here; `load` is the place that
    /// reports corruption explicitly.
    pub fn list(&self) -> Result<Vec<SessionSummary>, CheckpointError> {
        let mut summaries = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(summaries),
            Err(source) => return Err(CheckpointError::io(&self.root, source)),
        };

        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::io(&self.root, source))?;
            if !entry.path().is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            if let Ok(checkpoint) = self.load(&session_id) {
                summaries.push(SessionSummary {
                    session_id: checkpoint.session_id,
                    status: checkpoint.status,
                    last_completed_node: checkpoint.last_completed_node,
                    created_at: checkpoint.created_at,
                });
            }
        }

        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(summaries)
    }

    pub fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CheckpointError::NotFound {
                session_id: session_id.to_string(),
            }),
            Err(source) => Err(CheckpointError::io(&dir, source)),
        }
    }

    /// Number of retained history snapshots for a session.
    pub fn history_len(&self, session_id: &str) -> Result<usize, CheckpointError> {
        let history_dir = self.session_dir(session_id).join(HISTORY_DIR_NAME);
        let entries = match fs::read_dir(&history_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(CheckpointError::io(&history_dir, source)),
        };
        let mut count = 0usize;
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::io(&history_dir, source))?;
            if entry.path().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowState;
    use tempfile::tempdir;

    fn sample_checkpoint(session_id: &str) -> Checkpoint {
        let mut state = WorkflowState::new(session_id, "a storm story");
        state.total_chapters = 2;
        Checkpoint::new(NodeId::GenerateOutline, SessionStatus::InProgress, state)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = sample_checkpoint("session-a");
        store.save(&checkpoint).unwrap();

        let loaded = store.load("session-a").unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn missing_session_is_not_found() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("nope"),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[test]
    fn damaged_snapshot_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample_checkpoint("session-b")).unwrap();

        let path = dir.path().join("session-b").join("checkpoint.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            store.load("session-b"),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn stale_tmp_file_never_shadows_the_snapshot() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = sample_checkpoint("session-c");
        store.save(&checkpoint).unwrap();

        // Simulate a crash mid-save: a half-written tmp file is present.
        let tmp = dir.path().join("session-c").join("checkpoint.json.tmp");
        fs::write(&tmp, "{\"session_id\": \"session-c\"").unwrap();

        let loaded = store.load("session-c").unwrap();
        assert_eq!(loaded.state, checkpoint.state);

        // The next save replaces the tmp file and still lands atomically.
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load("session-c").unwrap().state, checkpoint.state);
    }

    #[test]
    fn latest_only_by_default_history_when_enabled() {
        let dir = tempdir().unwrap();

        let store = CheckpointStore::new(dir.path());
        store.save(&sample_checkpoint("plain")).unwrap();
        store.save(&sample_checkpoint("plain")).unwrap();
        assert_eq!(store.history_len("plain").unwrap(), 0);

        let store = CheckpointStore::new(dir.path()).with_history();
        store.save(&sample_checkpoint("tracked")).unwrap();
        store.save(&sample_checkpoint("tracked")).unwrap();
        store.save(&sample_checkpoint("tracked")).unwrap();
        assert_eq!(store.history_len("tracked").unwrap(), 3);
    }

    #[test]
    fn list_and_delete_sessions() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample_checkpoint("b-session")).unwrap();
        store.save(&sample_checkpoint("a-session")).unwrap();

        let summaries = store.list().unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a-session", "b-session"]);

        store.delete("a-session").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(matches!(
            store.delete("a-session"),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.list().unwrap().is_empty());
    }
}

//! On-disk session persistence.
//!
//! One JSON file per session under `{state_path}/sessions/`, written with
//! a temp-file rename so a crash never leaves a torn file. Durable
//! checkpoint kinds are additionally mirrored to an append-only
//! `checkpoints.jsonl`, best effort.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mm_domain::checkpoint::Checkpoint;
use mm_domain::error::Result;
use mm_ledger::LedgerSnapshot;

use crate::state::SessionState;

/// The on-disk shape of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session: SessionState,
    /// Materialized ledger snapshot at save time, when one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerSnapshot>,
    pub saved_at: DateTime<Utc>,
}

pub struct SessionStore {
    dir: PathBuf,
    checkpoint_log: Mutex<File>,
}

impl SessionStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir)?;

        let checkpoint_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(state_path.join("checkpoints.jsonl"))?;

        tracing::info!(path = %dir.display(), "session store ready");
        Ok(Self {
            dir,
            checkpoint_log: Mutex::new(checkpoint_log),
        })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Atomically write one session file (temp file + rename).
    pub fn save(&self, state: &SessionState, ledger: Option<&LedgerSnapshot>) -> Result<()> {
        let persisted = PersistedSession {
            session: state.clone(),
            ledger: ledger.cloned(),
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;

        let target = self.path_for(&state.session_id);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Option<PersistedSession>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn remove(&self, session_id: &str) {
        let path = self.path_for(session_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove session file");
            }
        }
    }

    /// Scan the directory at startup. Sessions last active within the idle
    /// window are returned for recovery; older files are deleted.
    pub fn scan(&self, idle_window: Duration) -> Result<Vec<PersistedSession>> {
        let cutoff = Utc::now() - idle_window;
        let mut recovered = Vec::new();

        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let persisted: PersistedSession = match serde_json::from_str(&raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable session file");
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
            };

            if persisted.session.last_activity < cutoff {
                tracing::info!(
                    session_id = %persisted.session.session_id,
                    "discarding idle session from previous run"
                );
                let _ = std::fs::remove_file(&path);
                continue;
            }
            recovered.push(persisted);
        }

        tracing::info!(recovered = recovered.len(), "session store scan complete");
        Ok(recovered)
    }

    /// Best-effort append of a durable checkpoint to the mirror log.
    pub fn mirror_checkpoint(&self, checkpoint: &Checkpoint) {
        let line = match serde_json::to_string(checkpoint) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode checkpoint for mirror");
                return;
            }
        };
        let mut log = self.checkpoint_log.lock();
        if let Err(e) = log
            .write_all(line.as_bytes())
            .and_then(|()| log.write_all(b"\n"))
        {
            tracing::warn!(error = %e, "failed to mirror checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_domain::checkpoint::{CheckpointKind, CheckpointPayload};

    fn state(id: &str) -> SessionState {
        SessionState::new(id.into(), 8)
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let mut st = state("s1");
        st.role = Some("developer".into());
        st.mounted_tools.insert("exa".into());
        store.save(&st, None).unwrap();

        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session.role.as_deref(), Some("developer"));
        assert!(loaded.session.mounted_tools.contains("exa"));
    }

    #[test]
    fn scan_discards_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let fresh = state("fresh");
        store.save(&fresh, None).unwrap();

        let mut stale = state("stale");
        stale.last_activity = Utc::now() - Duration::hours(5);
        store.save(&stale, None).unwrap();

        let recovered = store.scan(Duration::hours(2)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].session.session_id, "fresh");
        assert!(store.load("stale").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.save(&state("good"), None).unwrap();
        std::fs::write(dir.path().join("sessions/bad.json"), b"{torn").unwrap();

        let recovered = store.scan(Duration::hours(2)).unwrap();
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn checkpoint_mirror_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let cp = Checkpoint::new(
            CheckpointKind::SessionEnd,
            "s1",
            Some("developer".into()),
            CheckpointPayload::default(),
        );
        store.mirror_checkpoint(&cp);
        store.mirror_checkpoint(&cp);

        let raw = std::fs::read_to_string(dir.path().join("checkpoints.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}

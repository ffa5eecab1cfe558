//! The session registry: owns every session's authoritative state and
//! serializes mutations to it.
//!
//! Concurrency model: each session carries an async *operation lock*
//! (held across a whole role switch, taken briefly for call admission —
//! this is what makes an in-flight role switch block new admissions) and
//! a sync *state mutex* guarding short critical sections that never
//! suspend. I/O always runs with the state mutex released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use mm_domain::checkpoint::{Checkpoint, CheckpointKind, CheckpointPayload};
use mm_domain::error::{Error, Result};
use mm_ledger::LedgerSnapshot;

use crate::state::{EscalationState, SessionState};
use crate::store::{PersistedSession, SessionStore};

/// Handle to one session. Cloned freely; all state lives behind locks.
pub struct SessionHandle {
    pub id: String,
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl SessionHandle {
    fn new(state: SessionState) -> Self {
        Self {
            id: state.session_id.clone(),
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    /// Acquire the operation lock. Hold it across a role switch; take it
    /// briefly for call admission.
    pub async fn ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    /// Run a closure under the state mutex. The closure must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Lock-free-ish read: a cloned snapshot of the interesting fields.
    pub fn view(&self) -> SessionView {
        let state = self.state.lock();
        SessionView {
            session_id: state.session_id.clone(),
            role: state.role.clone(),
            mounted_tools: state.mounted_tools.clone(),
            created_at: state.created_at,
            last_activity: state.last_activity,
            escalation: state.escalation.clone(),
            checkpoint_count: state.checkpoints.len(),
        }
    }
}

/// Read snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub role: Option<String>,
    pub mounted_tools: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub escalation: EscalationState,
    pub checkpoint_count: usize,
}

/// Outcome of applying a role switch to session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSwitchDelta {
    pub previous_role: Option<String>,
    pub mounted: BTreeSet<String>,
    pub mounted_added: Vec<String>,
    pub mounted_removed: Vec<String>,
    /// Removed tools still carrying in-flight calls; released when the
    /// last call completes.
    pub release_deferred: Vec<String>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: Arc<SessionStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Re-insert sessions recovered by the store's startup scan.
    pub fn recover(&self, persisted: Vec<PersistedSession>) -> usize {
        let mut sessions = self.sessions.write();
        let mut count = 0usize;
        for p in persisted {
            let id = p.session.session_id.clone();
            sessions.insert(id, Arc::new(SessionHandle::new(p.session)));
            count += 1;
        }
        count
    }

    /// Get or create a session. New sessions are persisted immediately.
    pub fn admit(&self, session_id: &str, ring_capacity: usize) -> Result<(Arc<SessionHandle>, bool)> {
        if let Some(handle) = self.sessions.read().get(session_id) {
            return Ok((handle.clone(), false));
        }

        let state = SessionState::new(session_id.to_string(), ring_capacity);
        self.store.save(&state, None)?;

        let handle = Arc::new(SessionHandle::new(state));
        self.sessions
            .write()
            .insert(session_id.to_string(), handle.clone());

        tracing::info!(session_id, "session admitted");
        Ok((handle, true))
    }

    pub fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchSession(session_id.to_string()))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn touch(&self, session_id: &str) -> Result<()> {
        self.handle(session_id)?.with_state(|s| s.touch());
        Ok(())
    }

    // ── Call admission ────────────────────────────────────────────────

    /// Verify the tool is mounted and register the in-flight call. The
    /// caller must hold the session's operation lock.
    pub fn admit_call(&self, session_id: &str, tool: &str) -> Result<()> {
        self.handle(session_id)?.with_state(|s| {
            if !s.mounted_tools.contains(tool) {
                return Err(Error::AccessDenied {
                    tool: tool.to_string(),
                    role: s.role.clone(),
                });
            }
            s.begin_call(tool);
            Ok(())
        })
    }

    /// Mark an in-flight call finished. Returns tools whose deferred
    /// release completed with this call.
    pub fn finish_call(&self, session_id: &str, tool: &str) -> Vec<String> {
        let Ok(handle) = self.handle(session_id) else {
            return Vec::new();
        };
        handle.with_state(|s| {
            if s.finish_call(tool) {
                tracing::info!(session_id, tool, "deferred tool release completed");
                vec![tool.to_string()]
            } else {
                Vec::new()
            }
        })
    }

    // ── Role switch & escalation ──────────────────────────────────────

    /// Swap the session onto a new role's tool set. Unmounted tools with
    /// live calls go to deferred release; the active escalation is
    /// cleared. The caller holds the operation lock and has already
    /// checked transition legality.
    pub fn apply_role_switch(
        &self,
        session_id: &str,
        new_role: &str,
        new_tools: BTreeSet<String>,
    ) -> Result<RoleSwitchDelta> {
        self.handle(session_id)?.with_state(|s| {
            let previous_role = s.role.clone();

            let removed: Vec<String> = s
                .mounted_tools
                .difference(&new_tools)
                .cloned()
                .collect();
            let added: Vec<String> = new_tools
                .difference(&s.mounted_tools)
                .cloned()
                .collect();

            let mut deferred = Vec::new();
            for tool in &removed {
                if s.tool_in_flight(tool) {
                    s.deferred_release.insert(tool.clone());
                    deferred.push(tool.clone());
                }
            }
            // A tool re-mounted by this switch no longer needs releasing.
            s.deferred_release.retain(|t| !new_tools.contains(t));

            s.role = Some(new_role.to_string());
            s.mounted_tools = new_tools.clone();
            s.escalation = EscalationState::None;
            s.touch();

            Ok(RoleSwitchDelta {
                previous_role,
                mounted: new_tools,
                mounted_added: added,
                mounted_removed: removed,
                release_deferred: deferred,
            })
        })
    }

    /// Restore the exact previous state after an aborted role switch.
    pub fn restore_state(&self, session_id: &str, previous: SessionState) -> Result<()> {
        self.handle(session_id)?.with_state(|s| *s = previous);
        Ok(())
    }

    /// A cloned copy of the full state, for switch rollback.
    pub fn state_copy(&self, session_id: &str) -> Result<SessionState> {
        Ok(self.handle(session_id)?.with_state(|s| s.clone()))
    }

    pub fn grant_escalation(
        &self,
        session_id: &str,
        trigger: &str,
        additional_tools: BTreeSet<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionView> {
        let handle = self.handle(session_id)?;
        handle.with_state(|s| {
            s.mounted_tools.extend(additional_tools.iter().cloned());
            s.escalation = EscalationState::Active {
                trigger: trigger.to_string(),
                additional_tools,
                expires_at,
            };
            s.touch();
        });
        tracing::info!(session_id, trigger, %expires_at, "escalation granted");
        Ok(handle.view())
    }

    pub fn pend_escalation(
        &self,
        session_id: &str,
        trigger: &str,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.handle(session_id)?.with_state(|s| {
            s.escalation = EscalationState::PendingApproval {
                trigger: trigger.to_string(),
                deadline,
            };
            s.touch();
        });
        Ok(())
    }

    /// Release escalation tools and restore the role's default set.
    /// Returns true when an active escalation was actually expired.
    pub fn expire_escalation(
        &self,
        session_id: &str,
        default_tools: &BTreeSet<String>,
    ) -> Result<bool> {
        self.handle(session_id)?.with_state(|s| {
            match &s.escalation {
                EscalationState::Active { .. } => {
                    let removed: Vec<String> = s
                        .mounted_tools
                        .difference(default_tools)
                        .cloned()
                        .collect();
                    for tool in &removed {
                        if s.tool_in_flight(tool) {
                            s.deferred_release.insert(tool.clone());
                        }
                    }
                    s.deferred_release.retain(|t| !default_tools.contains(t));
                    s.mounted_tools = default_tools.clone();
                    s.escalation = EscalationState::None;
                    tracing::info!(
                        session_id = %s.session_id,
                        released = removed.len(),
                        "escalation expired"
                    );
                    Ok(true)
                }
                EscalationState::PendingApproval { .. } => {
                    s.escalation = EscalationState::None;
                    Ok(false)
                }
                EscalationState::None => Ok(false),
            }
        })
    }

    /// Sessions whose escalation expiry (or approval deadline) has passed.
    pub fn expired_escalations(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|h| {
                h.with_state(|s| match &s.escalation {
                    EscalationState::Active { expires_at, .. } => *expires_at <= now,
                    EscalationState::PendingApproval { deadline, .. } => *deadline <= now,
                    EscalationState::None => false,
                })
            })
            .map(|h| h.id.clone())
            .collect()
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Append a checkpoint to the session's ring, mirror durable kinds,
    /// and persist the session file.
    pub fn checkpoint(
        &self,
        session_id: &str,
        kind: CheckpointKind,
        payload: CheckpointPayload,
    ) -> Result<Checkpoint> {
        let handle = self.handle(session_id)?;
        let (checkpoint, state_copy) = handle.with_state(|s| {
            let checkpoint = Checkpoint::new(kind, session_id, s.role.clone(), payload);
            if let Some(evicted) = s.checkpoints.push(checkpoint.clone()) {
                tracing::debug!(
                    session_id,
                    evicted_kind = ?evicted.kind,
                    "checkpoint ring evicted oldest entry"
                );
            }
            s.touch();
            (checkpoint, s.clone())
        });

        if kind.is_durable() {
            self.store.mirror_checkpoint(&checkpoint);
        }
        self.store.save(&state_copy, None)?;
        Ok(checkpoint)
    }

    /// Fetch a checkpoint by ring position (0 = oldest surviving entry);
    /// `None` returns the most recent.
    pub fn restore(&self, session_id: &str, index: Option<usize>) -> Result<Checkpoint> {
        self.handle(session_id)?.with_state(|s| {
            let found = match index {
                Some(i) => s.checkpoints.get(i),
                None => s.checkpoints.latest(),
            };
            found.cloned().ok_or_else(|| {
                Error::internal(format!(
                    "checkpoint index {index:?} out of range for session {session_id}"
                ))
            })
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Close a session: final session-end checkpoint, release tools,
    /// remove from the registry and the store.
    pub fn close(&self, session_id: &str, payload: CheckpointPayload) -> Result<Checkpoint> {
        let checkpoint = self.checkpoint(session_id, CheckpointKind::SessionEnd, payload)?;
        self.sessions.write().remove(session_id);
        self.store.remove(session_id);
        tracing::info!(session_id, "session closed");
        Ok(checkpoint)
    }

    /// Persist a session file together with its current ledger snapshot.
    pub fn persist(&self, session_id: &str, ledger: Option<&LedgerSnapshot>) -> Result<()> {
        let state = self.state_copy(session_id)?;
        self.store.save(&state, ledger)
    }

    pub fn idle_sessions(&self, idle_for: Duration) -> Vec<String> {
        let cutoff = Utc::now() - idle_for;
        self.sessions
            .read()
            .values()
            .filter(|h| h.with_state(|s| s.last_activity < cutoff))
            .map(|h| h.id.clone())
            .collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn views(&self) -> Vec<SessionView> {
        self.sessions.read().values().map(|h| h.view()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()).unwrap());
        (dir, SessionRegistry::new(store))
    }

    fn tools(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn admit_is_idempotent() {
        let (_dir, reg) = registry();
        let (_, is_new) = reg.admit("s1", 8).unwrap();
        assert!(is_new);
        let (_, is_new) = reg.admit("s1", 8).unwrap();
        assert!(!is_new);
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn admit_call_requires_mounted_tool() {
        let (_dir, reg) = registry();
        reg.admit("s1", 8).unwrap();
        reg.apply_role_switch("s1", "developer", tools(&["exa"])).unwrap();

        assert!(reg.admit_call("s1", "exa").is_ok());
        let err = reg.admit_call("s1", "zen").unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
    }

    #[test]
    fn role_switch_defers_release_of_in_flight_tools() {
        let (_dir, reg) = registry();
        reg.admit("s1", 8).unwrap();
        reg.apply_role_switch("s1", "developer", tools(&["exa", "serena"]))
            .unwrap();

        reg.admit_call("s1", "serena").unwrap();

        // Switch to a role without serena while its call is in flight.
        let delta = reg
            .apply_role_switch("s1", "researcher", tools(&["exa"]))
            .unwrap();
        assert_eq!(delta.previous_role.as_deref(), Some("developer"));
        assert_eq!(delta.mounted_removed, vec!["serena".to_string()]);
        assert_eq!(delta.release_deferred, vec!["serena".to_string()]);

        // New admissions of the removed tool fail immediately.
        assert!(matches!(
            reg.admit_call("s1", "serena").unwrap_err(),
            Error::AccessDenied { .. }
        ));

        // The in-flight call completing performs the release.
        let released = reg.finish_call("s1", "serena");
        assert_eq!(released, vec!["serena".to_string()]);
    }

    #[test]
    fn escalation_grant_and_expire_restores_defaults() {
        let (_dir, reg) = registry();
        reg.admit("s1", 8).unwrap();
        reg.apply_role_switch("s1", "developer", tools(&["exa"])).unwrap();

        let expires = Utc::now() + Duration::seconds(1800);
        let view = reg
            .grant_escalation("s1", "test_failure", tools(&["zen"]), expires)
            .unwrap();
        assert!(view.mounted_tools.contains("zen"));
        assert!(view.escalation.is_active());

        // Not yet expired.
        assert!(reg.expired_escalations(Utc::now()).is_empty());
        // One second past expiry.
        let later = expires + Duration::seconds(1);
        assert_eq!(reg.expired_escalations(later), vec!["s1".to_string()]);

        let expired = reg.expire_escalation("s1", &tools(&["exa"])).unwrap();
        assert!(expired);
        let view = reg.handle("s1").unwrap().view();
        assert_eq!(view.mounted_tools, tools(&["exa"]));
        assert_eq!(view.escalation, EscalationState::None);
    }

    #[test]
    fn role_switch_clears_escalation() {
        let (_dir, reg) = registry();
        reg.admit("s1", 8).unwrap();
        reg.apply_role_switch("s1", "developer", tools(&["exa"])).unwrap();
        reg.grant_escalation(
            "s1",
            "test_failure",
            tools(&["zen"]),
            Utc::now() + Duration::seconds(600),
        )
        .unwrap();

        reg.apply_role_switch("s1", "reviewer", tools(&["serena"])).unwrap();
        let view = reg.handle("s1").unwrap().view();
        assert_eq!(view.escalation, EscalationState::None);
        assert_eq!(view.mounted_tools, tools(&["serena"]));
    }

    #[test]
    fn checkpoint_restore_roundtrip() {
        let (_dir, reg) = registry();
        reg.admit("s1", 8).unwrap();

        let payload = CheckpointPayload {
            mental_model: "midway through the refactor".into(),
            next_steps: vec!["finish the parser".into()],
            ..Default::default()
        };
        reg.checkpoint("s1", CheckpointKind::Manual, payload.clone())
            .unwrap();

        let restored = reg.restore("s1", Some(0)).unwrap();
        assert_eq!(restored.mental_model, payload.mental_model);
        assert_eq!(restored.next_steps, payload.next_steps);

        let latest = reg.restore("s1", None).unwrap();
        assert_eq!(latest, restored);
    }

    #[test]
    fn close_removes_session_and_file() {
        let (dir, reg) = registry();
        reg.admit("s1", 8).unwrap();
        let cp = reg.close("s1", CheckpointPayload::default()).unwrap();
        assert_eq!(cp.kind, CheckpointKind::SessionEnd);
        assert!(!reg.exists("s1"));
        assert!(!dir.path().join("sessions/s1.json").exists());

        // The durable mirror kept the session-end checkpoint.
        let raw = std::fs::read_to_string(dir.path().join("checkpoints.jsonl")).unwrap();
        assert!(raw.contains("session_end"));
    }

    #[test]
    fn idle_sessions_listed() {
        let (_dir, reg) = registry();
        reg.admit("fresh", 8).unwrap();
        reg.admit("stale", 8).unwrap();
        reg.handle("stale")
            .unwrap()
            .with_state(|s| s.last_activity = Utc::now() - Duration::hours(3));

        let idle = reg.idle_sessions(Duration::hours(2));
        assert_eq!(idle, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn op_lock_blocks_concurrent_admissions() {
        let (_dir, reg) = registry();
        let (handle, _) = reg.admit("s1", 8).unwrap();

        let guard = handle.ops().await;
        // A second acquisition must wait until the guard drops.
        assert!(handle.op_lock.try_lock().is_err());
        drop(guard);
        assert!(handle.op_lock.try_lock().is_ok());
    }
}

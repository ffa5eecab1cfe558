//! Per-session mutable state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ring::CheckpointRing;

/// Escalation lifecycle for a session. The expiry instant exists exactly
/// when an escalation is active.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EscalationState {
    #[default]
    None,
    Active {
        trigger: String,
        additional_tools: BTreeSet<String>,
        expires_at: DateTime<Utc>,
    },
    PendingApproval {
        trigger: String,
        deadline: DateTime<Utc>,
    },
}

impl EscalationState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    /// Extra tools granted by an active escalation.
    pub fn additional_tools(&self) -> BTreeSet<String> {
        match self {
            Self::Active {
                additional_tools, ..
            } => additional_tools.clone(),
            _ => BTreeSet::new(),
        }
    }
}

/// Caller-supplied preferences captured at admission.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionPrefs {
    /// Overrides the role's auto-checkpoint interval for this session.
    #[serde(default)]
    pub auto_checkpoint_minutes: Option<u64>,
    /// Suppresses non-critical notifications in user-visible rollups.
    #[serde(default)]
    pub gentle_notifications: bool,
}

/// The authoritative state of one session. Mutated only under the
/// registry's per-session serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// `None` until the first role switch; no tools are mounted then.
    pub role: Option<String>,
    pub mounted_tools: BTreeSet<String>,
    pub checkpoints: CheckpointRing,
    pub escalation: EscalationState,
    /// In-flight call counts per tool.
    #[serde(skip)]
    pub in_flight: BTreeMap<String, u32>,
    /// Tools unmounted by a role switch while calls were still in flight;
    /// fully released once the last such call completes.
    #[serde(default)]
    pub deferred_release: BTreeSet<String>,
    #[serde(default)]
    pub prefs: SessionPrefs,
}

impl SessionState {
    pub fn new(session_id: String, ring_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            last_activity: now,
            role: None,
            mounted_tools: BTreeSet::new(),
            checkpoints: CheckpointRing::new(ring_capacity),
            escalation: EscalationState::None,
            in_flight: BTreeMap::new(),
            deferred_release: BTreeSet::new(),
            prefs: SessionPrefs::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn begin_call(&mut self, tool: &str) {
        *self.in_flight.entry(tool.to_string()).or_insert(0) += 1;
        self.touch();
    }

    /// Decrement the in-flight count for a tool. Returns true when this
    /// was the last in-flight call for a tool awaiting deferred release.
    pub fn finish_call(&mut self, tool: &str) -> bool {
        let remaining = match self.in_flight.get_mut(tool) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => return false,
        };
        if remaining == 0 {
            self.in_flight.remove(tool);
            if self.deferred_release.remove(tool) {
                return true;
            }
        }
        false
    }

    pub fn tool_in_flight(&self, tool: &str) -> bool {
        self.in_flight.get(tool).copied().unwrap_or(0) > 0
    }
}

//! Context checkpoints.
//!
//! A checkpoint is an immutable snapshot of a session's working context —
//! mental model, next steps, decisions, blockers. The broker stores and
//! replays them but never interprets the free-form fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Periodic automatic checkpoint on the role's interval.
    AutoPeriodic,
    /// Taken immediately before a role switch, capturing outgoing state.
    RoleSwitch,
    TaskComplete,
    ErrorRecovery,
    Manual,
    SessionEnd,
    ContextSwitch,
    BreakStart,
    BreakEnd,
}

impl CheckpointKind {
    /// Kinds that are additionally mirrored to durable storage.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::SessionEnd | Self::TaskComplete | Self::RoleSwitch
        )
    }
}

/// An immutable snapshot of session context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub kind: CheckpointKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Free-form description of where the user's head was at.
    #[serde(default)]
    pub mental_model: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    /// Optional self-reported energy tag (low / medium / high).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<String>,
    /// Optional self-reported focus tag (poor / fair / good / excellent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// The caller-supplied portion of a checkpoint; the registry stamps the
/// rest (timestamp, session, role).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointPayload {
    #[serde(default)]
    pub mental_model: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

impl Checkpoint {
    pub fn new(
        kind: CheckpointKind,
        session_id: impl Into<String>,
        role: Option<String>,
        payload: CheckpointPayload,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: session_id.into(),
            role,
            mental_model: payload.mental_model,
            next_steps: payload.next_steps,
            decisions: payload.decisions,
            blockers: payload.blockers,
            energy: payload.energy,
            focus: payload.focus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_kinds() {
        assert!(CheckpointKind::SessionEnd.is_durable());
        assert!(CheckpointKind::TaskComplete.is_durable());
        assert!(CheckpointKind::RoleSwitch.is_durable());
        assert!(!CheckpointKind::AutoPeriodic.is_durable());
        assert!(!CheckpointKind::BreakStart.is_durable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&CheckpointKind::AutoPeriodic).unwrap();
        assert_eq!(s, "\"auto_periodic\"");
    }
}

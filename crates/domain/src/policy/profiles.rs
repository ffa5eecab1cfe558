//! Role profiles from the `profiles` section of the policy document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cognitive-complexity tag attached to a role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Numeric level used for transition step checks (low=1 .. high=3).
    pub fn level(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Escalation priority for ranking and notification emphasis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPriority {
    #[default]
    Normal,
    High,
    Emergency,
}

/// One entry in a role's escalation menu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTriggerConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub additional_tools: Vec<String>,
    /// How long the escalation stays active once granted.
    #[serde(default = "d_max_duration")]
    pub max_duration_seconds: u64,
    /// Whether an external collaborator may grant this without the user
    /// asking.
    #[serde(default)]
    pub auto_trigger: bool,
    /// When set, a grant parks as pending-approval instead of activating.
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub priority: EscalationPriority,
}

fn d_max_duration() -> u64 {
    1800
}

/// A single role profile (`profiles.<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleProfile {
    pub description: String,
    pub default_tools: Vec<String>,
    pub token_budget: u64,
    #[serde(default)]
    pub escalation_triggers: BTreeMap<String, EscalationTriggerConfig>,

    /// Explicit complexity tag. When absent, derived from tool counts via
    /// `rules.complexity_buckets`.
    #[serde(default)]
    pub cognitive_complexity: Option<Complexity>,

    /// Roles reachable without escalation.
    #[serde(default)]
    pub natural_transitions: Vec<String>,
    /// Roles reachable through the escalation path.
    #[serde(default)]
    pub escalates_to: Vec<String>,

    #[serde(default = "d_session_minutes")]
    pub typical_session_minutes: u64,
    #[serde(default = "d_checkpoint_minutes")]
    pub auto_checkpoint_minutes: u64,
}

fn d_session_minutes() -> u64 {
    60
}

fn d_checkpoint_minutes() -> u64 {
    25
}

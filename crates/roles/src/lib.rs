//! Role registry — role-based tool access and transition legality.
//!
//! Answers three questions against a captured policy snapshot: does role X
//! grant tool T; is transition X → Y legal; which escalations are relevant
//! right now. Transitions accepted for a nameable reason (natural workflow,
//! escalation path, or a one-step complexity move) and denials carry the
//! vetoing rule so the caller can explain them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mm_domain::error::{Error, Result};
use mm_domain::policy::{
    Complexity, EscalationPriority, EscalationTriggerConfig, PolicySnapshot, RoleProfile,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transition rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The rule under which a transition was accepted. Every accepted
/// transition names exactly one of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionRule {
    /// `from` was null — first role assignment for the session.
    InitialAssignment,
    /// `from == to`.
    SameRole,
    /// `to` is in `from`'s natural-transition set.
    Natural,
    /// `to` is in `from`'s escalates-to set.
    EscalationPath,
    /// Cognitive-complexity difference of at most one step.
    ComplexityStep,
}

impl TransitionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialAssignment => "initial_assignment",
            Self::SameRole => "same_role",
            Self::Natural => "natural",
            Self::EscalationPath => "escalation_path",
            Self::ComplexityStep => "complexity_step",
        }
    }
}

/// A ranked escalation option, capped at three per query to keep the
/// decision surface small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationOption {
    pub trigger: String,
    pub description: String,
    pub additional_tools: Vec<String>,
    pub duration_minutes: u64,
    pub auto_trigger: bool,
    pub approval_required: bool,
    pub priority: EscalationPriority,
    /// Relevance score supplied by the caller's ranking.
    pub relevance: i64,
}

/// Full descriptor view of a role, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSummary {
    pub name: String,
    pub description: String,
    pub default_tools: Vec<String>,
    pub token_budget: u64,
    pub cognitive_complexity: Complexity,
    pub natural_transitions: Vec<String>,
    pub escalates_to: Vec<String>,
    pub escalation_triggers: Vec<String>,
    pub typical_session_minutes: u64,
    pub auto_checkpoint_minutes: u64,
    /// Every tool reachable through defaults plus escalations.
    pub all_possible_tools: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-only view over the roles of one policy snapshot.
pub struct RoleRegistry {
    snapshot: Arc<PolicySnapshot>,
}

impl RoleRegistry {
    pub fn new(snapshot: Arc<PolicySnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn validate_role_name(&self, name: &str) -> bool {
        self.snapshot.profiles.contains_key(name)
    }

    pub fn role(&self, name: &str) -> Result<&RoleProfile> {
        self.snapshot
            .profiles
            .get(name)
            .ok_or_else(|| Error::RoleNotFound(name.to_string()))
    }

    /// The role's default tool set.
    pub fn default_tools(&self, role: &str) -> Result<BTreeSet<String>> {
        Ok(self.role(role)?.default_tools.iter().cloned().collect())
    }

    /// Whether the role grants the tool by default.
    pub fn grants(&self, role: &str, tool: &str) -> Result<bool> {
        Ok(self.role(role)?.default_tools.iter().any(|t| t == tool))
    }

    /// Check transition legality. Returns the accepting rule, or
    /// `TransitionDenied` naming the veto.
    pub fn transition_legal(&self, from: Option<&str>, to: &str) -> Result<TransitionRule> {
        let to_profile = self.snapshot.profiles.get(to).ok_or_else(|| {
            Error::TransitionDenied {
                from: from.map(String::from),
                to: to.to_string(),
                reason: "unknown target role".into(),
            }
        })?;

        let Some(from_name) = from else {
            return Ok(TransitionRule::InitialAssignment);
        };
        if from_name == to {
            return Ok(TransitionRule::SameRole);
        }

        let from_profile = self.role(from_name)?;
        if from_profile.natural_transitions.iter().any(|r| r == to) {
            return Ok(TransitionRule::Natural);
        }
        if from_profile.escalates_to.iter().any(|r| r == to) {
            return Ok(TransitionRule::EscalationPath);
        }

        // A jump of more than one complexity step is too jarring.
        let from_level = self.snapshot.role_complexity(from_profile).level() as i8;
        let to_level = self.snapshot.role_complexity(to_profile).level() as i8;
        if to_level - from_level > 1 {
            tracing::warn!(
                from = from_name,
                to,
                from_level,
                to_level,
                "role transition blocked: complexity jump too high"
            );
            return Err(Error::TransitionDenied {
                from: Some(from_name.to_string()),
                to: to.to_string(),
                reason: "cognitive complexity jump exceeds one step".into(),
            });
        }

        Ok(TransitionRule::ComplexityStep)
    }

    /// Look up one escalation rule on a role's menu.
    pub fn escalation_rule<'a>(
        &'a self,
        role: &str,
        trigger: &str,
    ) -> Result<&'a EscalationTriggerConfig> {
        let profile = self.role(role)?;
        profile.escalation_triggers.get(trigger).ok_or_else(|| {
            Error::TransitionDenied {
                from: Some(role.to_string()),
                to: trigger.to_string(),
                reason: format!("escalation {trigger} is not on the {role} menu"),
            }
        })
    }

    /// Rank the role's escalation menu by the supplied relevance scores
    /// (computed by an external collaborator), dropping zero-relevance
    /// entries and capping the list at three.
    pub fn escalation_options(
        &self,
        role: &str,
        ranking: &[(String, i64)],
    ) -> Result<Vec<EscalationOption>> {
        let profile = self.role(role)?;

        let mut options: Vec<EscalationOption> = profile
            .escalation_triggers
            .iter()
            .filter_map(|(trigger, esc)| {
                let relevance = ranking
                    .iter()
                    .find(|(t, _)| t == trigger)
                    .map(|(_, score)| *score)
                    .unwrap_or(0);
                (relevance > 0).then(|| EscalationOption {
                    trigger: trigger.clone(),
                    description: esc.description.clone(),
                    additional_tools: esc.additional_tools.clone(),
                    duration_minutes: esc.max_duration_seconds / 60,
                    auto_trigger: esc.auto_trigger,
                    approval_required: esc.approval_required,
                    priority: esc.priority,
                    relevance,
                })
            })
            .collect();

        options.sort_by(|a, b| b.relevance.cmp(&a.relevance));
        options.truncate(3);
        Ok(options)
    }

    /// Full descriptor of a role.
    pub fn role_summary(&self, name: &str) -> Result<RoleSummary> {
        let profile = self.role(name)?;

        let mut all_tools: BTreeSet<String> = profile.default_tools.iter().cloned().collect();
        for esc in profile.escalation_triggers.values() {
            all_tools.extend(esc.additional_tools.iter().cloned());
        }

        Ok(RoleSummary {
            name: name.to_string(),
            description: profile.description.clone(),
            default_tools: profile.default_tools.clone(),
            token_budget: profile.token_budget,
            cognitive_complexity: self.snapshot.role_complexity(profile),
            natural_transitions: profile.natural_transitions.clone(),
            escalates_to: profile.escalates_to.clone(),
            escalation_triggers: profile.escalation_triggers.keys().cloned().collect(),
            typical_session_minutes: profile.typical_session_minutes,
            auto_checkpoint_minutes: profile.auto_checkpoint_minutes,
            all_possible_tools: all_tools.into_iter().collect(),
        })
    }

    pub fn snapshot(&self) -> &Arc<PolicySnapshot> {
        &self.snapshot
    }
}

//! Policy document, validation, and the snapshot store.
//!
//! The policy is a YAML document with top-level keys `broker`, `features`,
//! `rules`, `profiles`, and `servers`. A reload builds and validates a
//! complete new [`PolicySnapshot`] before publishing it with a single
//! pointer swap; in-flight requests keep the snapshot they captured.

mod profiles;
mod rules;
mod servers;

pub use profiles::*;
pub use rules::*;
pub use servers::*;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyDocument {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub profiles: BTreeMap<String, RoleProfile>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl PolicyDocument {
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).map_err(|e| Error::PolicyInvalid(e.to_string()))
    }
}

/// The `broker` section: identity, timeouts, and scheduler cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "d_name")]
    pub name: String,
    /// Directory for session files, ledger checkpoints, and the usage log.
    #[serde(default = "d_state_path")]
    pub state_path: std::path::PathBuf,

    /// Per-call deadline, overridable per server.
    #[serde(default = "d_tool_timeout")]
    pub tool_timeout_seconds: u64,
    /// Deadline for a complete role switch.
    #[serde(default = "d_role_switch_timeout")]
    pub role_switch_timeout_seconds: u64,
    /// Cadence of the background health pass.
    #[serde(default = "d_health_interval")]
    pub health_check_interval_seconds: u64,
    /// Sessions idle past this are garbage-collected.
    #[serde(default = "d_idle_hours")]
    pub session_idle_hours: u64,
    /// Maximum simultaneous in-flight calls per server.
    #[serde(default = "d_max_in_flight")]
    pub max_in_flight: usize,
    /// Bound of the per-session checkpoint ring.
    #[serde(default = "d_ring_size")]
    pub checkpoint_ring_size: usize,
    /// How long an approval-required escalation may stay pending.
    #[serde(default = "d_approval_deadline")]
    pub approval_deadline_seconds: u64,
    /// A breaker continuously open past this window triggers a full
    /// connection rebuild instead of waiting for more probes.
    #[serde(default = "d_breaker_rebuild")]
    pub breaker_rebuild_seconds: u64,
}

fn d_name() -> String {
    "metamcp-broker".into()
}

fn d_state_path() -> std::path::PathBuf {
    "./data".into()
}

fn d_tool_timeout() -> u64 {
    30
}

fn d_role_switch_timeout() -> u64 {
    5
}

fn d_health_interval() -> u64 {
    60
}

fn d_idle_hours() -> u64 {
    2
}

fn d_max_in_flight() -> usize {
    10
}

fn d_ring_size() -> usize {
    64
}

fn d_approval_deadline() -> u64 {
    300
}

fn d_breaker_rebuild() -> u64 {
    120
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: d_name(),
            state_path: d_state_path(),
            tool_timeout_seconds: d_tool_timeout(),
            role_switch_timeout_seconds: d_role_switch_timeout(),
            health_check_interval_seconds: d_health_interval(),
            session_idle_hours: d_idle_hours(),
            max_in_flight: d_max_in_flight(),
            checkpoint_ring_size: d_ring_size(),
            approval_deadline_seconds: d_approval_deadline(),
            breaker_rebuild_seconds: d_breaker_rebuild(),
        }
    }
}

impl BrokerConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn role_switch_timeout(&self) -> Duration {
        Duration::from_secs(self.role_switch_timeout_seconds)
    }
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Mount only the current role's tools (when off, every declared server
    /// is reachable from every session).
    #[serde(default = "d_true")]
    pub role_based_mounting: bool,
    /// Run the pre-invocation rewrite hooks.
    #[serde(default = "d_true")]
    pub budget_aware_hooks: bool,
    /// Periodic auto-checkpoints and pre-switch checkpoints.
    #[serde(default = "d_true")]
    pub auto_checkpoints: bool,
}

fn d_true() -> bool {
    true
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            role_based_mounting: true,
            budget_aware_hooks: true,
            auto_checkpoints: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a policy validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// A single policy validation issue.
#[derive(Debug, Clone)]
pub struct PolicyIssue {
    pub severity: IssueSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            IssueSeverity::Error => "ERROR",
            IssueSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl PolicyDocument {
    /// Validate the document and return every issue found (not just the
    /// first). A document with error-severity issues must not be published.
    pub fn validate(&self) -> Vec<PolicyIssue> {
        let mut issues = Vec::new();
        let err = |issues: &mut Vec<PolicyIssue>, field: &str, message: String| {
            issues.push(PolicyIssue {
                severity: IssueSeverity::Error,
                field: field.into(),
                message,
            });
        };
        let warn = |issues: &mut Vec<PolicyIssue>, field: &str, message: String| {
            issues.push(PolicyIssue {
                severity: IssueSeverity::Warning,
                field: field.into(),
                message,
            });
        };

        // Broker intervals must be positive.
        for (field, value) in [
            ("broker.tool_timeout_seconds", self.broker.tool_timeout_seconds),
            (
                "broker.role_switch_timeout_seconds",
                self.broker.role_switch_timeout_seconds,
            ),
            (
                "broker.health_check_interval_seconds",
                self.broker.health_check_interval_seconds,
            ),
            ("broker.session_idle_hours", self.broker.session_idle_hours),
        ] {
            if value == 0 {
                err(&mut issues, field, "must be greater than 0".into());
            }
        }
        if self.broker.max_in_flight == 0 {
            err(&mut issues, "broker.max_in_flight", "must be greater than 0".into());
        }
        if self.broker.checkpoint_ring_size == 0 {
            err(
                &mut issues,
                "broker.checkpoint_ring_size",
                "must be greater than 0".into(),
            );
        }

        // Warning fraction must leave room on both sides.
        let wf = self.rules.budgets.warning_fraction;
        if !(wf > 0.0 && wf < 1.0) {
            err(
                &mut issues,
                "rules.budgets.warning_fraction",
                format!("must be in (0, 1), got {wf}"),
            );
        }
        if self.rules.budgets.default_tokens > self.rules.budgets.hard_cap {
            err(
                &mut issues,
                "rules.budgets.default_tokens",
                "exceeds the hard cap".into(),
            );
        }

        // Server declarations.
        for (name, server) in &self.servers {
            let field = format!("servers.{name}");
            match server.transport {
                TransportKind::Stdio => {
                    if server.command.is_empty() {
                        err(&mut issues, &field, "stdio transport requires a command".into());
                    }
                }
                TransportKind::Http | TransportKind::Websocket => {
                    match &server.url {
                        None => err(
                            &mut issues,
                            &field,
                            format!("{} transport requires a url", server.transport.as_str()),
                        ),
                        Some(url)
                            if !url.starts_with("http://")
                                && !url.starts_with("https://")
                                && !url.starts_with("ws://")
                                && !url.starts_with("wss://") =>
                        {
                            err(&mut issues, &field, format!("url has no recognized scheme: {url}"))
                        }
                        Some(_) => {}
                    }
                }
            }
            if server.startup_timeout_seconds == 0 {
                err(
                    &mut issues,
                    &format!("{field}.startup_timeout_seconds"),
                    "must be greater than 0".into(),
                );
            }
        }

        // Role profiles.
        if self.profiles.is_empty() {
            warn(&mut issues, "profiles", "no roles declared".into());
        }
        for (role_name, profile) in &self.profiles {
            let field = format!("profiles.{role_name}");
            for tool in &profile.default_tools {
                if !self.servers.contains_key(tool) {
                    err(
                        &mut issues,
                        &format!("{field}.default_tools"),
                        format!("references undeclared tool server: {tool}"),
                    );
                }
            }
            if profile.token_budget > self.rules.budgets.hard_cap {
                err(
                    &mut issues,
                    &format!("{field}.token_budget"),
                    format!(
                        "{} exceeds the hard cap ({})",
                        profile.token_budget, self.rules.budgets.hard_cap
                    ),
                );
            }
            if profile.auto_checkpoint_minutes == 0 || profile.typical_session_minutes == 0 {
                err(
                    &mut issues,
                    &field,
                    "session and checkpoint intervals must be greater than 0".into(),
                );
            }
            for (trigger, esc) in &profile.escalation_triggers {
                let field = format!("{field}.escalation_triggers.{trigger}");
                if esc.max_duration_seconds == 0 {
                    err(&mut issues, &field, "max_duration_seconds must be greater than 0".into());
                }
                for tool in &esc.additional_tools {
                    if !self.servers.contains_key(tool) {
                        err(
                            &mut issues,
                            &field,
                            format!("references undeclared tool server: {tool}"),
                        );
                    }
                }
            }
            for (list_name, list) in [
                ("natural_transitions", &profile.natural_transitions),
                ("escalates_to", &profile.escalates_to),
            ] {
                for target in list {
                    if !self.profiles.contains_key(target) {
                        err(
                            &mut issues,
                            &format!("{field}.{list_name}"),
                            format!("references undeclared role: {target}"),
                        );
                    }
                }
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot & store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A validated, immutable view of the policy. Consumers hold an
/// `Arc<PolicySnapshot>` and keep reading it even while a reload publishes
/// a newer one.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub broker: BrokerConfig,
    pub features: FeaturesConfig,
    pub rules: RulesConfig,
    pub profiles: BTreeMap<String, RoleProfile>,
    pub servers: BTreeMap<String, ServerConfig>,
    /// Reload generation, starting at 1.
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    fn from_document(doc: PolicyDocument, generation: u64) -> Self {
        Self {
            broker: doc.broker,
            features: doc.features,
            rules: doc.rules,
            profiles: doc.profiles,
            servers: doc.servers,
            generation,
            loaded_at: Utc::now(),
        }
    }

    /// Derive the effective cognitive complexity for a role in this
    /// snapshot: the explicit tag if present, else tool-count bucketing.
    pub fn role_complexity(&self, profile: &RoleProfile) -> Complexity {
        if let Some(c) = profile.cognitive_complexity {
            return c;
        }
        let buckets = &self.rules.complexity_buckets;
        let count = profile.default_tools.len();
        if count <= buckets.low_max_tools {
            Complexity::Low
        } else if count >= buckets.high_min_tools {
            Complexity::High
        } else {
            Complexity::Medium
        }
    }
}

/// Process-wide holder of the current policy snapshot. Publication is a
/// pointer swap; `current()` never suspends.
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Build the store from an initial document. Fails on validation errors.
    pub fn new(doc: PolicyDocument) -> std::result::Result<Self, Vec<PolicyIssue>> {
        let snapshot = Self::build(doc, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Load the store from a YAML string.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let doc = PolicyDocument::from_yaml(source)?;
        Self::new(doc).map_err(|issues| Error::PolicyInvalid(join_issues(&issues)))
    }

    /// The current snapshot. Cheap (one `Arc` clone).
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Validate and atomically publish a new document. On failure the
    /// previous snapshot stays live and the issues are returned.
    pub fn reload(&self, doc: PolicyDocument) -> std::result::Result<Arc<PolicySnapshot>, Vec<PolicyIssue>> {
        let generation = self.current.read().generation + 1;
        let snapshot = Arc::new(Self::build(doc, generation)?);
        *self.current.write() = snapshot.clone();
        tracing::info!(generation, "policy snapshot published");
        Ok(snapshot)
    }

    /// Reload from a YAML string.
    pub fn reload_yaml(&self, source: &str) -> Result<Arc<PolicySnapshot>> {
        let doc = PolicyDocument::from_yaml(source)?;
        self.reload(doc)
            .map_err(|issues| Error::PolicyInvalid(join_issues(&issues)))
    }

    fn build(doc: PolicyDocument, generation: u64) -> std::result::Result<PolicySnapshot, Vec<PolicyIssue>> {
        let issues = doc.validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .cloned()
            .collect();
        for issue in issues.iter().filter(|i| i.severity == IssueSeverity::Warning) {
            tracing::warn!("policy: {issue}");
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(PolicySnapshot::from_document(doc, generation))
    }
}

fn join_issues(issues: &[PolicyIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

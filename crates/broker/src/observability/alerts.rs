//! Alert engine with cooldown-based de-duplication and a gentle rollup.
//!
//! An alert id fires again only once its previous instance is resolved or
//! older than the cooldown. User-visible rollups are capped at three
//! alerts, with higher severities displacing lower ones.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// How many alerts a user-visible rollup may carry.
const ROLLUP_CAP: usize = 3;

pub struct AlertEngine {
    alerts: Mutex<HashMap<String, Alert>>,
    cooldown: Duration,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl AlertEngine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            alerts: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// Raise an alert. Returns false when suppressed because the previous
    /// instance of the same id is unresolved and inside the cooldown.
    pub fn raise(
        &self,
        id: &str,
        severity: AlertSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> bool {
        let now = Utc::now();
        let mut alerts = self.alerts.lock();

        if let Some(existing) = alerts.get(id) {
            if !existing.resolved && now - existing.raised_at < self.cooldown {
                return false;
            }
        }

        let alert = Alert {
            id: id.to_string(),
            severity,
            title: title.into(),
            description: description.into(),
            raised_at: now,
            resolved: false,
            resolved_at: None,
        };
        tracing::warn!(
            alert_id = id,
            severity = severity.as_str(),
            title = %alert.title,
            "alert raised"
        );
        alerts.insert(id.to_string(), alert);
        true
    }

    pub fn resolve(&self, id: &str) -> bool {
        let mut alerts = self.alerts.lock();
        match alerts.get_mut(id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                tracing::info!(alert_id = id, "alert resolved");
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .alerts
            .lock()
            .values()
            .filter(|a| !a.resolved)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.raised_at.cmp(&a.raised_at))
        });
        active
    }

    /// The user-visible view: at most three alerts, most severe first.
    pub fn rollup(&self) -> Vec<Alert> {
        let mut active = self.active();
        active.truncate(ROLLUP_CAP);
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_cooldown_suppressed() {
        let engine = AlertEngine::default();
        assert!(engine.raise("server_health", AlertSeverity::Warning, "Degraded", "d"));
        assert!(!engine.raise("server_health", AlertSeverity::Warning, "Degraded", "d"));
    }

    #[test]
    fn resolved_alert_can_fire_again() {
        let engine = AlertEngine::default();
        assert!(engine.raise("error_rate", AlertSeverity::Error, "High errors", "d"));
        assert!(engine.resolve("error_rate"));
        assert!(engine.raise("error_rate", AlertSeverity::Error, "High errors", "d"));
    }

    #[test]
    fn stale_unresolved_alert_fires_again() {
        let engine = AlertEngine::new(Duration::seconds(0));
        assert!(engine.raise("x", AlertSeverity::Info, "t", "d"));
        assert!(engine.raise("x", AlertSeverity::Info, "t", "d"));
    }

    #[test]
    fn rollup_caps_at_three_by_severity() {
        let engine = AlertEngine::default();
        engine.raise("a", AlertSeverity::Info, "a", "");
        engine.raise("b", AlertSeverity::Warning, "b", "");
        engine.raise("c", AlertSeverity::Error, "c", "");
        engine.raise("d", AlertSeverity::Critical, "d", "");

        let rollup = engine.rollup();
        assert_eq!(rollup.len(), 3);
        assert_eq!(rollup[0].severity, AlertSeverity::Critical);
        // The info alert was displaced.
        assert!(rollup.iter().all(|a| a.severity != AlertSeverity::Info));
    }

    #[test]
    fn resolve_unknown_is_false() {
        let engine = AlertEngine::default();
        assert!(!engine.resolve("nope"));
    }
}

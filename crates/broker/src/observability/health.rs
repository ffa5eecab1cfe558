//! Broker-level health rollup.

use serde::{Deserialize, Serialize};

use mm_transport::ServerStats;

use super::{Alert, MetricsSummary};

/// Broker operational status, derived from the server health fraction and
/// fatal init state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

impl BrokerStatus {
    /// Classify a healthy-server fraction. `fatal_init` pins the status to
    /// failed regardless of the fraction.
    pub fn from_health(overall: f64, fatal_init: bool) -> Self {
        if fatal_init {
            Self::Failed
        } else if overall > 0.9 {
            Self::Ready
        } else if overall > 0.5 {
            Self::Degraded
        } else {
            Self::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// The full health payload returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: BrokerStatus,
    /// Healthy fraction of non-excluded servers.
    pub overall_health: f64,
    pub active_sessions: usize,
    pub servers: Vec<ServerStats>,
    pub alerts: Vec<Alert>,
    pub metrics: MetricsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bands() {
        assert_eq!(BrokerStatus::from_health(1.0, false), BrokerStatus::Ready);
        assert_eq!(BrokerStatus::from_health(0.91, false), BrokerStatus::Ready);
        assert_eq!(BrokerStatus::from_health(0.9, false), BrokerStatus::Degraded);
        assert_eq!(BrokerStatus::from_health(0.51, false), BrokerStatus::Degraded);
        assert_eq!(BrokerStatus::from_health(0.5, false), BrokerStatus::Failed);
        assert_eq!(BrokerStatus::from_health(1.0, true), BrokerStatus::Failed);
    }
}

//! Metrics, alerting, and the broker health rollup.

mod alerts;
mod health;
mod metrics;

pub use alerts::{Alert, AlertEngine, AlertSeverity};
pub use health::{BrokerStatus, HealthReport};
pub use metrics::{HistogramSummary, MetricsCollector, MetricsSummary};

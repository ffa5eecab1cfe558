//! Metrics collection: counters, gauges, and bounded histograms, with a
//! Prometheus text exposition renderer.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Sorted label set; part of the metric identity.
type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Labels,
}

fn key(name: &str, labels: &[(&str, &str)]) -> MetricKey {
    MetricKey {
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Histogram samples are windowed; count and sum run unbounded.
const HISTOGRAM_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    window: VecDeque<f64>,
}

impl Histogram {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.window.len() == HISTOGRAM_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let index = ((p / 100.0) * sorted.len() as f64) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            avg: if self.count == 0 {
                0.0
            } else {
                self.sum / self.count as f64
            },
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

pub struct MetricsCollector {
    started_at: DateTime<Utc>,
    counters: Mutex<BTreeMap<MetricKey, f64>>,
    gauges: Mutex<BTreeMap<MetricKey, f64>>,
    histograms: Mutex<BTreeMap<MetricKey, Histogram>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
            histograms: Mutex::new(BTreeMap::new()),
        }
    }

    // ── Raw recorders ─────────────────────────────────────────────────

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        *self.counters.lock().entry(key(name, labels)).or_insert(0.0) += value;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.lock().insert(key(name, labels), value);
    }

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .lock()
            .entry(key(name, labels))
            .or_default()
            .record(value);
    }

    // ── Domain recorders ──────────────────────────────────────────────

    pub fn record_startup(&self) {
        self.inc_counter("metamcp_startups_total", &[], 1.0);
    }

    pub fn record_tool_call(
        &self,
        role: &str,
        tool: &str,
        method: &str,
        elapsed_ms: f64,
        tokens: u64,
        optimizations: usize,
    ) {
        let labels: &[(&str, &str)] = &[("role", role), ("tool", tool), ("method", method)];
        self.inc_counter("metamcp_tool_calls_total", labels, 1.0);
        self.observe("metamcp_tool_call_duration_ms", labels, elapsed_ms);
        self.inc_counter("metamcp_tokens_used_total", labels, tokens as f64);
        self.observe("metamcp_tokens_per_call", labels, tokens as f64);
        if optimizations > 0 {
            self.inc_counter(
                "metamcp_optimizations_applied_total",
                labels,
                optimizations as f64,
            );
        }
    }

    pub fn record_tool_call_failure(&self, tool: &str, method: &str, error_kind: &str) {
        self.inc_counter(
            "metamcp_tool_call_errors_total",
            &[("tool", tool), ("method", method), ("error_kind", error_kind)],
            1.0,
        );
    }

    pub fn record_optimization(&self, tool: &str, kind: &str, savings: u64) {
        self.inc_counter(
            "metamcp_optimizations_total",
            &[("tool", tool), ("kind", kind)],
            1.0,
        );
        self.inc_counter(
            "metamcp_tokens_saved_total",
            &[("tool", tool), ("kind", kind)],
            savings as f64,
        );
    }

    pub fn record_role_switch(&self, from: Option<&str>, to: &str, elapsed_ms: f64) {
        let from = from.unwrap_or("none");
        let labels: &[(&str, &str)] = &[("from_role", from), ("to_role", to)];
        self.inc_counter("metamcp_role_switches_total", labels, 1.0);
        self.observe("metamcp_role_switch_duration_ms", labels, elapsed_ms);
    }

    pub fn record_role_switch_failure(&self, to: &str, error_kind: &str) {
        self.inc_counter(
            "metamcp_role_switch_errors_total",
            &[("to_role", to), ("error_kind", error_kind)],
            1.0,
        );
    }

    pub fn record_budget_band(&self, role: &str, band: &str) {
        let severity = match band {
            "critical" | "exceeded" => "critical",
            _ => "warning",
        };
        self.inc_counter(
            "metamcp_budget_warnings_total",
            &[("role", role), ("severity", severity)],
            1.0,
        );
    }

    pub fn set_session_usage(&self, session_id: &str, usage_fraction: f64) {
        self.set_gauge(
            "metamcp_budget_usage_percentage",
            &[("session", session_id)],
            usage_fraction * 100.0,
        );
    }

    pub fn record_server_health(&self, server: &str, healthy: bool, response_time_ms: f64) {
        self.set_gauge(
            "metamcp_server_health",
            &[("server", server)],
            if healthy { 1.0 } else { 0.0 },
        );
        self.observe(
            "metamcp_server_response_time_ms",
            &[("server", server)],
            response_time_ms,
        );
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.set_gauge("metamcp_active_sessions", &[], count as f64);
    }

    pub fn set_focus_sessions(&self, count: usize) {
        self.set_gauge("metamcp_focus_sessions_active", &[], count as f64);
    }

    // ── Views ─────────────────────────────────────────────────────────

    pub fn counter_total(&self, name: &str) -> f64 {
        self.counters
            .lock()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, v)| v)
            .sum()
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSummary> {
        self.histograms.lock().get(&key(name, labels)).map(Histogram::summary)
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            total_tool_calls: self.counter_total("metamcp_tool_calls_total") as u64,
            tool_call_errors: self.counter_total("metamcp_tool_call_errors_total") as u64,
            total_role_switches: self.counter_total("metamcp_role_switches_total") as u64,
            role_switch_errors: self.counter_total("metamcp_role_switch_errors_total") as u64,
            tokens_used: self.counter_total("metamcp_tokens_used_total") as u64,
            tokens_saved: self.counter_total("metamcp_tokens_saved_total") as u64,
            optimizations_applied: self.counter_total("metamcp_optimizations_total") as u64,
            budget_warnings: self.counter_total("metamcp_budget_warnings_total") as u64,
        }
    }

    /// Prometheus text exposition of everything collected.
    pub fn render_prometheus(&self) -> String {
        let mut lines = Vec::new();

        let help: &[(&str, &str, &str)] = &[
            ("metamcp_tool_calls_total", "counter", "Total tool calls"),
            ("metamcp_tool_call_errors_total", "counter", "Tool call failures"),
            ("metamcp_tokens_used_total", "counter", "Tokens consumed"),
            ("metamcp_tokens_saved_total", "counter", "Tokens saved by rewrites"),
            ("metamcp_role_switches_total", "counter", "Role switches"),
            ("metamcp_budget_warnings_total", "counter", "Budget band transitions"),
            ("metamcp_server_health", "gauge", "Server health (1 healthy, 0 unhealthy)"),
            ("metamcp_budget_usage_percentage", "gauge", "Per-session budget usage"),
            ("metamcp_tool_call_duration_ms", "histogram", "Tool call duration"),
        ];
        for (name, kind, text) in help {
            lines.push(format!("# HELP {name} {text}"));
            lines.push(format!("# TYPE {name} {kind}"));
        }

        for (k, v) in self.counters.lock().iter() {
            lines.push(format!("{}{} {v}", k.name, render_labels(&k.labels)));
        }
        for (k, v) in self.gauges.lock().iter() {
            lines.push(format!("{}{} {v}", k.name, render_labels(&k.labels)));
        }
        for (k, h) in self.histograms.lock().iter() {
            let labels = render_labels(&k.labels);
            lines.push(format!("{}_count{labels} {}", k.name, h.count));
            lines.push(format!("{}_sum{labels} {}", k.name, h.sum));
        }

        lines.join("\n")
    }
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{inner}}}")
}

/// Rolled-up totals for the health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    pub total_tool_calls: u64,
    pub tool_call_errors: u64,
    pub total_role_switches: u64,
    pub role_switch_errors: u64,
    pub tokens_used: u64,
    pub tokens_saved: u64,
    pub optimizations_applied: u64,
    pub budget_warnings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = MetricsCollector::new();
        m.record_tool_call("developer", "exa", "search", 12.0, 800, 1);
        m.record_tool_call("developer", "exa", "search", 20.0, 400, 0);
        m.record_tool_call("reviewer", "serena", "find_symbol", 5.0, 100, 0);

        assert_eq!(m.counter_total("metamcp_tool_calls_total"), 3.0);
        assert_eq!(m.counter_total("metamcp_tokens_used_total"), 1300.0);

        let hist = m
            .histogram_summary(
                "metamcp_tool_call_duration_ms",
                &[("role", "developer"), ("tool", "exa"), ("method", "search")],
            )
            .unwrap();
        assert_eq!(hist.count, 2);
        assert_eq!(hist.avg, 16.0);
    }

    #[test]
    fn prometheus_render_shape() {
        let m = MetricsCollector::new();
        m.record_tool_call("developer", "exa", "search", 12.0, 800, 0);
        m.record_server_health("exa", true, 4.2);

        let text = m.render_prometheus();
        assert!(text.contains("# TYPE metamcp_tool_calls_total counter"));
        assert!(text.contains(
            "metamcp_tool_calls_total{method=\"search\",role=\"developer\",tool=\"exa\"} 1"
        ));
        assert!(text.contains("metamcp_server_health{server=\"exa\"} 1"));
        assert!(text.contains("metamcp_tool_call_duration_ms_count"));
    }

    #[test]
    fn histogram_window_is_bounded_but_totals_run() {
        let m = MetricsCollector::new();
        for i in 0..1500 {
            m.observe("metamcp_tokens_per_call", &[], i as f64);
        }
        let h = m.histogram_summary("metamcp_tokens_per_call", &[]).unwrap();
        assert_eq!(h.count, 1500);
        // p50 computed over the last 1000 samples (500..1500).
        assert!(h.p50 >= 900.0);
    }

    #[test]
    fn percentiles_on_empty_histogram_are_zero() {
        let m = MetricsCollector::new();
        m.observe("metamcp_role_switch_duration_ms", &[], 10.0);
        let h = m
            .histogram_summary("metamcp_role_switch_duration_ms", &[])
            .unwrap();
        assert_eq!(h.p50, 10.0);
        assert!(m.histogram_summary("missing", &[]).is_none());
    }
}

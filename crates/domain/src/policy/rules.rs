//! The `rules` section of the policy document: budgets, rewrite trims, the
//! cost model, and tuning knobs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RulesConfig {
    #[serde(default)]
    pub budgets: BudgetRules,
    /// Per-tool rewrite directives, keyed by tool name.
    #[serde(default)]
    pub trims: BTreeMap<String, ToolTrimRules>,
    #[serde(default)]
    pub costs: CostRules,
    /// Tools treated as search-class by the budget projection: over-budget
    /// calls are admitted with guidance instead of denied (while `remaining`
    /// still covers the estimate).
    #[serde(default)]
    pub search_tools: BTreeSet<String>,
    #[serde(default)]
    pub complexity_buckets: ComplexityBuckets,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRules {
    /// Budget for roles that do not declare one.
    #[serde(default = "d_default_tokens")]
    pub default_tokens: u64,
    /// Global per-session ceiling independent of role.
    #[serde(default = "d_hard_cap")]
    pub hard_cap: u64,
    /// `warning_threshold = token_budget * warning_fraction`.
    #[serde(default = "d_warning_fraction")]
    pub warning_fraction: f64,
    /// Tokens held back for essential operations.
    #[serde(default = "d_emergency_reserve")]
    pub emergency_reserve: u64,
}

fn d_default_tokens() -> u64 {
    60_000
}

fn d_hard_cap() -> u64 {
    120_000
}

fn d_warning_fraction() -> f64 {
    0.8
}

fn d_emergency_reserve() -> u64 {
    10_000
}

impl Default for BudgetRules {
    fn default() -> Self {
        Self {
            default_tokens: d_default_tokens(),
            hard_cap: d_hard_cap(),
            warning_fraction: d_warning_fraction(),
            emergency_reserve: d_emergency_reserve(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rewrite trims
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trim directives for one tool. All fields are additive; an empty struct
/// means the tool passes through untouched (budget projection still runs).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolTrimRules {
    /// Numeric parameters clamped to a maximum.
    #[serde(default)]
    pub clamps: BTreeMap<String, i64>,
    /// Parameters filled in when the caller left them absent.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Minimum length for the `query` parameter. Violations produce a
    /// suggest-alternative with no argument change.
    #[serde(default)]
    pub min_query_length: Option<usize>,
    /// Parameters forced when the session's budget status is warning or
    /// worse (e.g. summaries instead of full text).
    #[serde(default)]
    pub summary_when_warning: BTreeMap<String, Value>,
    /// Method-specific directives layered on top of the tool-level ones.
    #[serde(default)]
    pub methods: BTreeMap<String, MethodTrimRules>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MethodTrimRules {
    #[serde(default)]
    pub clamps: BTreeMap<String, i64>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Heuristic token-cost model, used when no historical data exists for a
/// (tool, method). Externalized so the hand-tuned numbers can evolve
/// without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRules {
    /// Base cost for tools without an entry.
    #[serde(default = "d_default_base")]
    pub default_base: u64,
    /// Floor applied to every estimate.
    #[serde(default = "d_minimum")]
    pub minimum: u64,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolCost>,
}

fn d_default_base() -> u64 {
    500
}

fn d_minimum() -> u64 {
    50
}

impl Default for CostRules {
    fn default() -> Self {
        Self {
            default_base: d_default_base(),
            minimum: d_minimum(),
            tools: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCost {
    pub base: u64,
    /// Parameter-derived multipliers, applied multiplicatively.
    #[serde(default)]
    pub params: Vec<ParamCost>,
}

/// `multiplier = min(value / divisor, cap)` for a numeric parameter.
/// Absent or non-numeric parameters contribute no multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamCost {
    pub param: String,
    pub divisor: f64,
    pub cap: f64,
}

impl ToolCost {
    /// Apply the parameter multipliers to the base cost.
    pub fn estimate(&self, args: &BTreeMap<String, Value>) -> u64 {
        let mut multiplier = 1.0f64;
        for p in &self.params {
            if p.divisor <= 0.0 {
                continue;
            }
            if let Some(v) = args.get(&p.param).and_then(Value::as_f64) {
                multiplier *= (v / p.divisor).min(p.cap);
            }
        }
        (self.base as f64 * multiplier).round().max(0.0) as u64
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Complexity bucketing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-count buckets used to derive a role's cognitive complexity when the
/// profile does not pin it explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityBuckets {
    /// At most this many default tools → low.
    #[serde(default = "d_low_max")]
    pub low_max_tools: usize,
    /// At least this many default tools → high.
    #[serde(default = "d_high_min")]
    pub high_min_tools: usize,
}

fn d_low_max() -> usize {
    3
}

fn d_high_min() -> usize {
    6
}

impl Default for ComplexityBuckets {
    fn default() -> Self {
        Self {
            low_max_tools: d_low_max(),
            high_min_tools: d_high_min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_multiplier_scales_and_caps() {
        let cost = ToolCost {
            base: 1000,
            params: vec![ParamCost {
                param: "numResults".into(),
                divisor: 10.0,
                cap: 2.0,
            }],
        };

        let mut args = BTreeMap::new();
        args.insert("numResults".to_string(), json!(20));
        assert_eq!(cost.estimate(&args), 2000);

        // Cap at 2x even for huge values.
        args.insert("numResults".to_string(), json!(1000));
        assert_eq!(cost.estimate(&args), 2000);

        // Absent parameter leaves the base alone.
        args.clear();
        assert_eq!(cost.estimate(&args), 1000);
    }

    #[test]
    fn budget_defaults() {
        let b = BudgetRules::default();
        assert_eq!(b.default_tokens, 60_000);
        assert_eq!(b.hard_cap, 120_000);
        assert!((b.warning_fraction - 0.8).abs() < f64::EPSILON);
    }
}

//! Pre-invocation rewrite hooks.
//!
//! Given a tool call and session budget context, produce an optimized call
//! plus the list of optimizations applied. The engine only ever edits the
//! argument map; the tool and method pass through untouched. Rules come
//! entirely from the policy snapshot, so unknown tools route through with
//! nothing but the budget projection.
//!
//! Two properties hold for every call and every snapshot, and are enforced
//! by tests: rewriting is idempotent — a second pass returns the same call
//! and applies no further argument edits; the empty argument map produced
//! by a denial is a fixed point — and monotone in estimated cost (the
//! optimized call never costs more). Zero-length argument maps pass
//! through untouched: no clamps apply and no defaults are injected, only
//! the budget projection runs.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use mm_domain::call::{Optimization, OptimizationKind, ToolCallRequest};
use mm_domain::policy::{MethodTrimRules, PolicySnapshot, ToolTrimRules};
use mm_ledger::{BudgetBand, LedgerManager, LedgerSnapshot};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session context the engine needs: who is calling and how much budget
/// they have left.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub session_id: String,
    pub role: Option<String>,
    pub ledger: LedgerSnapshot,
}

/// Result of running the hook pipeline over one call.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    /// The optimized call. When `denied` is set the argument map is empty
    /// (the denial marker) and the call must not be dispatched.
    pub call: ToolCallRequest,
    pub optimizations: Vec<Optimization>,
    /// Projected token cost of the optimized call.
    pub estimate: u64,
    pub denied: bool,
}

/// Cost projection used by the budget step. Implemented by the ledger
/// manager; tests can substitute a fixed table.
pub trait CostEstimator: Send + Sync {
    fn estimate(
        &self,
        tool: &str,
        method: &str,
        args: &BTreeMap<String, Value>,
        policy: &PolicySnapshot,
    ) -> u64;
}

impl CostEstimator for LedgerManager {
    fn estimate(
        &self,
        tool: &str,
        method: &str,
        args: &BTreeMap<String, Value>,
        policy: &PolicySnapshot,
    ) -> u64 {
        LedgerManager::estimate(self, tool, method, args, policy)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RewriteEngine;

impl RewriteEngine {
    /// Run the full pipeline: policy trims → method rules → validity floor
    /// → budget projection (with one aggressive round).
    pub fn rewrite(
        call: &ToolCallRequest,
        ctx: &RewriteContext,
        policy: &PolicySnapshot,
        estimator: &dyn CostEstimator,
    ) -> RewriteOutcome {
        let original_estimate = estimator.estimate(&call.tool, &call.method, &call.args, policy);
        let original_fingerprint = call.fingerprint();

        let mut optimized = call.clone();
        let mut optimizations = Vec::new();

        let rules = policy.rules.trims.get(&call.tool);

        // A zero-length argument map passes through untouched: there is
        // nothing to clamp, and injecting defaults here would turn the
        // denial marker (an emptied map) into a fresh-looking call on a
        // second pass. Only the budget projection applies.
        let zero_input = call.args.is_empty();

        // Steps 1 + 2: tool-level and method-level trims.
        if let (false, Some(rules)) = (zero_input, rules) {
            let mut changed = Vec::new();
            apply_trims(&mut optimized.args, rules, &call.method, 1, &mut changed);

            if ctx.ledger.band >= BudgetBand::Warning {
                for (param, value) in &rules.summary_when_warning {
                    if optimized.args.get(param) != Some(value) {
                        optimized.args.insert(param.clone(), value.clone());
                        changed.push(param.clone());
                    }
                }
            }

            if !changed.is_empty() {
                changed.sort();
                changed.dedup();
                let estimate_now =
                    estimator.estimate(&optimized.tool, &optimized.method, &optimized.args, policy);
                optimizations.push(Optimization {
                    kind: OptimizationKind::TrimResults,
                    call_fingerprint: original_fingerprint.clone(),
                    estimated_savings: original_estimate.saturating_sub(estimate_now),
                    explanation: format!("constrained parameters: {}", changed.join(", ")),
                    user_message: Some(format!(
                        "Focused the call ({} parameter{} tightened)",
                        changed.len(),
                        if changed.len() == 1 { "" } else { "s" }
                    )),
                    timestamp: Utc::now(),
                });
            }

            // Step 3: minimum-input validity. The call is still admitted;
            // the caller decides whether to proceed with the short query.
            if let Some(min_len) = rules.min_query_length {
                let query_len = optimized
                    .args
                    .get("query")
                    .and_then(Value::as_str)
                    .map(str::len);
                if let Some(len) = query_len {
                    if len < min_len {
                        optimizations.push(Optimization {
                            kind: OptimizationKind::SuggestAlternative,
                            call_fingerprint: original_fingerprint.clone(),
                            estimated_savings: 0,
                            explanation: format!(
                                "query too short ({len} chars, minimum {min_len} recommended)"
                            ),
                            user_message: Some(format!(
                                "A more specific query (at least {min_len} characters) usually gives better results"
                            )),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        }

        // Step 4: budget projection.
        let mut estimate =
            estimator.estimate(&optimized.tool, &optimized.method, &optimized.args, policy);

        if estimate > ctx.ledger.available {
            // One additional round of aggressive trims: clamp caps halved.
            // Zero-length inputs stay untouched here too.
            if let (false, Some(rules)) = (zero_input, rules) {
                let before = optimized.args.clone();
                let mut changed = Vec::new();
                apply_trims(&mut optimized.args, rules, &call.method, 2, &mut changed);
                if optimized.args != before {
                    let aggressive_estimate = estimator.estimate(
                        &optimized.tool,
                        &optimized.method,
                        &optimized.args,
                        policy,
                    );
                    optimizations.push(Optimization {
                        kind: OptimizationKind::ReduceScope,
                        call_fingerprint: original_fingerprint.clone(),
                        estimated_savings: estimate.saturating_sub(aggressive_estimate),
                        explanation: format!(
                            "budget-driven scope reduction: {}",
                            changed.join(", ")
                        ),
                        user_message: Some(
                            "Tightened the call further to fit your remaining budget".into(),
                        ),
                        timestamp: Utc::now(),
                    });
                    estimate = aggressive_estimate;
                }
            }
        }

        let mut denied = false;
        if estimate > ctx.ledger.available {
            if policy.rules.search_tools.contains(&call.tool) {
                // Search-class tools are admitted with guidance.
                optimizations.push(Optimization {
                    kind: OptimizationKind::SuggestAlternative,
                    call_fingerprint: original_fingerprint.clone(),
                    estimated_savings: 0,
                    explanation: format!(
                        "projected cost {estimate} exceeds available budget {}",
                        ctx.ledger.available
                    ),
                    user_message: Some(
                        "This search is large for your remaining budget — fewer results or more specific terms would cost less".into(),
                    ),
                    timestamp: Utc::now(),
                });
            } else if estimate > ctx.ledger.remaining {
                optimizations.push(Optimization {
                    kind: OptimizationKind::DenyExpensive,
                    call_fingerprint: original_fingerprint.clone(),
                    estimated_savings: estimate,
                    explanation: format!(
                        "projected cost {estimate} exceeds remaining budget {}",
                        ctx.ledger.remaining
                    ),
                    user_message: Some(format!(
                        "This needs about {estimate} tokens but only {} remain. A role with a larger budget or a smaller request would work",
                        ctx.ledger.remaining
                    )),
                    timestamp: Utc::now(),
                });
                // The empty argument map is the denial marker.
                optimized.args.clear();
                denied = true;
            }
            // estimate <= remaining: admitted out of the reserve; the
            // orchestrator surfaces the using-reserve condition.
        }

        if !optimizations.is_empty() {
            tracing::info!(
                session_id = %ctx.session_id,
                tool = %call.tool,
                method = %call.method,
                count = optimizations.len(),
                denied,
                "rewrite hooks applied"
            );
        }

        RewriteOutcome {
            call: optimized,
            optimizations,
            estimate,
            denied,
        }
    }
}

/// Apply clamps and defaults from tool-level then method-level rules.
/// `divisor` of 1 is the normal pass; 2 is the aggressive pass (caps
/// halved, floor 1). Changed parameter names are appended to `changed`.
fn apply_trims(
    args: &mut BTreeMap<String, Value>,
    rules: &ToolTrimRules,
    method: &str,
    divisor: i64,
    changed: &mut Vec<String>,
) {
    apply_clamps(args, &rules.clamps, divisor, changed);
    apply_defaults(args, &rules.defaults, changed);
    if let Some(m) = rules.methods.get(method) {
        let MethodTrimRules { clamps, defaults } = m;
        apply_clamps(args, clamps, divisor, changed);
        apply_defaults(args, defaults, changed);
    }
}

fn apply_clamps(
    args: &mut BTreeMap<String, Value>,
    clamps: &BTreeMap<String, i64>,
    divisor: i64,
    changed: &mut Vec<String>,
) {
    for (param, cap) in clamps {
        let cap = (cap / divisor).max(1);
        if let Some(current) = args.get(param).and_then(Value::as_i64) {
            if current > cap {
                args.insert(param.clone(), Value::from(cap));
                changed.push(param.clone());
            }
        }
    }
}

fn apply_defaults(
    args: &mut BTreeMap<String, Value>,
    defaults: &BTreeMap<String, Value>,
    changed: &mut Vec<String>,
) {
    for (param, value) in defaults {
        if !args.contains_key(param) {
            args.insert(param.clone(), value.clone());
            changed.push(param.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_domain::policy::{PolicyDocument, PolicyStore};
    use mm_ledger::{JsonlUsageLog, LedgerManager};
    use serde_json::json;
    use std::sync::Arc;

    const POLICY: &str = r#"
rules:
  budgets:
    default_tokens: 60000
    hard_cap: 120000
    warning_fraction: 0.8
    emergency_reserve: 10000
  search_tools: [exa, claude-context]
  trims:
    task-master-ai:
      methods:
        list_tasks:
          clamps: { limit: 50 }
          defaults: { includeCompleted: false, maxDescriptionLength: 200 }
    exa:
      clamps: { numResults: 10 }
      min_query_length: 12
      summary_when_warning:
        includeText: false
        includeSummary: true
  costs:
    default_base: 500
    tools:
      task-master-ai:
        base: 800
        params:
          - { param: limit, divisor: 25.0, cap: 4.0 }
      exa:
        base: 1500
        params:
          - { param: numResults, divisor: 10.0, cap: 2.0 }
      zen:
        base: 2500
profiles:
  developer:
    description: dev
    default_tools: [task-master-ai, exa, zen]
    token_budget: 60000
servers:
  task-master-ai: { transport: stdio, command: task-master }
  exa: { transport: http, url: "https://exa.example.com" }
  zen: { transport: stdio, command: zen }
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<LedgerManager>,
        policy: Arc<PolicySnapshot>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(JsonlUsageLog::open(dir.path().join("usage.jsonl")).unwrap());
        let ledger = Arc::new(LedgerManager::new(log, dir.path()).unwrap());
        let store = PolicyStore::new(PolicyDocument::from_yaml(POLICY).unwrap()).unwrap();
        Fixture {
            _dir: dir,
            ledger,
            policy: store.current(),
        }
    }

    fn ctx(fixture: &Fixture, used: u64) -> RewriteContext {
        fixture.ledger.init_session("s1", Some("developer"), &fixture.policy);
        if used > 0 {
            // Burn budget under a tool name no test estimates against, so
            // the usage history stays out of the way.
            fixture
                .ledger
                .record("s1", used, "warmup", "burn", 0, false, 0)
                .unwrap();
        }
        RewriteContext {
            session_id: "s1".into(),
            role: Some("developer".into()),
            ledger: fixture.ledger.status("s1").unwrap(),
        }
    }

    fn call(tool: &str, method: &str, pairs: &[(&str, Value)]) -> ToolCallRequest {
        let args = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        ToolCallRequest::new("s1", tool, method, args)
    }

    #[test]
    fn list_tasks_trim_matches_policy() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        let c = call("task-master-ai", "list_tasks", &[("limit", json!(200))]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert_eq!(out.call.args["limit"], json!(50));
        assert_eq!(out.call.args["includeCompleted"], json!(false));
        assert_eq!(out.call.args["maxDescriptionLength"], json!(200));
        assert_eq!(out.optimizations.len(), 1);
        assert_eq!(out.optimizations[0].kind, OptimizationKind::TrimResults);
        assert!(out.optimizations[0].estimated_savings > 0);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        let c = call(
            "exa",
            "search",
            &[("query", json!("rust async runtimes compared")), ("numResults", json!(40))],
        );

        let once = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert_eq!(once.optimizations.len(), 1);

        // The second pass returns the same call and has nothing left to do.
        let twice = RewriteEngine::rewrite(&once.call, &ctx, &f.policy, f.ledger.as_ref());
        assert_eq!(once.call.args, twice.call.args);
        assert!(twice.optimizations.is_empty());
        assert_eq!(once.estimate, twice.estimate);
    }

    #[test]
    fn denied_call_marker_is_a_fixed_point() {
        let f = fixture();
        // remaining 700, available 0: list_tasks trims to 50, the
        // aggressive round halves to 25, and the 800-token projection
        // still exceeds what remains.
        let ctx = ctx(&f, 59_300);
        let c = call("task-master-ai", "list_tasks", &[("limit", json!(200))]);

        let once = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(once.denied);
        assert!(once.call.args.is_empty());
        assert!(once
            .optimizations
            .iter()
            .any(|o| o.kind == OptimizationKind::DenyExpensive));

        // Feeding the denial marker back in must not resurrect trims or
        // defaults: the empty map stays empty and only the denial recurs.
        let twice = RewriteEngine::rewrite(&once.call, &ctx, &f.policy, f.ledger.as_ref());
        assert!(twice.denied);
        assert!(twice.call.args.is_empty());
        let kinds: Vec<OptimizationKind> = twice.optimizations.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OptimizationKind::DenyExpensive]);

        // From here the outcome is stable pass over pass.
        let thrice = RewriteEngine::rewrite(&twice.call, &ctx, &f.policy, f.ledger.as_ref());
        assert_eq!(thrice.call.args, twice.call.args);
        assert_eq!(thrice.denied, twice.denied);
        assert_eq!(thrice.estimate, twice.estimate);
        assert_eq!(
            thrice.optimizations.iter().map(|o| o.kind).collect::<Vec<_>>(),
            kinds
        );
    }

    #[test]
    fn zero_length_args_pass_through_untouched() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        // list_tasks has default-injection rules, but a zero-length input
        // is left exactly as it arrived.
        let c = call("task-master-ai", "list_tasks", &[]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert!(out.call.args.is_empty());
        assert!(out.optimizations.is_empty());
    }

    #[test]
    fn rewrite_is_monotone_in_cost() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        let c = call(
            "exa",
            "search",
            &[("query", json!("tokio scheduler internals")), ("numResults", json!(100))],
        );

        let original = f.ledger.estimate("exa", "search", &c.args, &f.policy);
        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(out.estimate <= original);
    }

    #[test]
    fn short_query_suggests_without_changing_args() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        let c = call("exa", "search", &[("query", json!("rust"))]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert_eq!(out.call.args["query"], json!("rust"));
        assert!(out
            .optimizations
            .iter()
            .any(|o| o.kind == OptimizationKind::SuggestAlternative));
    }

    #[test]
    fn warning_band_forces_summary_projection() {
        let f = fixture();
        // 48k of 60k used -> warning band.
        let ctx = ctx(&f, 48_000);
        let c = call(
            "exa",
            "search",
            &[("query", json!("incremental compilation caching"))],
        );

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert_eq!(out.call.args["includeText"], json!(false));
        assert_eq!(out.call.args["includeSummary"], json!(true));
    }

    #[test]
    fn expensive_non_search_call_denied_with_empty_args() {
        let f = fixture();
        // 59k of 60k used: remaining 1000, available 0.
        let ctx = ctx(&f, 59_000);
        let c = call("zen", "consensus", &[("prompt", json!("compare these designs"))]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(out.denied);
        assert!(out.call.args.is_empty());
        assert!(out
            .optimizations
            .iter()
            .any(|o| o.kind == OptimizationKind::DenyExpensive));
    }

    #[test]
    fn over_available_but_within_remaining_admits_from_reserve() {
        let f = fixture();
        // 47k used: remaining 13000, available 3000; zen costs 2500 -> fits
        // available. Push usage so available < 2500 <= remaining.
        let ctx = ctx(&f, 48_000);
        // remaining 12000, available 2000; estimate 2500.
        let c = call("zen", "chat", &[("prompt", json!("short question"))]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert!(!out.call.args.is_empty());
    }

    #[test]
    fn search_tool_over_budget_admitted_with_suggestion() {
        let f = fixture();
        // Nearly exhausted: remaining 500, available 0.
        let ctx = ctx(&f, 59_500);
        let c = call(
            "exa",
            "search",
            &[("query", json!("extremely broad survey of everything")), ("numResults", json!(10))],
        );

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert!(out
            .optimizations
            .iter()
            .any(|o| o.kind == OptimizationKind::SuggestAlternative));
    }

    #[test]
    fn unknown_tool_passes_through_untouched() {
        let f = fixture();
        let ctx = ctx(&f, 0);
        let c = call("mystery-tool", "run", &[]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert!(out.call.args.is_empty());
        assert!(out.optimizations.is_empty());
    }

    #[test]
    fn aggressive_round_halves_clamps_when_over_budget() {
        let f = fixture();
        // 49_500 used: remaining 10_500, available 500. list_tasks at
        // limit=50 estimates 800*2=1600 > 500, aggressive clamps limit to
        // 25 -> 800*1=800, still > 500 but within remaining -> admitted.
        let ctx = ctx(&f, 49_500);
        let c = call("task-master-ai", "list_tasks", &[("limit", json!(200))]);

        let out = RewriteEngine::rewrite(&c, &ctx, &f.policy, f.ledger.as_ref());
        assert!(!out.denied);
        assert_eq!(out.call.args["limit"], json!(25));
        assert!(out
            .optimizations
            .iter()
            .any(|o| o.kind == OptimizationKind::ReduceScope));
    }
}

//! The broker: the single entry point for tool calls, role switches, and
//! escalations.
//!
//! The hot path is admission → rewrite → route → account. Admission runs
//! under the session's operation lock (so an in-flight role switch blocks
//! it); dispatch runs with every session lock released.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mm_domain::call::{CallError, Optimization, ToolCallRequest, ToolCallResponse};
use mm_domain::checkpoint::{Checkpoint, CheckpointKind, CheckpointPayload};
use mm_domain::error::{Error, Result};
use mm_domain::policy::{PolicySnapshot, PolicyStore};
use mm_hooks::{RewriteContext, RewriteEngine};
use mm_ledger::{BandEvent, LedgerManager, LedgerSnapshot, UsageAnalytics};
use mm_roles::{EscalationOption, RoleRegistry, TransitionRule};
use mm_sessions::{SessionPrefs, SessionRegistry, SessionView};
use mm_transport::TransportManager;

use crate::observability::{AlertEngine, AlertSeverity, BrokerStatus, HealthReport, MetricsCollector};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSwitchOutcome {
    pub previous_role: Option<String>,
    pub current_role: String,
    /// The rule that admitted the transition.
    pub rule: TransitionRule,
    pub mounted: BTreeSet<String>,
    pub mounted_added: Vec<String>,
    pub mounted_removed: Vec<String>,
    /// Removed tools kept alive until their in-flight calls complete.
    pub release_deferred: Vec<String>,
    pub duration_ms: u64,
    pub ledger: LedgerSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    Granted {
        trigger: String,
        additional_tools: Vec<String>,
        expires_at: chrono::DateTime<Utc>,
    },
    PendingApproval {
        trigger: String,
        deadline: chrono::DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session: SessionView,
    pub ledger: LedgerSnapshot,
    /// Seconds until exhaustion at the current burn rate.
    pub time_to_exhaustion_seconds: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Broker {
    policy: Arc<PolicyStore>,
    sessions: Arc<SessionRegistry>,
    ledger: Arc<LedgerManager>,
    transports: Arc<TransportManager>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertEngine>,
    status: RwLock<BrokerStatus>,
    fatal_init: AtomicBool,
}

impl Broker {
    pub fn new(
        policy: Arc<PolicyStore>,
        sessions: Arc<SessionRegistry>,
        ledger: Arc<LedgerManager>,
        transports: Arc<TransportManager>,
    ) -> Self {
        Self {
            policy,
            sessions,
            ledger,
            transports,
            metrics: Arc::new(MetricsCollector::new()),
            alerts: Arc::new(AlertEngine::default()),
            status: RwLock::new(BrokerStatus::Starting),
            fatal_init: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn ledger(&self) -> &Arc<LedgerManager> {
        &self.ledger
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    pub fn status(&self) -> BrokerStatus {
        *self.status.read()
    }

    // ── Startup / shutdown ────────────────────────────────────────────

    /// Bring up every declared server and publish the initial status.
    pub async fn start(&self) {
        let policy = self.policy.current();
        let started = self.transports.start_all(&policy).await;
        if started == 0 && !policy.servers.is_empty() {
            self.fatal_init.store(true, Ordering::SeqCst);
        }
        self.refresh_status();
        self.metrics.record_startup();
        tracing::info!(status = self.status().as_str(), "broker started");
    }

    /// Persist every live session and stop all servers.
    pub async fn shutdown(&self) {
        for id in self.sessions.active_ids() {
            let ledger = self.ledger.status(&id).ok();
            if let Err(e) = self.sessions.persist(&id, ledger.as_ref()) {
                tracing::warn!(session_id = %id, error = %e, "failed to persist session at shutdown");
            }
            let _ = self.ledger.checkpoint(&id);
        }
        self.transports.shutdown_all().await;
        *self.status.write() = BrokerStatus::Stopped;
        tracing::info!("broker stopped");
    }

    /// Recompute broker status from the server rollup.
    pub fn refresh_status(&self) {
        let overall = self.transports.overall_health();
        let status = BrokerStatus::from_health(overall, self.fatal_init.load(Ordering::SeqCst));
        *self.status.write() = status;
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Admit (or look up) a session. New sessions get a default-budget
    /// ledger until their first role switch.
    pub fn admit_session(&self, session_id: &str, prefs: SessionPrefs) -> Result<SessionView> {
        let policy = self.policy.current();
        let (handle, is_new) =
            self.sessions
                .admit(session_id, policy.broker.checkpoint_ring_size)?;
        if is_new {
            handle.with_state(|s| s.prefs = prefs);
            self.ledger.init_session(session_id, None, &policy);
            self.metrics.set_active_sessions(self.sessions.session_count());
        } else {
            self.sessions.touch(session_id)?;
        }
        Ok(handle.view())
    }

    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let view = self.sessions.handle(session_id)?.view();
        let ledger = self.ledger.status(session_id)?;
        let tte = ledger.time_to_exhaustion().map(|d| d.num_seconds());
        Ok(SessionStatus {
            session: view,
            ledger,
            time_to_exhaustion_seconds: tte,
        })
    }

    /// Close a session: final checkpoint, ledger checkpoint, removal.
    pub async fn close_session(&self, session_id: &str) -> Result<Checkpoint> {
        let handle = self.sessions.handle(session_id)?;
        let _ops = handle.ops().await;
        let checkpoint = self.sessions.close(session_id, CheckpointPayload::default())?;
        self.ledger.close_session(session_id)?;
        self.metrics.set_active_sessions(self.sessions.session_count());
        Ok(checkpoint)
    }

    pub fn checkpoint(
        &self,
        session_id: &str,
        kind: CheckpointKind,
        payload: CheckpointPayload,
    ) -> Result<Checkpoint> {
        self.sessions.checkpoint(session_id, kind, payload)
    }

    pub fn restore_checkpoint(&self, session_id: &str, index: Option<usize>) -> Result<Checkpoint> {
        self.sessions.touch(session_id)?;
        self.sessions.restore(session_id, index)
    }

    // ── Tool calls ────────────────────────────────────────────────────

    /// The hot path. Never panics across the boundary: every failure is
    /// folded into the response envelope.
    pub async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResponse {
        let started = std::time::Instant::now();
        let policy = self.policy.current();

        let (outcome, optimizations) = match self.call_tool_inner(&request, &policy).await {
            Ok((value, opts, tokens)) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                let role = self
                    .sessions
                    .handle(&request.session_id)
                    .ok()
                    .and_then(|h| h.view().role)
                    .unwrap_or_else(|| "none".into());
                self.metrics.record_tool_call(
                    &role,
                    &request.tool,
                    &request.method,
                    elapsed,
                    tokens,
                    opts.len(),
                );
                return ToolCallResponse {
                    ok: true,
                    result: Some(value),
                    error: None,
                    optimizations: opts,
                    tokens_used: tokens,
                    elapsed_ms: elapsed as u64,
                };
            }
            Err((error, opts)) => (error, opts),
        };

        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_tool_call_failure(&request.tool, &request.method, outcome.code());
        ToolCallResponse {
            ok: false,
            result: None,
            error: Some(CallError::from(&outcome)),
            optimizations,
            tokens_used: 0,
            elapsed_ms: elapsed as u64,
        }
    }

    async fn call_tool_inner(
        &self,
        request: &ToolCallRequest,
        policy: &Arc<PolicySnapshot>,
    ) -> std::result::Result<(Value, Vec<Optimization>, u64), (Error, Vec<Optimization>)> {
        let fail = |e: Error| (e, Vec::new());

        // Admission under the session's operation lock: an in-flight role
        // switch holds this lock, so new calls wait for it to finish.
        let handle = self.sessions.handle(&request.session_id).map_err(fail)?;
        {
            let _ops = handle.ops().await;
            self.sessions
                .admit_call(&request.session_id, &request.tool)
                .map_err(fail)?;
            // Fail fast on an open breaker before any budget work.
            if let Err(e) = self.transports.check_available(&request.tool) {
                self.sessions.finish_call(&request.session_id, &request.tool);
                return Err(fail(e));
            }
        }

        // Rewrite with the ledger's current view.
        let ledger_snap = match self.ledger.status(&request.session_id) {
            Ok(snap) => snap,
            Err(e) => {
                self.sessions.finish_call(&request.session_id, &request.tool);
                return Err(fail(e));
            }
        };

        let (call, optimizations, estimate) = if policy.features.budget_aware_hooks {
            let ctx = RewriteContext {
                session_id: request.session_id.clone(),
                role: ledger_snap.role.clone(),
                ledger: ledger_snap.clone(),
            };
            let out = RewriteEngine::rewrite(request, &ctx, policy, self.ledger.as_ref());
            for opt in &out.optimizations {
                self.metrics.record_optimization(
                    &request.tool,
                    opt.kind.as_str(),
                    opt.estimated_savings,
                );
            }
            if out.denied {
                self.sessions.finish_call(&request.session_id, &request.tool);
                return Err((
                    Error::BudgetExceeded {
                        required: out.estimate,
                        remaining: ledger_snap.remaining,
                    },
                    out.optimizations,
                ));
            }
            (out.call, out.optimizations, out.estimate)
        } else {
            let estimate =
                self.ledger
                    .estimate(&request.tool, &request.method, &request.args, policy);
            (request.clone(), Vec::new(), estimate)
        };

        // Dispatch with every session lock released.
        let params = Value::Object(
            call.args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let timeout = Duration::from_secs(policy.broker.tool_timeout_seconds);
        let dispatched = self
            .transports
            .call(&request.tool, &request.method, params, timeout)
            .await;
        self.sessions.finish_call(&request.session_id, &request.tool);

        match dispatched {
            Ok(value) => {
                let tokens = estimate_response_tokens(&value);
                let saved: u64 = optimizations.iter().map(|o| o.estimated_savings).sum();
                match self.ledger.record(
                    &request.session_id,
                    tokens,
                    &request.tool,
                    &request.method,
                    estimate,
                    !optimizations.is_empty(),
                    saved,
                ) {
                    Ok((snap, events)) => {
                        self.metrics
                            .set_session_usage(&request.session_id, snap.usage_fraction);
                        self.publish_band_events(&events);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to record usage");
                    }
                }
                Ok((value, optimizations, tokens))
            }
            Err(e) => Err((e, optimizations)),
        }
    }

    fn publish_band_events(&self, events: &[BandEvent]) {
        for event in events {
            let role = event.role.as_deref().unwrap_or("none");
            self.metrics.record_budget_band(role, event.band.as_str());
            let severity = match event.band {
                mm_ledger::BudgetBand::Critical | mm_ledger::BudgetBand::Exceeded => {
                    AlertSeverity::Critical
                }
                _ => AlertSeverity::Warning,
            };
            self.alerts.raise(
                &format!("budget_{}", event.session_id),
                severity,
                format!("Budget {}", event.band.as_str()),
                format!(
                    "Session {} is at {:.0}% of its token budget",
                    event.session_id,
                    event.usage_fraction * 100.0
                ),
            );
        }
    }

    // ── Role switching ────────────────────────────────────────────────

    /// Switch a session onto a new role: legality check, outgoing
    /// checkpoint, tool remounting, budget swap — all within the role
    /// switch deadline. On deadline the previous state is fully restored.
    pub async fn switch_role(&self, session_id: &str, new_role: &str) -> Result<RoleSwitchOutcome> {
        let started = std::time::Instant::now();
        let policy = self.policy.current();
        let roles = RoleRegistry::new(policy.clone());

        let handle = self.sessions.handle(session_id)?;
        // Held for the whole switch: blocks new call admissions.
        let _ops = handle.ops().await;

        let previous_role = handle.view().role;
        let rule = match roles.transition_legal(previous_role.as_deref(), new_role) {
            Ok(rule) => rule,
            Err(e) => {
                self.metrics.record_role_switch_failure(new_role, e.code());
                return Err(e);
            }
        };

        let backup = self.sessions.state_copy(session_id)?;
        let deadline = policy.broker.role_switch_timeout();

        let attempt = tokio::time::timeout(deadline, async {
            // Checkpoint the outgoing state before anything changes, so a
            // context restore is always possible.
            self.sessions
                .checkpoint(session_id, CheckpointKind::RoleSwitch, CheckpointPayload::default())?;

            let new_tools = roles.default_tools(new_role)?;

            // Warm up newly needed servers with the session locks free of
            // transport I/O. Failures are not fatal; calls to a server
            // that stays down fail with ServerUnavailable.
            let current = handle.view().mounted_tools;
            for tool in new_tools.difference(&current) {
                if !self.transports.ensure_ready(tool, &policy).await {
                    tracing::warn!(tool = %tool, "server not ready while mounting");
                }
            }

            let delta = self
                .sessions
                .apply_role_switch(session_id, new_role, new_tools)?;
            let (snap, events) = self.ledger.switch_role(session_id, new_role, &policy)?;
            Ok::<_, Error>((delta, snap, events))
        })
        .await;

        match attempt {
            Ok(Ok((delta, snap, events))) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.publish_band_events(&events);
                self.metrics
                    .record_role_switch(previous_role.as_deref(), new_role, duration_ms as f64);
                if let Err(e) = self.sessions.persist(session_id, Some(&snap)) {
                    tracing::warn!(error = %e, "failed to persist session after role switch");
                }
                tracing::info!(
                    session_id,
                    from = ?previous_role,
                    to = new_role,
                    duration_ms,
                    "role switch completed"
                );
                Ok(RoleSwitchOutcome {
                    previous_role,
                    current_role: new_role.to_string(),
                    rule,
                    mounted: delta.mounted,
                    mounted_added: delta.mounted_added,
                    mounted_removed: delta.mounted_removed,
                    release_deferred: delta.release_deferred,
                    duration_ms,
                    ledger: snap,
                })
            }
            Ok(Err(e)) => {
                self.sessions.restore_state(session_id, backup)?;
                self.metrics.record_role_switch_failure(new_role, e.code());
                Err(e)
            }
            Err(_) => {
                // Deadline: the session keeps its previous role and tools.
                self.sessions.restore_state(session_id, backup)?;
                self.metrics.record_role_switch_failure(new_role, "timeout");
                Err(Error::Timeout(format!(
                    "role switch to {new_role} exceeded {}s",
                    policy.broker.role_switch_timeout_seconds
                )))
            }
        }
    }

    // ── Escalations ───────────────────────────────────────────────────

    /// Request temporary access to tools beyond the role defaults.
    pub async fn request_escalation(
        &self,
        session_id: &str,
        trigger: &str,
    ) -> Result<EscalationOutcome> {
        let policy = self.policy.current();
        let roles = RoleRegistry::new(policy.clone());

        let handle = self.sessions.handle(session_id)?;
        let _ops = handle.ops().await;

        let role = handle.view().role.ok_or_else(|| Error::TransitionDenied {
            from: None,
            to: trigger.to_string(),
            reason: "session has no active role".into(),
        })?;

        let rule = roles.escalation_rule(&role, trigger)?;

        if rule.approval_required {
            let deadline =
                Utc::now() + chrono::Duration::seconds(policy.broker.approval_deadline_seconds as i64);
            self.sessions.pend_escalation(session_id, trigger, deadline)?;
            self.metrics.inc_counter(
                "metamcp_escalations_pending_total",
                &[("role", &role), ("trigger", trigger)],
                1.0,
            );
            return Ok(EscalationOutcome::PendingApproval {
                trigger: trigger.to_string(),
                deadline,
            });
        }

        let additional: BTreeSet<String> = rule.additional_tools.iter().cloned().collect();
        for tool in &additional {
            if !self.transports.ensure_ready(tool, &policy).await {
                tracing::warn!(tool = %tool, "server not ready while granting escalation");
            }
        }

        let expires_at =
            Utc::now() + chrono::Duration::seconds(rule.max_duration_seconds as i64);
        self.sessions
            .grant_escalation(session_id, trigger, additional.clone(), expires_at)?;
        self.metrics.inc_counter(
            "metamcp_escalations_granted_total",
            &[("role", &role), ("trigger", trigger)],
            1.0,
        );

        Ok(EscalationOutcome::Granted {
            trigger: trigger.to_string(),
            additional_tools: additional.into_iter().collect(),
            expires_at,
        })
    }

    /// Rank the current role's escalation menu against an externally
    /// computed relevance ranking.
    pub fn escalation_options(
        &self,
        session_id: &str,
        ranking: &[(String, i64)],
    ) -> Result<Vec<EscalationOption>> {
        let policy = self.policy.current();
        let roles = RoleRegistry::new(policy);
        let role = self
            .sessions
            .handle(session_id)?
            .view()
            .role
            .ok_or_else(|| Error::RoleNotFound("none".into()))?;
        roles.escalation_options(&role, ranking)
    }

    /// Expire every escalation (and lapsed approval) whose time has
    /// passed. Called by the background sweep. Returns the number of
    /// active escalations expired.
    pub fn expire_due_escalations(&self) -> usize {
        let policy = self.policy.current();
        let roles = RoleRegistry::new(policy);
        let mut expired = 0usize;

        for session_id in self.sessions.expired_escalations(Utc::now()) {
            let role = match self.sessions.handle(&session_id) {
                Ok(h) => h.view().role,
                Err(_) => continue,
            };
            let defaults = role
                .as_deref()
                .and_then(|r| roles.default_tools(r).ok())
                .unwrap_or_default();
            match self.sessions.expire_escalation(&session_id, &defaults) {
                Ok(true) => {
                    expired += 1;
                    self.metrics
                        .inc_counter("metamcp_escalations_expired_total", &[], 1.0);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "escalation expiry failed");
                }
            }
        }
        expired
    }

    // ── Policy & health ───────────────────────────────────────────────

    /// Atomically reload the policy from a YAML document. In-flight
    /// requests keep the snapshot they captured.
    pub fn reload_policy(&self, source: &str) -> Result<u64> {
        let snapshot = self.policy.reload_yaml(source)?;
        self.transports.set_max_in_flight(snapshot.broker.max_in_flight);
        Ok(snapshot.generation)
    }

    pub fn broker_health(&self) -> HealthReport {
        let overall = self.transports.overall_health();

        if overall <= 0.5 {
            self.alerts.raise(
                "server_health",
                AlertSeverity::Critical,
                "Multiple server failures",
                format!("Server health is {:.0}%", overall * 100.0),
            );
        } else if overall <= 0.8 {
            self.alerts.raise(
                "server_health",
                AlertSeverity::Warning,
                "Server health degraded",
                format!("Server health is {:.0}%", overall * 100.0),
            );
        } else {
            self.alerts.resolve("server_health");
        }

        self.refresh_status();
        HealthReport {
            status: self.status(),
            overall_health: overall,
            active_sessions: self.sessions.session_count(),
            servers: self.transports.server_stats(),
            alerts: self.alerts.rollup(),
            metrics: self.metrics.summary(),
        }
    }

    pub fn usage_analytics(
        &self,
        session_id: Option<&str>,
        role: Option<&str>,
        days: i64,
    ) -> UsageAnalytics {
        self.ledger.usage_analytics(session_id, role, days)
    }

    // ── Recovery ──────────────────────────────────────────────────────

    /// Rebuild state after a restart: recover ledgers, scan the session
    /// store, and make sure every recovered session has a ledger.
    pub fn recover(&self, recovered_sessions: Vec<mm_sessions::PersistedSession>) -> usize {
        let policy = self.policy.current();
        if let Err(e) = self.ledger.recover() {
            tracing::warn!(error = %e, "ledger recovery failed");
        }

        let roles: Vec<(String, Option<String>)> = recovered_sessions
            .iter()
            .map(|p| (p.session.session_id.clone(), p.session.role.clone()))
            .collect();
        let count = self.sessions.recover(recovered_sessions);

        for (session_id, role) in roles {
            if self.ledger.status(&session_id).is_err() {
                self.ledger
                    .init_session(&session_id, role.as_deref(), &policy);
            }
        }
        self.metrics.set_active_sessions(self.sessions.session_count());
        count
    }
}

/// Byte-length heuristic for tokens consumed by a response.
fn estimate_response_tokens(value: &Value) -> u64 {
    match serde_json::to_string(value) {
        Ok(s) => ((s.len() / 4) as u64).max(1),
        Err(_) => 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mm_domain::policy::{PolicyDocument, ServerConfig};
    use mm_ledger::JsonlUsageLog;
    use mm_sessions::SessionStore;
    use mm_transport::{Transport, TransportFault};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    const POLICY: &str = r#"
broker:
  tool_timeout_seconds: 5
  role_switch_timeout_seconds: 5
rules:
  budgets:
    default_tokens: 10000
    hard_cap: 120000
    warning_fraction: 0.8
    emergency_reserve: 1000
  search_tools: [exa]
  trims:
    task-master-ai:
      methods:
        list_tasks:
          clamps: { limit: 50 }
          defaults: { includeCompleted: false, maxDescriptionLength: 200 }
  costs:
    default_base: 500
    tools:
      expensive: { base: 501 }
      task-master-ai:
        base: 800
        params:
          - { param: limit, divisor: 25.0, cap: 4.0 }
profiles:
  developer:
    description: dev
    default_tools: [task-master-ai, serena, expensive]
    token_budget: 60000
    natural_transitions: [researcher]
    escalation_triggers:
      test_failure:
        description: debugging tools
        additional_tools: [zen]
        max_duration_seconds: 1800
      ui_testing:
        description: browser tools
        additional_tools: [zen]
        max_duration_seconds: 900
        approval_required: true
  researcher:
    description: research
    default_tools: [exa]
    token_budget: 40000
    natural_transitions: [developer]
servers:
  task-master-ai: { transport: stdio, command: task-master }
  serena: { transport: stdio, command: serena }
  exa: { transport: http, url: "https://exa.example.com" }
  zen: { transport: stdio, command: zen }
  expensive: { transport: stdio, command: expensive }
"#;

    /// Counts calls; parks when `park` is set.
    struct FakeTransport {
        calls: AtomicU32,
        park: Option<Arc<tokio::sync::Notify>>,
    }

    impl FakeTransport {
        fn counting() -> Self {
            Self {
                calls: AtomicU32::new(0),
                park: None,
            }
        }

        fn parked(notify: Arc<tokio::sync::Notify>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                park: Some(notify),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn call(
            &self,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> std::result::Result<Value, TransportFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(park) = &self.park {
                park.notified().await;
            }
            Ok(json!({"ok": true}))
        }

        async fn health_check(&self, _t: Duration) -> std::result::Result<(), TransportFault> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    fn server_config() -> ServerConfig {
        serde_yaml::from_str("transport: stdio\ncommand: fake").unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: Broker,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let policy =
            Arc::new(PolicyStore::new(PolicyDocument::from_yaml(POLICY).unwrap()).unwrap());
        let log = Arc::new(JsonlUsageLog::open(dir.path().join("usage.jsonl")).unwrap());
        let ledger = Arc::new(LedgerManager::new(log, dir.path()).unwrap());
        let store = Arc::new(SessionStore::new(dir.path()).unwrap());
        let sessions = Arc::new(SessionRegistry::new(store));
        let transports = Arc::new(TransportManager::new(10));

        for name in ["task-master-ai", "serena", "exa", "zen", "expensive"] {
            transports.register(name, server_config(), Box::new(FakeTransport::counting()));
        }

        Fixture {
            _dir: dir,
            broker: Broker::new(policy, sessions, ledger, transports),
        }
    }

    fn request(session: &str, tool: &str, method: &str, args: &[(&str, Value)]) -> ToolCallRequest {
        let args: BTreeMap<String, Value> =
            args.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        ToolCallRequest::new(session, tool, method, args)
    }

    #[tokio::test]
    async fn unknown_session_rejected() {
        let f = fixture();
        let resp = f.broker.call_tool(request("ghost", "exa", "search", &[])).await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "no_such_session");
    }

    #[tokio::test]
    async fn unmounted_tool_is_access_denied() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let resp = f.broker.call_tool(request("s1", "exa", "search", &[])).await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "access_denied");
    }

    #[tokio::test]
    async fn successful_call_records_usage() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let resp = f
            .broker
            .call_tool(request("s1", "serena", "find_symbol", &[("name", json!("main"))]))
            .await;
        assert!(resp.ok);
        assert!(resp.tokens_used > 0);

        let status = f.broker.session_status("s1").unwrap();
        assert_eq!(status.ledger.used, resp.tokens_used);
    }

    #[tokio::test]
    async fn budget_edge_denial_never_reaches_transport() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        // Burn the budget down to exactly 500 remaining tokens.
        f.broker
            .ledger()
            .record("s1", 59_500, "warmup", "burn", 0, false, 0)
            .unwrap();
        let status = f.broker.session_status("s1").unwrap();
        assert_eq!(status.ledger.remaining, 500);

        // `expensive` projects 501 tokens and is not search-class.
        let resp = f
            .broker
            .call_tool(request("s1", "expensive", "run", &[]))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error.as_ref().unwrap().code, "budget_exceeded");
        assert!(resp
            .optimizations
            .iter()
            .any(|o| o.kind == mm_domain::call::OptimizationKind::DenyExpensive));

        // No transport dispatch happened.
        let conn = f.broker.transports().connection("expensive").unwrap();
        assert_eq!(conn.stats().call_count, 0);
    }

    #[tokio::test]
    async fn call_admitted_at_exact_remaining_succeeds() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        // remaining = 501 = the projected estimate for `expensive`; the
        // call dips into the reserve but is admitted.
        f.broker
            .ledger()
            .record("s1", 59_499, "warmup", "burn", 0, false, 0)
            .unwrap();

        let resp = f
            .broker
            .call_tool(request("s1", "expensive", "run", &[]))
            .await;
        assert!(resp.ok);
        let conn = f.broker.transports().connection("expensive").unwrap();
        assert_eq!(conn.stats().call_count, 1);
    }

    #[tokio::test]
    async fn list_tasks_rewrite_applies_on_the_wire() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let resp = f
            .broker
            .call_tool(request("s1", "task-master-ai", "list_tasks", &[("limit", json!(200))]))
            .await;
        assert!(resp.ok);
        assert_eq!(resp.optimizations.len(), 1);
        assert!(resp.optimizations[0].estimated_savings > 0);
    }

    #[tokio::test]
    async fn role_switch_outcome_and_checkpoint() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();

        let outcome = f.broker.switch_role("s1", "developer").await.unwrap();
        assert_eq!(outcome.rule, TransitionRule::InitialAssignment);
        assert!(outcome.mounted.contains("task-master-ai"));
        assert_eq!(outcome.ledger.total_budget, 60_000);

        // The pre-switch checkpoint exists and records the outgoing state.
        let cp = f.broker.restore_checkpoint("s1", Some(0)).unwrap();
        assert_eq!(cp.kind, CheckpointKind::RoleSwitch);
        assert_eq!(cp.role, None);

        let outcome = f.broker.switch_role("s1", "researcher").await.unwrap();
        assert_eq!(outcome.rule, TransitionRule::Natural);
        assert_eq!(outcome.previous_role.as_deref(), Some("developer"));
        assert!(outcome.mounted_removed.contains(&"serena".to_string()));
        assert_eq!(outcome.ledger.total_budget, 40_000);
        // Usage was preserved across the budget swap.
        assert_eq!(outcome.ledger.used, 0);
    }

    #[tokio::test]
    async fn role_switch_with_in_flight_call_defers_release() {
        let f = fixture();
        let notify = Arc::new(tokio::sync::Notify::new());
        // serena parks until released.
        f.broker.transports().register(
            "serena",
            server_config(),
            Box::new(FakeTransport::parked(notify.clone())),
        );

        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let broker = Arc::new(f.broker);
        let b2 = broker.clone();
        let in_flight = tokio::spawn(async move {
            b2.call_tool(request("s1", "serena", "find_symbol", &[])).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Switch away while the serena call is still running.
        let outcome = broker.switch_role("s1", "researcher").await.unwrap();
        assert_eq!(outcome.release_deferred, vec!["serena".to_string()]);

        // New admissions of serena fail immediately.
        let resp = broker.call_tool(request("s1", "serena", "find_symbol", &[])).await;
        assert_eq!(resp.error.unwrap().code, "access_denied");

        // The in-flight call still completes and delivers its result.
        notify.notify_one();
        let resp = in_flight.await.unwrap();
        assert!(resp.ok);
    }

    #[tokio::test]
    async fn natural_switch_round_trip_restores_default_tools() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        // Pick up extra tools via escalation, then bounce through
        // researcher and back: the developer default set returns exactly,
        // with the escalation not re-applied.
        f.broker.request_escalation("s1", "test_failure").await.unwrap();
        f.broker.switch_role("s1", "researcher").await.unwrap();
        let outcome = f.broker.switch_role("s1", "developer").await.unwrap();

        let expected: BTreeSet<String> = ["expensive", "serena", "task-master-ai"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(outcome.mounted, expected);
        let view = f.broker.sessions().handle("s1").unwrap().view();
        assert!(!view.escalation.is_active());
    }

    #[tokio::test]
    async fn escalation_grant_then_expiry_restores_defaults() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let outcome = f.broker.request_escalation("s1", "test_failure").await.unwrap();
        let EscalationOutcome::Granted { additional_tools, .. } = outcome else {
            panic!("expected grant");
        };
        assert_eq!(additional_tools, vec!["zen".to_string()]);

        // zen is callable while the escalation is active.
        let resp = f.broker.call_tool(request("s1", "zen", "chat", &[])).await;
        assert!(resp.ok);

        // Force the expiry instant into the past and run the sweep.
        f.broker
            .sessions()
            .handle("s1")
            .unwrap()
            .with_state(|s| {
                if let mm_sessions::EscalationState::Active { expires_at, .. } = &mut s.escalation {
                    *expires_at = Utc::now() - chrono::Duration::seconds(1);
                }
            });
        let checkpoints_before = f.broker.sessions().handle("s1").unwrap().view().checkpoint_count;
        assert_eq!(f.broker.expire_due_escalations(), 1);

        // zen is gone; the default set is back; no role-switch checkpoint
        // was created by the expiry.
        let resp = f.broker.call_tool(request("s1", "zen", "chat", &[])).await;
        assert_eq!(resp.error.unwrap().code, "access_denied");
        let view = f.broker.sessions().handle("s1").unwrap().view();
        assert_eq!(
            view.mounted_tools,
            ["expensive", "serena", "task-master-ai"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(view.checkpoint_count, checkpoints_before);
    }

    #[tokio::test]
    async fn approval_required_escalation_parks() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let outcome = f.broker.request_escalation("s1", "ui_testing").await.unwrap();
        assert!(matches!(outcome, EscalationOutcome::PendingApproval { .. }));

        // The extra tools were not mounted.
        let resp = f.broker.call_tool(request("s1", "zen", "chat", &[])).await;
        assert_eq!(resp.error.unwrap().code, "access_denied");
    }

    #[tokio::test]
    async fn rewrite_tightens_monotonically_across_reload() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();

        let p1 = f.broker.policy().current();
        let ctx = RewriteContext {
            session_id: "s1".into(),
            role: Some("developer".into()),
            ledger: f.broker.ledger().status("s1").unwrap(),
        };
        let call = request("s1", "task-master-ai", "list_tasks", &[("limit", json!(200))]);
        let once = RewriteEngine::rewrite(&call, &ctx, &p1, f.broker.ledger().as_ref());

        // Tighten the clamp and reload atomically.
        let tightened = POLICY.replace("limit: 50", "limit: 10");
        let generation = f.broker.reload_policy(&tightened).unwrap();
        assert_eq!(generation, 2);

        // The captured snapshot still observes the old limits.
        let again = RewriteEngine::rewrite(&once.call, &ctx, &p1, f.broker.ledger().as_ref());
        assert_eq!(again.call.args, once.call.args);

        // Under the new snapshot the rewrite can only tighten further.
        let p2 = f.broker.policy().current();
        let under_p2 = RewriteEngine::rewrite(&once.call, &ctx, &p2, f.broker.ledger().as_ref());
        assert!(under_p2.estimate <= once.estimate);
        assert_eq!(under_p2.call.args["limit"], json!(10));
    }

    #[tokio::test]
    async fn invalid_reload_keeps_serving_old_policy() {
        let f = fixture();
        let before = f.broker.policy().current().generation;
        let err = f.broker.reload_policy("rules:\n  budgets:\n    warning_fraction: 7.0\n").unwrap_err();
        assert!(matches!(err, Error::PolicyInvalid(_)));
        assert_eq!(f.broker.policy().current().generation, before);
    }

    #[tokio::test]
    async fn health_report_shape() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        let report = f.broker.broker_health();
        assert_eq!(report.status, BrokerStatus::Ready);
        assert_eq!(report.active_sessions, 1);
        assert_eq!(report.servers.len(), 5);
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn close_session_round_trip() {
        let f = fixture();
        f.broker.admit_session("s1", SessionPrefs::default()).unwrap();
        f.broker.switch_role("s1", "developer").await.unwrap();
        let cp = f.broker.close_session("s1").await.unwrap();
        assert_eq!(cp.kind, CheckpointKind::SessionEnd);
        assert!(f.broker.session_status("s1").is_err());
    }
}

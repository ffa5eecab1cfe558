//! Per-session ledger accounting.
//!
//! The manager owns every session's budget state. Mutations on one session
//! are serialized through that session's mutex; the critical sections are
//! short and never suspend. Usage rows are durably appended before the
//! in-memory state is updated, so a crash loses at most the in-memory
//! delta that replay reconstructs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mm_domain::error::{Error, Result};
use mm_domain::policy::PolicySnapshot;

use crate::ledger::{AffordReason, BandEvent, LedgerSnapshot, LedgerState};
use crate::usage_log::{UsageLog, UsageRecord};

/// On-disk form of a lazily checkpointed ledger.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerCheckpoint {
    state: LedgerState,
    checkpoint_at: DateTime<Utc>,
}

/// Owns per-session budget state and the usage log.
pub struct LedgerManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<LedgerState>>>>,
    usage_log: Arc<dyn UsageLog>,
    checkpoint_dir: PathBuf,
}

impl LedgerManager {
    pub fn new(usage_log: Arc<dyn UsageLog>, state_path: &Path) -> Result<Self> {
        let checkpoint_dir = state_path.join("ledgers");
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            usage_log,
            checkpoint_dir,
        })
    }

    /// Seed a fresh ledger for a session entering a role.
    pub fn init_session(
        &self,
        session_id: &str,
        role: Option<&str>,
        policy: &PolicySnapshot,
    ) -> LedgerSnapshot {
        let budgets = &policy.rules.budgets;
        let total = role
            .and_then(|r| policy.profiles.get(r))
            .map(|p| p.token_budget)
            .unwrap_or(budgets.default_tokens);

        let state = LedgerState::new(
            session_id.to_string(),
            role.map(String::from),
            total,
            budgets.emergency_reserve,
            budgets.warning_fraction,
            budgets.hard_cap,
        );
        let snap = state.snapshot();

        self.sessions
            .write()
            .insert(session_id.to_string(), Arc::new(Mutex::new(state)));

        tracing::info!(session_id, role = ?role, total_budget = total, "ledger initialized");
        snap
    }

    /// Switch a session's ledger to a new role's budget. `used` is
    /// preserved; `total_budget` and `warning_threshold` are replaced.
    pub fn switch_role(
        &self,
        session_id: &str,
        new_role: &str,
        policy: &PolicySnapshot,
    ) -> Result<(LedgerSnapshot, Vec<BandEvent>)> {
        let entry = self.entry(session_id)?;
        let budgets = &policy.rules.budgets;
        let total = policy
            .profiles
            .get(new_role)
            .map(|p| p.token_budget)
            .unwrap_or(budgets.default_tokens);

        let mut state = entry.lock();
        state.role = Some(new_role.to_string());
        state.total_budget = total;
        state.warning_threshold = (total as f64 * budgets.warning_fraction) as u64;
        state.last_updated = Utc::now();
        let events = state.reconcile_band();

        tracing::info!(session_id, new_role, total_budget = total, "ledger budget switched");
        Ok((state.snapshot(), events))
    }

    /// Record consumption for a completed call. Appends the usage row,
    /// bumps `used`, refreshes the burn rate, and returns the new snapshot
    /// plus any band-transition events.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        session_id: &str,
        tokens: u64,
        tool: &str,
        method: &str,
        estimated: u64,
        rewrite_applied: bool,
        tokens_saved: u64,
    ) -> Result<(LedgerSnapshot, Vec<BandEvent>)> {
        let entry = self.entry(session_id)?;

        let record = {
            let state = entry.lock();
            UsageRecord {
                timestamp: Utc::now(),
                session_id: session_id.to_string(),
                role: state.role.clone().unwrap_or_else(|| "unknown".into()),
                tool: tool.to_string(),
                method: method.to_string(),
                tokens_used: tokens,
                tokens_estimated: if estimated == 0 { tokens } else { estimated },
                rewrite_applied,
                tokens_saved,
            }
        };
        // Durable append happens outside the state lock.
        self.usage_log.append(&record)?;

        let burn = self.compute_burn_rate(session_id);

        let mut state = entry.lock();
        state.used = state.used.saturating_add(tokens).min(state.hard_cap);
        state.last_updated = Utc::now();
        state.burn_rate = burn;
        let events = state.reconcile_band();

        tracing::debug!(
            session_id,
            tokens,
            used = state.used,
            band = state.band().as_str(),
            "usage recorded"
        );
        Ok((state.snapshot(), events))
    }

    pub fn status(&self, session_id: &str) -> Result<LedgerSnapshot> {
        Ok(self.entry(session_id)?.lock().snapshot())
    }

    pub fn can_afford(&self, session_id: &str, required: u64) -> Result<AffordReason> {
        Ok(self.status(session_id)?.can_afford(required))
    }

    /// Predict the token cost of a call: 30-day historical mean for the
    /// (tool, method), falling back to the policy's heuristic cost model.
    pub fn estimate(
        &self,
        tool: &str,
        method: &str,
        args: &BTreeMap<String, Value>,
        policy: &PolicySnapshot,
    ) -> u64 {
        let costs = &policy.rules.costs;
        let since = Utc::now() - Duration::days(30);
        let base = match self.usage_log.mean_tokens(tool, method, since) {
            Some(mean) => mean.round() as u64,
            None => costs
                .tools
                .get(tool)
                .map(|c| c.estimate(args))
                .unwrap_or(costs.default_base),
        };
        base.max(costs.minimum)
    }

    /// Lazily checkpoint one session's ledger to disk.
    pub fn checkpoint(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id)?;
        let checkpoint = LedgerCheckpoint {
            state: entry.lock().clone(),
            checkpoint_at: Utc::now(),
        };
        let path = self.checkpoint_path(session_id);
        std::fs::write(&path, serde_json::to_vec_pretty(&checkpoint)?)?;
        Ok(())
    }

    /// Rebuild ledgers after a restart: load each checkpoint and replay
    /// usage rows newer than it. Band events are not re-emitted.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0usize;
        for dirent in std::fs::read_dir(&self.checkpoint_dir)? {
            let path = dirent?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let checkpoint: LedgerCheckpoint = match serde_json::from_str(&raw) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable ledger checkpoint");
                    continue;
                }
            };

            let mut state = checkpoint.state;
            let replayed =
                self.usage_log
                    .session_records_since(&state.session_id, checkpoint.checkpoint_at);
            for row in &replayed {
                state.used = state.used.saturating_add(row.tokens_used).min(state.hard_cap);
            }
            // Re-announce silently at the recovered level.
            let _ = state.reconcile_band();

            tracing::info!(
                session_id = %state.session_id,
                used = state.used,
                replayed_rows = replayed.len(),
                "ledger recovered"
            );
            self.sessions
                .write()
                .insert(state.session_id.clone(), Arc::new(Mutex::new(state)));
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Final checkpoint + drop of a closing session's ledger.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        self.checkpoint(session_id)?;
        self.sessions.write().remove(session_id);
        Ok(())
    }

    /// Discard a recovered or stale ledger without checkpointing (used when
    /// session GC discards the session itself).
    pub fn discard(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
        let _ = std::fs::remove_file(self.checkpoint_path(session_id));
    }

    /// Aggregate usage over a trailing window for status surfaces.
    pub fn usage_analytics(
        &self,
        session_id: Option<&str>,
        role: Option<&str>,
        days: i64,
    ) -> UsageAnalytics {
        let since = Utc::now() - Duration::days(days);
        let rows: Vec<UsageRecord> = self
            .usage_log
            .records_since(since)
            .into_iter()
            .filter(|r| session_id.is_none_or(|s| r.session_id == s))
            .filter(|r| role.is_none_or(|ro| r.role == ro))
            .collect();

        let total_calls = rows.len() as u64;
        let total_tokens: u64 = rows.iter().map(|r| r.tokens_used).sum();
        let total_saved: u64 = rows.iter().map(|r| r.tokens_saved).sum();

        let mut per_tool: BTreeMap<(String, String), ToolUsage> = BTreeMap::new();
        for r in &rows {
            let entry = per_tool
                .entry((r.tool.clone(), r.method.clone()))
                .or_insert_with(|| ToolUsage {
                    tool: r.tool.clone(),
                    method: r.method.clone(),
                    calls: 0,
                    total_tokens: 0,
                    avg_tokens: 0.0,
                    tokens_saved: 0,
                });
            entry.calls += 1;
            entry.total_tokens += r.tokens_used;
            entry.tokens_saved += r.tokens_saved;
        }
        let mut tools: Vec<ToolUsage> = per_tool
            .into_values()
            .map(|mut t| {
                t.avg_tokens = t.total_tokens as f64 / t.calls as f64;
                t
            })
            .collect();
        tools.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens));

        UsageAnalytics {
            period_days: days,
            total_calls,
            total_tokens,
            avg_tokens_per_call: if total_calls == 0 {
                0.0
            } else {
                total_tokens as f64 / total_calls as f64
            },
            total_saved,
            tools,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn entry(&self, session_id: &str) -> Result<Arc<Mutex<LedgerState>>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchSession(session_id.to_string()))
    }

    fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{session_id}.json"))
    }

    /// Tokens per hour over the trailing hour of this session's records;
    /// undefined below two records or a zero time span.
    fn compute_burn_rate(&self, session_id: &str) -> Option<f64> {
        let since = Utc::now() - Duration::hours(1);
        let rows = self.usage_log.session_records_since(session_id, since);
        if rows.len() < 2 {
            return None;
        }
        let total: u64 = rows.iter().map(|r| r.tokens_used).sum();
        let span = rows.last()?.timestamp - rows.first()?.timestamp;
        let hours = span.num_milliseconds() as f64 / 3_600_000.0;
        (hours > 0.0).then(|| total as f64 / hours)
    }
}

/// Per-(tool, method) aggregate over the analytics window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool: String,
    pub method: String,
    pub calls: u64,
    pub total_tokens: u64,
    pub avg_tokens: f64,
    pub tokens_saved: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAnalytics {
    pub period_days: i64,
    pub total_calls: u64,
    pub total_tokens: u64,
    pub avg_tokens_per_call: f64,
    pub total_saved: u64,
    pub tools: Vec<ToolUsage>,
}

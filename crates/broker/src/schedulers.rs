//! Background schedulers: health pass, idle-session GC, escalation
//! expiry, and auto-checkpointing.
//!
//! Each scheduler is an independent task started at broker start and
//! cancelled through a shared [`CancellationToken`]. State mutations go
//! through the registries' own serialization; the schedulers never hold a
//! session lock across I/O.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mm_domain::checkpoint::{CheckpointKind, CheckpointPayload};

use crate::orchestrator::Broker;

/// Session GC cadence.
const GC_PERIOD: Duration = Duration::from_secs(300);
/// Escalation expiry sweep cadence.
const ESCALATION_PERIOD: Duration = Duration::from_secs(60);
/// Auto-checkpoint tick; each session's own interval is evaluated per
/// tick, so per-role intervals fall out naturally.
const CHECKPOINT_TICK: Duration = Duration::from_secs(60);

/// Start every scheduler. Returned handles finish once `cancel` fires.
pub fn spawn_all(broker: Arc<Broker>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        spawn_health_pass(broker.clone(), cancel.clone()),
        spawn_session_gc(broker.clone(), cancel.clone()),
        spawn_escalation_expiry(broker.clone(), cancel.clone()),
        spawn_auto_checkpoint(broker, cancel),
    ]
}

fn spawn_health_pass(broker: Arc<Broker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval =
                Duration::from_secs(broker.policy().current().broker.health_check_interval_seconds);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            let policy = broker.policy().current();
            let results = broker.transports().health_pass(&policy).await;
            for (server, healthy) in &results {
                let rt = broker
                    .transports()
                    .connection(server)
                    .map(|c| c.avg_response_time_ms())
                    .unwrap_or(0.0);
                broker.metrics().record_server_health(server, *healthy, rt);
            }
            broker.refresh_status();
        }
        tracing::debug!("health pass scheduler stopped");
    })
}

fn spawn_session_gc(broker: Arc<Broker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(GC_PERIOD) => {}
            }

            let idle_for =
                chrono::Duration::hours(broker.policy().current().broker.session_idle_hours as i64);
            for session_id in broker.sessions().idle_sessions(idle_for) {
                tracing::info!(session_id = %session_id, "closing idle session");
                if let Err(e) = broker.close_session(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %e, "idle close failed");
                }
            }
        }
        tracing::debug!("session GC scheduler stopped");
    })
}

fn spawn_escalation_expiry(broker: Arc<Broker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(ESCALATION_PERIOD) => {}
            }

            let expired = broker.expire_due_escalations();
            if expired > 0 {
                tracing::info!(expired, "expired escalations");
            }
        }
        tracing::debug!("escalation expiry scheduler stopped");
    })
}

fn spawn_auto_checkpoint(broker: Arc<Broker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(CHECKPOINT_TICK) => {}
            }

            let policy = broker.policy().current();
            if !policy.features.auto_checkpoints {
                continue;
            }

            let now = Utc::now();
            for view in broker.sessions().views() {
                // Only sessions with an active role get periodic
                // checkpoints.
                let Some(role) = &view.role else { continue };

                let interval_minutes = broker
                    .sessions()
                    .handle(&view.session_id)
                    .ok()
                    .and_then(|h| h.with_state(|s| s.prefs.auto_checkpoint_minutes))
                    .or_else(|| {
                        policy
                            .profiles
                            .get(role)
                            .map(|p| p.auto_checkpoint_minutes)
                    })
                    .unwrap_or(25);

                let last = broker
                    .sessions()
                    .handle(&view.session_id)
                    .ok()
                    .and_then(|h| h.with_state(|s| s.checkpoints.latest().map(|c| c.timestamp)))
                    .unwrap_or(view.created_at);

                if now - last >= chrono::Duration::minutes(interval_minutes as i64) {
                    if let Err(e) = broker.checkpoint(
                        &view.session_id,
                        CheckpointKind::AutoPeriodic,
                        CheckpointPayload::default(),
                    ) {
                        tracing::warn!(
                            session_id = %view.session_id,
                            error = %e,
                            "auto-checkpoint failed"
                        );
                    }
                }
            }
        }
        tracing::debug!("auto-checkpoint scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_domain::policy::{PolicyDocument, PolicyStore};
    use mm_ledger::{JsonlUsageLog, LedgerManager};
    use mm_sessions::{SessionPrefs, SessionRegistry, SessionStore};
    use mm_transport::TransportManager;

    const POLICY: &str = r#"
broker:
  health_check_interval_seconds: 1
profiles:
  developer:
    description: dev
    default_tools: []
    token_budget: 10000
    auto_checkpoint_minutes: 25
servers: {}
"#;

    fn broker() -> (tempfile::TempDir, Arc<Broker>) {
        let dir = tempfile::tempdir().unwrap();
        let policy =
            Arc::new(PolicyStore::new(PolicyDocument::from_yaml(POLICY).unwrap()).unwrap());
        let log = Arc::new(JsonlUsageLog::open(dir.path().join("usage.jsonl")).unwrap());
        let ledger = Arc::new(LedgerManager::new(log, dir.path()).unwrap());
        let store = Arc::new(SessionStore::new(dir.path()).unwrap());
        let sessions = Arc::new(SessionRegistry::new(store));
        let transports = Arc::new(TransportManager::new(10));
        (dir, Arc::new(Broker::new(policy, sessions, ledger, transports)))
    }

    #[tokio::test]
    async fn schedulers_stop_on_cancel() {
        let (_dir, broker) = broker();
        let cancel = CancellationToken::new();
        let handles = spawn_all(broker, cancel.clone());

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("scheduler did not stop")
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_sweep_runs_periodically() {
        let (_dir, broker) = broker();
        broker.admit_session("s1", SessionPrefs::default()).unwrap();
        broker.switch_role("s1", "developer").await.unwrap();

        // Plant an already-expired escalation directly.
        broker
            .sessions()
            .grant_escalation(
                "s1",
                "test_failure",
                Default::default(),
                Utc::now() - chrono::Duration::seconds(1),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_escalation_expiry(broker.clone(), cancel.clone());

        tokio::time::advance(Duration::from_secs(61)).await;
        // Let the scheduler task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let view = broker.sessions().handle("s1").unwrap().view();
        assert!(!view.escalation.is_active());

        cancel.cancel();
        handle.await.unwrap();
    }
}

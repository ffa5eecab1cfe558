//! The transport manager: startup sequencing, health, recovery, and call
//! dispatch.
//!
//! Connections are server-scoped and shared across sessions. The hot path
//! (`call`) touches only the target connection: a breaker check, an
//! in-flight slot, the transport call, and accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;

use mm_domain::error::{Error, Result};
use mm_domain::policy::{PolicySnapshot, ServerConfig, TransportKind};

use crate::breaker::BreakerDecision;
use crate::connection::{ServerConnection, ServerStats, ServerStatus};
use crate::transport::{HttpTransport, StdioTransport, Transport, TransportFault, WsTransport};

/// Poll cadence while waiting for a starting server to pass health.
const STARTUP_POLL: Duration = Duration::from_millis(500);

/// Consecutive failed recovery attempts before a server is marked failed
/// and left for manual intervention.
const MAX_RECOVERY_FAILURES: u32 = 3;

pub struct TransportManager {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    /// Order servers were started in; shutdown runs in reverse.
    start_order: Mutex<Vec<String>>,
    /// Consecutive failed recovery attempts per server.
    recovery_failures: Mutex<HashMap<String, u32>>,
    max_in_flight: AtomicUsize,
}

impl TransportManager {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            start_order: Mutex::new(Vec::new()),
            recovery_failures: Mutex::new(HashMap::new()),
            max_in_flight: AtomicUsize::new(max_in_flight.max(1)),
        }
    }

    /// Applied on policy reload; existing connections are kept.
    pub fn set_max_in_flight(&self, max: usize) {
        self.max_in_flight.store(max.max(1), Ordering::Relaxed);
    }

    // ── Startup & shutdown ────────────────────────────────────────────

    /// Start every declared server, cheapest startup timeout first. Failed
    /// starts are recorded and do not abort the sequence. Returns the
    /// number of servers that came up healthy.
    pub async fn start_all(&self, policy: &PolicySnapshot) -> usize {
        let mut order: Vec<(&String, &ServerConfig)> = policy.servers.iter().collect();
        order.sort_by_key(|(_, config)| config.startup_timeout_seconds);

        let mut started = 0usize;
        for (name, config) in order {
            match self.start_server(name, config).await {
                Ok(()) => {
                    started += 1;
                    tracing::info!(server = %name, "server started");
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server failed to start, continuing");
                }
            }
        }
        tracing::info!(started, total = policy.servers.len(), "server startup sequence complete");
        started
    }

    /// Start (or restart) one server: build its transport, then block
    /// until health passes or the startup timeout elapses.
    async fn start_server(&self, name: &str, config: &ServerConfig) -> Result<()> {
        let transport = Self::build_transport(name, config)
            .await
            .map_err(|f| f.into_error(name))?;

        let conn = Arc::new(ServerConnection::new(
            name.to_string(),
            config.clone(),
            transport,
        ));

        let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_seconds);
        let health_timeout = Duration::from_secs(config.health.timeout_seconds);
        loop {
            match conn.transport.health_check(health_timeout).await {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    conn.set_status(ServerStatus::Failed);
                    self.insert(conn.clone());
                    return Err(Error::Transport(format!(
                        "{name}: not healthy within startup timeout: {e}"
                    )));
                }
                Err(_) => tokio::time::sleep(STARTUP_POLL).await,
            }
        }

        conn.set_status(ServerStatus::Ready);
        conn.mark_health_checked();
        self.insert(conn);
        Ok(())
    }

    fn insert(&self, conn: Arc<ServerConnection>) {
        let name = conn.name.clone();
        let previous = self.connections.write().insert(name.clone(), conn);
        if previous.is_none() {
            self.start_order.lock().push(name);
        }
    }

    async fn build_transport(
        name: &str,
        config: &ServerConfig,
    ) -> std::result::Result<Box<dyn Transport>, TransportFault> {
        match config.transport {
            TransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(name, config)?)),
            TransportKind::Http => Ok(Box::new(HttpTransport::new(config)?)),
            TransportKind::Websocket => Ok(Box::new(WsTransport::connect(config).await?)),
        }
    }

    /// Graceful shutdown in reverse start order.
    pub async fn shutdown_all(&self) {
        let order: Vec<String> = {
            let mut order = self.start_order.lock().clone();
            order.reverse();
            order
        };
        for name in order {
            if let Some(conn) = self.connection(&name) {
                tracing::info!(server = %name, "shutting down server");
                conn.transport.shutdown().await;
                conn.set_status(ServerStatus::Stopped);
            }
        }
    }

    // ── Availability ──────────────────────────────────────────────────

    pub fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.connections.read().get(name).cloned()
    }

    /// Non-consuming availability check used before admission: the server
    /// must exist, take traffic, and have a breaker that would admit.
    pub fn check_available(&self, name: &str) -> Result<()> {
        let conn = self
            .connection(name)
            .ok_or_else(|| Error::ServerUnavailable(name.to_string()))?;
        if !conn.status().is_healthy() {
            return Err(Error::ServerUnavailable(name.to_string()));
        }
        if !conn.breaker.lock().would_admit(Instant::now()) {
            return Err(Error::ServerUnavailable(name.to_string()));
        }
        Ok(())
    }

    /// Make sure a server is up, starting or recovering it as needed.
    /// Used when a role switch mounts tools.
    pub async fn ensure_ready(&self, name: &str, policy: &PolicySnapshot) -> bool {
        if let Some(conn) = self.connection(name) {
            if conn.status().is_healthy() {
                return true;
            }
            if conn.status() == ServerStatus::Failed {
                // Failed servers wait for manual intervention.
                return false;
            }
        }
        let Some(config) = policy.servers.get(name) else {
            return false;
        };
        self.start_server(name, config).await.is_ok()
    }

    // ── Call path ─────────────────────────────────────────────────────

    /// Dispatch one call: breaker, in-flight slot, transport, accounting.
    /// At-most-once semantics; no retries here.
    pub async fn call(
        &self,
        server: &str,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let conn = self
            .connection(server)
            .ok_or_else(|| Error::ServerUnavailable(server.to_string()))?;

        if !conn.status().is_healthy() {
            return Err(Error::ServerUnavailable(server.to_string()));
        }

        let decision = conn.breaker.lock().admit(Instant::now());
        if decision == BreakerDecision::Reject {
            return Err(Error::ServerUnavailable(server.to_string()));
        }

        if !conn.try_acquire_slot(self.max_in_flight.load(Ordering::Relaxed)) {
            // The probe slot must not leak if the server is saturated.
            if decision == BreakerDecision::AllowProbe {
                conn.breaker.lock().record_failure(Instant::now());
            }
            return Err(Error::ServerBusy(server.to_string()));
        }

        let started = Instant::now();
        let outcome = conn.transport.call(method, args, timeout).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        conn.release_slot();

        match outcome {
            Ok(value) => {
                conn.record_response_time(elapsed_ms);
                conn.mark_used();
                conn.breaker.lock().record_success();
                Ok(value)
            }
            Err(fault) => {
                conn.mark_used();
                if fault.counts_toward_breaker() {
                    conn.breaker.lock().record_failure(Instant::now());
                }
                Err(fault.into_error(server))
            }
        }
    }

    // ── Health & recovery ─────────────────────────────────────────────

    /// One background health pass: check every running server, record
    /// response times, and recover the ones that fail. Returns per-server
    /// health outcomes.
    pub async fn health_pass(&self, policy: &PolicySnapshot) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        // Declared servers that never came up get another start attempt,
        // bounded by the same recovery-failure cap.
        let missing: Vec<String> = policy
            .servers
            .keys()
            .filter(|name| self.connection(name).is_none())
            .cloned()
            .collect();
        for name in missing {
            let attempts = self.recovery_failures.lock().get(&name).copied().unwrap_or(0);
            if attempts >= MAX_RECOVERY_FAILURES {
                continue;
            }
            let config = &policy.servers[&name];
            match self.start_server(&name, config).await {
                Ok(()) => {
                    self.recovery_failures.lock().remove(&name);
                    results.insert(name, true);
                }
                Err(e) => {
                    *self.recovery_failures.lock().entry(name.clone()).or_insert(0) += 1;
                    tracing::warn!(server = %name, error = %e, "late start attempt failed");
                    results.insert(name, false);
                }
            }
        }

        let connections: Vec<Arc<ServerConnection>> =
            self.connections.read().values().cloned().collect();
        for conn in connections {
            let status = conn.status();
            if matches!(status, ServerStatus::Stopped | ServerStatus::Failed) {
                continue;
            }

            let rebuild_window = Duration::from_secs(policy.broker.breaker_rebuild_seconds);
            let breaker_stuck = conn
                .breaker
                .lock()
                .open_duration(Instant::now())
                .is_some_and(|d| d >= rebuild_window);

            let health_timeout = Duration::from_secs(conn.config.health.timeout_seconds);
            let started = Instant::now();
            let healthy = !breaker_stuck && conn.transport.health_check(health_timeout).await.is_ok();
            conn.mark_health_checked();

            if healthy {
                conn.record_response_time(started.elapsed().as_secs_f64() * 1000.0);
                conn.set_status(ServerStatus::Ready);
                self.recovery_failures.lock().remove(&conn.name);
                results.insert(conn.name.clone(), true);
            } else {
                tracing::warn!(server = %conn.name, breaker_stuck, "health check failed, recovering");
                let recovered = self.recover(&conn.name, policy).await;
                results.insert(conn.name.clone(), recovered);
            }
        }
        results
    }

    /// Tear the connection down and re-run startup. Three consecutive
    /// failures mark the server failed and stop further attempts.
    async fn recover(&self, name: &str, policy: &PolicySnapshot) -> bool {
        if let Some(conn) = self.connection(name) {
            conn.transport.shutdown().await;
            conn.set_status(ServerStatus::Degraded);
        }

        let Some(config) = policy.servers.get(name) else {
            return false;
        };

        match self.start_server(name, config).await {
            Ok(()) => {
                self.recovery_failures.lock().remove(name);
                tracing::info!(server = %name, "server recovered");
                true
            }
            Err(e) => {
                let failures = {
                    let mut map = self.recovery_failures.lock();
                    let entry = map.entry(name.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                tracing::warn!(server = %name, failures, error = %e, "recovery attempt failed");
                if failures >= MAX_RECOVERY_FAILURES {
                    if let Some(conn) = self.connection(name) {
                        conn.set_status(ServerStatus::Failed);
                    }
                    tracing::error!(server = %name, "server marked failed after repeated recovery failures");
                }
                false
            }
        }
    }

    // ── Rollup & stats ────────────────────────────────────────────────

    /// Healthy fraction of non-excluded servers. Failed servers are out of
    /// the rollup until manual intervention; no servers at all counts as
    /// fully healthy.
    pub fn overall_health(&self) -> f64 {
        let connections = self.connections.read();
        let considered: Vec<_> = connections
            .values()
            .filter(|c| !matches!(c.status(), ServerStatus::Failed | ServerStatus::Stopped))
            .collect();
        if considered.is_empty() {
            return if connections.is_empty() { 1.0 } else { 0.0 };
        }
        let healthy = considered.iter().filter(|c| c.status().is_healthy()).count();
        healthy as f64 / considered.len() as f64
    }

    pub fn server_stats(&self) -> Vec<ServerStats> {
        let mut stats: Vec<ServerStats> = self
            .connections
            .read()
            .values()
            .map(|c| c.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn server_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Register an externally built transport as a ready connection.
    /// Lets embedders plug in custom channels beyond the three built-in
    /// transport kinds.
    pub fn register(
        &self,
        name: &str,
        config: ServerConfig,
        transport: Box<dyn Transport>,
    ) -> Arc<ServerConnection> {
        let conn = Arc::new(ServerConnection::new(name.to_string(), config, transport));
        conn.set_status(ServerStatus::Ready);
        self.insert(conn.clone());
        conn
    }

    #[cfg(test)]
    pub(crate) fn insert_test_connection(&self, conn: ServerConnection) -> Arc<ServerConnection> {
        let conn = Arc::new(conn);
        conn.set_status(ServerStatus::Ready);
        self.insert(conn.clone());
        conn
    }
}

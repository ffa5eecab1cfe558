//! Per-server runtime state: status, breaker, response-time histogram,
//! and in-flight accounting. There is at most one live connection per
//! declared server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use mm_domain::policy::{ServerConfig, TransportKind};

use crate::breaker::CircuitBreaker;
use crate::transport::Transport;

/// Connection status lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Unknown,
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

impl ServerStatus {
    /// Ready and degraded servers still take traffic.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Bounded window of response-time samples.
const RESPONSE_WINDOW: usize = 100;

/// Runtime state for one server.
pub struct ServerConnection {
    pub name: String,
    pub config: ServerConfig,
    pub transport: Box<dyn Transport>,
    pub breaker: Mutex<CircuitBreaker>,
    status: RwLock<ServerStatus>,
    response_times_ms: Mutex<VecDeque<f64>>,
    in_flight: AtomicUsize,
    /// Consecutive failed recovery attempts; at three the server is marked
    /// failed and left for manual intervention.
    pub recovery_failures: AtomicU32,
    pub created_at: DateTime<Utc>,
    last_used: RwLock<DateTime<Utc>>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    call_count: AtomicUsize,
}

impl ServerConnection {
    pub fn new(name: String, config: ServerConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            name,
            config,
            transport,
            breaker: Mutex::new(CircuitBreaker::default()),
            status: RwLock::new(ServerStatus::Starting),
            response_times_ms: Mutex::new(VecDeque::with_capacity(RESPONSE_WINDOW)),
            in_flight: AtomicUsize::new(0),
            recovery_failures: AtomicU32::new(0),
            created_at: Utc::now(),
            last_used: RwLock::new(Utc::now()),
            last_health_check: RwLock::new(None),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ServerStatus) {
        let mut current = self.status.write();
        if *current != status {
            tracing::info!(
                server = %self.name,
                from = current.as_str(),
                to = status.as_str(),
                "server status changed"
            );
            *current = status;
        }
    }

    /// Try to claim an in-flight slot. Returns false at the cap.
    pub fn try_acquire_slot(&self, max_in_flight: usize) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_in_flight).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn record_response_time(&self, ms: f64) {
        let mut window = self.response_times_ms.lock();
        if window.len() == RESPONSE_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        let window = self.response_times_ms.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    pub fn mark_used(&self) {
        *self.last_used.write() = Utc::now();
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_health_checked(&self) {
        *self.last_health_check.write() = Some(Utc::now());
    }

    pub fn stats(&self) -> ServerStats {
        let now = Utc::now();
        ServerStats {
            name: self.name.clone(),
            transport: self.config.transport,
            status: self.status(),
            uptime_seconds: (now - self.created_at).num_seconds().max(0) as u64,
            idle_seconds: (now - *self.last_used.read()).num_seconds().max(0) as u64,
            call_count: self.call_count.load(Ordering::Relaxed) as u64,
            in_flight: self.in_flight() as u64,
            avg_response_time_ms: self.avg_response_time_ms(),
            consecutive_failures: self.breaker.lock().consecutive_failures(),
            breaker_open: self.breaker.lock().is_open(),
            last_health_check: *self.last_health_check.read(),
        }
    }
}

/// Point-in-time view of one server for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub call_count: u64,
    pub in_flight: u64,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub breaker_open: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

//! Per-connection circuit breaker.
//!
//! Closed until the consecutive-failure threshold is reached, then open
//! (failing fast) until the recovery instant, then half-open: exactly one
//! probe call goes through. A successful probe closes the breaker and
//! resets the counter; a failed probe re-opens it with a fresh timeout.
//!
//! Uses `tokio::time::Instant` so tests can drive it under paused time.

use std::time::Duration;

use tokio::time::Instant;

/// What the breaker allows for the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Breaker is closed; dispatch normally.
    Allow,
    /// Breaker was open past its recovery instant; this call is the single
    /// half-open probe.
    AllowProbe,
    /// Fail fast without dispatching.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    /// A probe is in flight; everything else is rejected until it resolves.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: State,
    consecutive_failures: u32,
    threshold: u32,
    recovery_timeout: Duration,
    /// Set when the breaker first opened and cleared on close; lets the
    /// manager decide when an open breaker has been open long enough to
    /// warrant a full connection rebuild.
    open_since: Option<Instant>,
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            recovery_timeout,
            open_since: None,
        }
    }

    /// Decide whether the next call may proceed, transitioning open →
    /// half-open when the recovery instant has passed. The caller must
    /// report the probe's outcome via [`record_success`] /
    /// [`record_failure`].
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    pub fn admit(&mut self, now: Instant) -> BreakerDecision {
        match self.state {
            State::Closed => BreakerDecision::Allow,
            State::Open { until } => {
                if now >= until {
                    self.state = State::HalfOpen;
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::Reject
                }
            }
            State::HalfOpen => BreakerDecision::Reject,
        }
    }

    /// Non-consuming view: would a call be admitted right now? Does not
    /// transition to half-open.
    pub fn would_admit(&self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open { until } => now >= until,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = State::Closed;
        self.open_since = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        match self.state {
            State::HalfOpen => {
                // Failed probe: re-open with a fresh timeout.
                self.state = State::Open {
                    until: now + self.recovery_timeout,
                };
            }
            State::Closed if self.consecutive_failures >= self.threshold => {
                self.state = State::Open {
                    until: now + self.recovery_timeout,
                };
                self.open_since.get_or_insert(now);
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. } | State::HalfOpen)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// How long the breaker has been continuously open, if it is.
    pub fn open_duration(&self, now: Instant) -> Option<Duration> {
        self.open_since.map(|since| now.saturating_duration_since(since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let mut b = CircuitBreaker::default();
        for _ in 0..4 {
            b.record_failure(now());
            assert_eq!(b.admit(now()), BreakerDecision::Allow);
        }
        b.record_failure(now());
        assert!(b.is_open());
        assert_eq!(b.admit(now()), BreakerDecision::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_recovery_timeout() {
        let mut b = CircuitBreaker::default();
        for _ in 0..5 {
            b.record_failure(now());
        }
        assert_eq!(b.admit(now()), BreakerDecision::Reject);

        tokio::time::advance(Duration::from_secs(31)).await;

        // Exactly one probe is allowed.
        assert_eq!(b.admit(now()), BreakerDecision::AllowProbe);
        assert_eq!(b.admit(now()), BreakerDecision::Reject);

        // Probe success closes the breaker and resets the counter.
        b.record_success();
        assert_eq!(b.admit(now()), BreakerDecision::Allow);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_timeout() {
        let mut b = CircuitBreaker::default();
        for _ in 0..5 {
            b.record_failure(now());
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.admit(now()), BreakerDecision::AllowProbe);
        b.record_failure(now());

        // Still rejecting right after the failed probe.
        assert_eq!(b.admit(now()), BreakerDecision::Reject);

        // A fresh 30s window applies.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.admit(now()), BreakerDecision::Reject);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(b.admit(now()), BreakerDecision::AllowProbe);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let mut b = CircuitBreaker::default();
        for _ in 0..4 {
            b.record_failure(now());
        }
        b.record_success();
        // Four more failures don't open it; the counter restarted.
        for _ in 0..4 {
            b.record_failure(now());
        }
        assert!(!b.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn would_admit_does_not_consume_probe() {
        let mut b = CircuitBreaker::default();
        for _ in 0..5 {
            b.record_failure(now());
        }
        assert!(!b.would_admit(now()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.would_admit(now()));
        // The peek did not transition state; admit still yields the probe.
        assert_eq!(b.admit(now()), BreakerDecision::AllowProbe);
    }
}

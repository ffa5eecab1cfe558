//! Budget state for a single session: bands, hysteresis, and derived
//! quantities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Discrete budget status, derived from `used / total_budget`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BudgetBand {
    Healthy,
    Moderate,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetBand {
    /// Classify a usage fraction into its band.
    pub fn from_fraction(fraction: f64) -> Self {
        if fraction >= 0.95 {
            Self::Exceeded
        } else if fraction >= 0.90 {
            Self::Critical
        } else if fraction >= 0.75 {
            Self::Warning
        } else if fraction >= 0.50 {
            Self::Moderate
        } else {
            Self::Healthy
        }
    }

    /// Lower edge of the band as a fraction.
    pub fn lower_edge(&self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Moderate => 0.50,
            Self::Warning => 0.75,
            Self::Critical => 0.90,
            Self::Exceeded => 0.95,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Moderate => "moderate",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exceeded => "exceeded",
        }
    }

    fn next_up(&self) -> Option<Self> {
        match self {
            Self::Healthy => Some(Self::Moderate),
            Self::Moderate => Some(Self::Warning),
            Self::Warning => Some(Self::Critical),
            Self::Critical => Some(Self::Exceeded),
            Self::Exceeded => None,
        }
    }
}

/// Emitted once per upward band crossing per session (hysteresis applies
/// before the same band can fire again).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandEvent {
    pub session_id: String,
    pub role: Option<String>,
    pub band: BudgetBand,
    pub usage_fraction: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of an affordability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffordReason {
    /// `available >= required`.
    Available,
    /// Only covered by dipping into the reserve (`remaining >= required`).
    UsingReserve,
    /// Not affordable even with reserves.
    Insufficient { shortage: u64 },
}

impl AffordReason {
    pub fn is_affordable(&self) -> bool {
        !matches!(self, Self::Insufficient { .. })
    }
}

/// A usage fraction must fall this far below a band's lower edge before the
/// band re-arms and can fire again.
const HYSTERESIS: f64 = 0.05;

/// Mutable per-session budget state. All mutation goes through
/// [`crate::LedgerManager`], which serializes access per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LedgerState {
    pub session_id: String,
    pub role: Option<String>,
    pub total_budget: u64,
    pub used: u64,
    pub reserved: u64,
    pub warning_threshold: u64,
    pub hard_cap: u64,
    pub last_updated: DateTime<Utc>,
    /// Tokens per hour over the trailing hour; `None` below two records.
    pub burn_rate: Option<f64>,
    /// Highest band already announced (drives hysteresis).
    pub announced: BudgetBand,
}

impl LedgerState {
    pub fn new(
        session_id: String,
        role: Option<String>,
        total_budget: u64,
        reserved: u64,
        warning_fraction: f64,
        hard_cap: u64,
    ) -> Self {
        Self {
            session_id,
            role,
            total_budget,
            used: 0,
            reserved,
            warning_threshold: (total_budget as f64 * warning_fraction) as u64,
            hard_cap,
            last_updated: Utc::now(),
            burn_rate: None,
            announced: BudgetBand::Healthy,
        }
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.total_budget == 0 {
            return 0.0;
        }
        self.used as f64 / self.total_budget as f64
    }

    pub fn band(&self) -> BudgetBand {
        BudgetBand::from_fraction(self.usage_fraction())
    }

    /// Update the announced band and collect one event per band crossed
    /// upward. Downward movement (after a role switch raised the budget)
    /// re-arms bands only once the fraction sits `HYSTERESIS` below their
    /// lower edge.
    pub fn reconcile_band(&mut self) -> Vec<BandEvent> {
        let current = self.band();
        let mut events = Vec::new();

        if current > self.announced {
            let mut step = self.announced;
            while let Some(next) = step.next_up() {
                if next > current {
                    break;
                }
                events.push(BandEvent {
                    session_id: self.session_id.clone(),
                    role: self.role.clone(),
                    band: next,
                    usage_fraction: self.usage_fraction(),
                    timestamp: Utc::now(),
                });
                step = next;
            }
            self.announced = current;
        } else if current < self.announced {
            let fraction = self.usage_fraction();
            if fraction <= self.announced.lower_edge() - HYSTERESIS {
                self.announced = current;
            }
        }

        events
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            session_id: self.session_id.clone(),
            role: self.role.clone(),
            total_budget: self.total_budget,
            used: self.used,
            reserved: self.reserved,
            warning_threshold: self.warning_threshold,
            hard_cap: self.hard_cap,
            remaining: self.total_budget.saturating_sub(self.used),
            available: self
                .total_budget
                .saturating_sub(self.used)
                .saturating_sub(self.reserved),
            usage_fraction: self.usage_fraction(),
            band: self.band(),
            burn_rate: self.burn_rate,
            last_updated: self.last_updated,
        }
    }
}

/// Immutable view of a session's budget, handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub session_id: String,
    pub role: Option<String>,
    pub total_budget: u64,
    pub used: u64,
    pub reserved: u64,
    pub warning_threshold: u64,
    pub hard_cap: u64,
    pub remaining: u64,
    pub available: u64,
    pub usage_fraction: f64,
    pub band: BudgetBand,
    pub burn_rate: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// How long until the budget runs out at the current burn rate.
    /// `None` when the burn rate is undefined.
    pub fn time_to_exhaustion(&self) -> Option<Duration> {
        let rate = self.burn_rate?;
        if rate <= 0.0 {
            return None;
        }
        let hours = self.remaining as f64 / rate;
        Some(Duration::seconds((hours * 3600.0) as i64))
    }

    pub fn can_afford(&self, required: u64) -> AffordReason {
        if self.available >= required {
            AffordReason::Available
        } else if self.remaining >= required {
            AffordReason::UsingReserve
        } else {
            AffordReason::Insufficient {
                shortage: required - self.remaining,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(budget: u64) -> LedgerState {
        LedgerState::new("s1".into(), Some("developer".into()), budget, 0, 0.8, budget * 2)
    }

    #[test]
    fn band_thresholds() {
        assert_eq!(BudgetBand::from_fraction(0.0), BudgetBand::Healthy);
        assert_eq!(BudgetBand::from_fraction(0.49), BudgetBand::Healthy);
        assert_eq!(BudgetBand::from_fraction(0.50), BudgetBand::Moderate);
        assert_eq!(BudgetBand::from_fraction(0.75), BudgetBand::Warning);
        assert_eq!(BudgetBand::from_fraction(0.90), BudgetBand::Critical);
        assert_eq!(BudgetBand::from_fraction(0.95), BudgetBand::Exceeded);
        assert_eq!(BudgetBand::from_fraction(1.5), BudgetBand::Exceeded);
    }

    #[test]
    fn bands_emit_once_per_crossing() {
        let mut st = state(100);
        st.used = 50;
        let events = st.reconcile_band();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].band, BudgetBand::Moderate);

        // Same band again: no event.
        st.used = 60;
        assert!(st.reconcile_band().is_empty());
    }

    #[test]
    fn skipping_bands_emits_each_transition_in_order() {
        let mut st = state(100);
        st.used = 91;
        let events = st.reconcile_band();
        let bands: Vec<_> = events.iter().map(|e| e.band).collect();
        assert_eq!(
            bands,
            vec![BudgetBand::Moderate, BudgetBand::Warning, BudgetBand::Critical]
        );
    }

    #[test]
    fn hysteresis_requires_five_point_drop() {
        let mut st = state(100);
        st.used = 76;
        st.reconcile_band();
        assert_eq!(st.announced, BudgetBand::Warning);

        // Budget doubled by a role switch: fraction drops to 0.38 — well
        // below warning's lower edge minus 5 points, so warning re-arms.
        st.total_budget = 200;
        assert!(st.reconcile_band().is_empty());
        assert_eq!(st.announced, BudgetBand::Healthy);

        // Climb back over the warning edge: it fires again.
        st.used = 150;
        let events = st.reconcile_band();
        assert!(events.iter().any(|e| e.band == BudgetBand::Warning));
    }

    #[test]
    fn shallow_drop_does_not_rearm() {
        let mut st = state(1000);
        st.used = 760;
        st.reconcile_band();
        assert_eq!(st.announced, BudgetBand::Warning);

        // Fraction falls to 0.72 — only 3 points under the 0.75 edge.
        st.total_budget = 1050;
        st.reconcile_band();
        assert_eq!(st.announced, BudgetBand::Warning);
    }

    #[test]
    fn afford_reasons() {
        let mut st = state(1000);
        st.reserved = 100;
        st.used = 850;
        let snap = st.snapshot();
        // remaining 150, available 50.
        assert_eq!(snap.can_afford(50), AffordReason::Available);
        assert_eq!(snap.can_afford(100), AffordReason::UsingReserve);
        assert_eq!(
            snap.can_afford(200),
            AffordReason::Insufficient { shortage: 50 }
        );
    }

    #[test]
    fn time_to_exhaustion_contract() {
        let mut st = state(1000);
        st.used = 400;
        st.burn_rate = Some(300.0);
        let snap = st.snapshot();
        // 600 remaining at 300/hour -> 2 hours.
        assert_eq!(snap.time_to_exhaustion().unwrap().num_hours(), 2);

        st.burn_rate = None;
        assert!(st.snapshot().time_to_exhaustion().is_none());
    }
}

//! The broker orchestrator — the end-to-end request path tying sessions,
//! roles, budgets, rewrites, and transports together, plus observability
//! and the background schedulers.

pub mod cli;
pub mod observability;
pub mod orchestrator;
pub mod schedulers;

pub use orchestrator::{Broker, EscalationOutcome, RoleSwitchOutcome, SessionStatus};

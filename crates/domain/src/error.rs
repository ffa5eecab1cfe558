//! Shared error taxonomy.
//!
//! Every operation in the broker returns a typed error from this enum.
//! Each kind maps to a stable machine-readable code and a short gentle
//! message suitable for user-facing surfaces. `Internal` carries a
//! correlation id that is also logged, so a bug report can be matched to
//! the log line.

use uuid::Uuid;

/// Shared error type used across all broker crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such session: {0}")]
    NoSuchSession(String),

    #[error("tool {tool} is not mounted for role {role:?}")]
    AccessDenied { tool: String, role: Option<String> },

    #[error("no such role: {0}")]
    RoleNotFound(String),

    #[error("transition {from:?} -> {to} denied: {reason}")]
    TransitionDenied {
        from: Option<String>,
        to: String,
        reason: String,
    },

    #[error("budget exceeded: need {required} tokens, {remaining} remaining")]
    BudgetExceeded { required: u64, remaining: u64 },

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("server busy: {0}")]
    ServerBusy(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("tool error {code}: {message}")]
    Tool { code: i64, message: String },

    #[error("policy invalid: {0}")]
    PolicyInvalid(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error [{correlation}]: {message}")]
    Internal { correlation: Uuid, message: String },
}

impl Error {
    /// Construct an `Internal` error with a fresh correlation id. The id is
    /// logged immediately so the log line can be matched later.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation, %message, "internal error");
        Self::Internal {
            correlation,
            message,
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchSession(_) => "no_such_session",
            Self::RoleNotFound(_) => "role_not_found",
            Self::AccessDenied { .. } => "access_denied",
            Self::TransitionDenied { .. } => "transition_denied",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ServerUnavailable(_) => "server_unavailable",
            Self::ServerBusy(_) => "server_busy",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport_error",
            Self::Tool { .. } => "tool_error",
            Self::PolicyInvalid(_) => "policy_invalid",
            Self::Io(_) | Self::Json(_) | Self::Internal { .. } => "internal",
        }
    }

    /// Short, non-alarming message for user-facing surfaces. Deployments may
    /// override these via policy; this is the built-in fallback.
    pub fn gentle_message(&self) -> String {
        match self {
            Self::NoSuchSession(_) => "That session has ended. Start a new one to continue.".into(),
            Self::RoleNotFound(name) => format!("There's no role named {name}."),
            Self::AccessDenied { tool, .. } => format!(
                "The {tool} tool isn't part of your current role. An escalation or role switch can unlock it."
            ),
            Self::TransitionDenied { to, reason, .. } => {
                format!("Switching to {to} isn't available right now ({reason}).")
            }
            Self::BudgetExceeded { .. } => {
                "This call would use more tokens than you have left. A smaller scope may fit.".into()
            }
            Self::ServerUnavailable(name) => {
                format!("The {name} server is recovering. Try again shortly.")
            }
            Self::ServerBusy(name) => {
                format!("The {name} server is at capacity. Try again in a moment.")
            }
            Self::Timeout(_) => "That took longer than expected and was stopped.".into(),
            Self::Transport(_) | Self::Tool { .. } => {
                "The tool ran into a problem. Trying again usually works.".into()
            }
            Self::PolicyInvalid(_) => "The new policy had problems; the previous one is still active.".into(),
            Self::Io(_) | Self::Json(_) | Self::Internal { .. } => {
                "Something unexpected happened on our side. It has been logged.".into()
            }
        }
    }

    /// Whether a failed tool call with this error should count toward the
    /// server's circuit breaker. Well-formed downstream error envelopes do
    /// not; timeouts and transport faults do.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Tool-server descriptors from the `servers` section of the policy
//! document. The actual connection logic lives in the `mm-transport` crate.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Transport kind for connecting to a tool server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a child process; newline-delimited JSON-RPC over stdin/stdout.
    #[default]
    Stdio,
    /// Long-lived HTTP client; per-call POST to `{base}/tools/{method}`.
    Http,
    /// Bidirectional frame-oriented socket; id-correlated JSON-RPC.
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Websocket => "websocket",
        }
    }
}

/// Declaration of a single tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: TransportKind,

    /// Command to spawn (stdio only).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Base URL (http and websocket).
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding a bearer token (http only). When the
    /// variable is unset, requests are sent unauthenticated.
    #[serde(default)]
    pub auth_token_env: Option<String>,

    /// How long startup may block waiting for the first healthy check.
    #[serde(default = "d_startup_timeout")]
    pub startup_timeout_seconds: u64,

    #[serde(default)]
    pub health: HealthCheckConfig,
}

fn d_startup_timeout() -> u64 {
    10
}

/// Health-check recipe. Stdio servers are checked by process liveness and
/// websocket servers by protocol ping; only HTTP needs configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// HTTP health endpoint, GET-ed relative to the server URL.
    #[serde(default = "d_health_endpoint")]
    pub endpoint: String,
    /// Per-check timeout.
    #[serde(default = "d_health_timeout")]
    pub timeout_seconds: u64,
}

fn d_health_endpoint() -> String {
    "/health".into()
}

fn d_health_timeout() -> u64 {
    5
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: d_health_endpoint(),
            timeout_seconds: d_health_timeout(),
        }
    }
}

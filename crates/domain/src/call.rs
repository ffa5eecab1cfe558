//! Tool-call shapes flowing through the broker.
//!
//! Requests arrive as a loosely-typed argument map (tool + method + JSON
//! object). The rewrite engine edits the argument map only; the tool and
//! method are never altered.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Call priority, carried through to metrics. Escalation-granted calls may
/// arrive as `High` or `Emergency`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallPriority {
    #[default]
    Normal,
    High,
    Emergency,
}

/// A request to invoke a tool through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub session_id: String,
    pub tool: String,
    pub method: String,
    /// Free-form argument map. `BTreeMap` keeps key order deterministic for
    /// fingerprinting.
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub priority: CallPriority,
}

impl ToolCallRequest {
    pub fn new(
        session_id: impl Into<String>,
        tool: impl Into<String>,
        method: impl Into<String>,
        args: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tool: tool.into(),
            method: method.into(),
            args,
            priority: CallPriority::Normal,
        }
    }

    /// SHA-256 fingerprint of (tool, method, args) for optimization records.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tool.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.method.as_bytes());
        hasher.update(b"\0");
        // BTreeMap serializes in key order, so the fingerprint is stable.
        if let Ok(bytes) = serde_json::to_vec(&self.args) {
            hasher.update(&bytes);
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// The response returned by the broker for a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    #[serde(default)]
    pub optimizations: Vec<Optimization>,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

/// The machine-readable error surface of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    /// Stable code from [`crate::error::Error::code`].
    pub code: String,
    pub message: String,
    /// Gentle user-facing phrasing.
    pub user_message: String,
}

impl From<&crate::error::Error> for CallError {
    fn from(e: &crate::error::Error) -> Self {
        Self {
            code: e.code().into(),
            message: e.to_string(),
            user_message: e.gentle_message(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Optimizations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The kinds of rewrite the pre-invocation hooks can apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationKind {
    TrimResults,
    ReduceScope,
    CacheHint,
    SuggestAlternative,
    DenyExpensive,
}

impl OptimizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrimResults => "trim-results",
            Self::ReduceScope => "reduce-scope",
            Self::CacheHint => "cache-hint",
            Self::SuggestAlternative => "suggest-alternative",
            Self::DenyExpensive => "deny-expensive",
        }
    }
}

/// A single optimization applied (or suggested) by the rewrite engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimization {
    pub kind: OptimizationKind,
    /// Fingerprint of the call *before* this optimization.
    pub call_fingerprint: String,
    pub estimated_savings: u64,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn fingerprint_stable_across_key_order() {
        let a = ToolCallRequest::new("s", "exa", "search", args(&[
            ("query", json!("rust")),
            ("numResults", json!(10)),
        ]));
        let b = ToolCallRequest::new("s", "exa", "search", args(&[
            ("numResults", json!(10)),
            ("query", json!("rust")),
        ]));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_args() {
        let a = ToolCallRequest::new("s", "exa", "search", args(&[("query", json!("rust"))]));
        let b = ToolCallRequest::new("s", "exa", "search", args(&[("query", json!("go"))]));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn optimization_kind_serializes_kebab_case() {
        let s = serde_json::to_string(&OptimizationKind::DenyExpensive).unwrap();
        assert_eq!(s, "\"deny-expensive\"");
    }
}

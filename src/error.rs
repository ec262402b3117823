//! Engine errors
//!
//! Typed failures for a policy run. The binary wraps these in `anyhow`,
//! library code returns them directly so callers can tell a rejected policy
//! from a provider outage.

use thiserror::Error;

/// Result alias used across the engine
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Error returned by a provider collaborator call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{message}", code_prefix(.code))]
pub struct ProviderError {
    /// Provider specific error code (HTTP status, API error name, ...)
    pub code: Option<String>,
    pub message: String,
}

fn code_prefix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!("[{}] ", c)).unwrap_or_default()
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ProviderError {
    fn from(err: anyhow::Error) -> Self {
        // The HTTP transport tags failures as "API request failed: <status>"
        let message = format!("{:#}", err);
        let code = message
            .split("API request failed: ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .map(|s| s.to_string());
        Self { code, message }
    }
}

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// A filter or action spec failed its schema. Raised before any fetch.
    #[error("Invalid {kind} '{name}': {reason}")]
    Validation {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Listing or describing resources failed
    #[error("Failed to fetch {resource}: {source}")]
    Fetch {
        resource: String,
        #[source]
        source: ProviderError,
    },

    /// A concurrent metrics chunk failed; logged and dropped by the caller
    #[error("Chunk {chunk} failed: {message}")]
    ChunkProcessing { chunk: usize, message: String },

    /// A mutating call failed and its code is not in the ignore list
    #[error("Action '{action}' failed on {resource_id}: {source}")]
    Action {
        action: String,
        resource_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Provider call timed out after {0}s")]
    Timeout(u64),
}

impl EngineError {
    /// Shorthand for a filter validation failure
    pub fn invalid_filter(name: &str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            kind: "filter",
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an action validation failure
    pub fn invalid_action(name: &str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            kind: "action",
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a policy-level validation failure
    pub fn invalid_policy(name: &str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            kind: "policy",
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation { .. })
    }
}

/// Reject keys outside `allowed`, naming every offender.
///
/// `type` is always allowed.
pub fn check_keys(
    kind: &'static str,
    name: &str,
    spec: &serde_json::Map<String, serde_json::Value>,
    allowed: &[&str],
) -> Result<()> {
    let mut unknown: Vec<&str> = spec
        .keys()
        .map(|k| k.as_str())
        .filter(|k| *k != "type" && !allowed.contains(k))
        .collect();

    if unknown.is_empty() {
        return Ok(());
    }

    unknown.sort_unstable();
    Err(EngineError::Validation {
        kind,
        name: name.to_string(),
        reason: format!("unknown keys: {}", unknown.join(", ")),
    })
}

/// Require keys to be present
pub fn require_keys(
    kind: &'static str,
    name: &str,
    spec: &serde_json::Map<String, serde_json::Value>,
    required: &[&str],
) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| !spec.contains_key(*k))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(EngineError::Validation {
        kind,
        name: name.to_string(),
        reason: format!("missing required keys: {}", missing.join(", ")),
    })
}

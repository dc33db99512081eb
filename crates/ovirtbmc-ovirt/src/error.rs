//! Error types for the VM lifecycle client

use thiserror::Error;

/// Error type for VM lifecycle operations
///
/// Cloneable so in-memory implementations can inject the same failure
/// repeatedly.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// Credentials rejected (HTTP 401/403)
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// VM does not exist
    #[error("VM not found: {0}")]
    NotFound(String),

    /// More than one VM carries the name
    #[error("VM name {name} is ambiguous ({count} matches)")]
    Ambiguous { name: String, count: usize },

    /// VM is already in the requested state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success answer from the API
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Body could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration problem
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LifecycleError {
    /// Whether the remote refused because the VM is already in the target state
    pub fn is_conflict(&self) -> bool {
        matches!(self, LifecycleError::Conflict(_))
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Network(_) | LifecycleError::Auth(_) | LifecycleError::Api { .. }
        )
    }
}

impl From<reqwest::Error> for LifecycleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LifecycleError::InvalidResponse(err.to_string())
        } else {
            LifecycleError::Network(err.to_string())
        }
    }
}

/// Result type for VM lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

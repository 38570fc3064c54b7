//! Error types for the research core.

use crate::models::AnalysisStatus;
use thiserror::Error;

/// Why a transient agent failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Network,
    Timeout,
    Server,
    RateLimited,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Network => write!(f, "network error"),
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::Server => write!(f, "server error"),
            TransientKind::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// Classified failure of a single agent call.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Retryable condition that persisted through every attempt.
    #[error("{kind} after {attempts} attempt(s): {message}")]
    Transient {
        kind: TransientKind,
        attempts: u32,
        message: String,
    },

    /// Non-retryable client error (4xx other than 429).
    #[error("HTTP {status}: {message}")]
    Permanent { status: u16, message: String },

    /// The task targets a provider that is not registered.
    #[error("no provider registered under '{0}'")]
    UnknownAgent(String),

    /// The provider answered but the payload could not be used.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors returned by a `StateStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize analysis state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("analysis '{0}' not found")]
    NotFound(String),

    #[error("analysis '{id}' is not ready (status: {status})")]
    NotReady { id: String, status: AnalysisStatus },

    #[error("analysis '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stage output is malformed: {0}")]
    MalformedOutput(String),

    #[error("no research providers are available")]
    NoProviders,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AgentError::Transient {
            kind: TransientKind::RateLimited,
            attempts: 3,
            message: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "rate limited after 3 attempt(s): slow down");

        let err = AgentError::Permanent {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: unauthorized");

        let err = EngineError::NotReady {
            id: "abc".to_string(),
            status: AnalysisStatus::Running,
        };
        assert_eq!(err.to_string(), "analysis 'abc' is not ready (status: RUNNING)");
    }
}

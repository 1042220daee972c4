//! Error types for the engine, the governor and configuration loading

use crate::types::ExecutionId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors returned to callers of the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("client '{client}' exceeded {limit} executions per {}s", window.as_secs())]
    Throttled {
        client: String,
        limit: usize,
        window: Duration,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("sandbox service is shut down")]
    Unavailable,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Detail is logged, never displayed
    #[error("internal error (reference {reference})")]
    Internal {
        reference: ExecutionId,
        detail: String,
    },
}

impl EngineError {
    /// Build an internal error and log its detail under the reference id
    pub fn internal(reference: ExecutionId, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(execution_id = %reference, detail = %detail, "internal sandbox error");
        EngineError::Internal { reference, detail }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, EngineError::Throttled { .. })
    }
}

/// Errors raised while supervising a child process
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("failed to spawn interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reap child {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("process governor is not supported on this platform")]
    Unsupported,
}

/// Errors while loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config {path}: {detail}")]
    Write { path: PathBuf, detail: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_hides_detail() {
        let reference = ExecutionId::new();
        let err = EngineError::internal(reference, "fork failed: EAGAIN");
        let shown = err.to_string();
        assert!(shown.contains(&reference.to_string()));
        assert!(!shown.contains("EAGAIN"));
    }

    #[test]
    fn test_throttled_display() {
        let err = EngineError::Throttled {
            client: "agent".to_string(),
            limit: 3,
            window: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "client 'agent' exceeded 3 executions per 60s");
        assert!(err.is_throttled());
    }
}

//! Typed error hierarchy for the session controller.
//!
//! Two top-level enums cover the two failure domains:
//! - `SessionError` — startup and loop-level failures (configuration,
//!   credentials, repository preparation, cancellation)
//! - `ExecutorError` — per-invocation container failures

use std::time::Duration;
use thiserror::Error;

/// Errors that terminate the session or prevent it from starting.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session configuration: {0}")]
    Config(String),

    #[error("Failed to read session configuration from {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse session configuration: {0}")]
    ConfigParse(#[source] serde_json::Error),

    #[error("Failed to obtain GitHub credentials: {0}")]
    Credential(String),

    #[error("Failed to prepare repository {repository}: {message}")]
    Repository { repository: String, message: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single container invocation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn agent container: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to deliver stdin prompt: {0}")]
    StdinFailed(#[source] std::io::Error),

    #[error("Agent container exited with code {exit_code} after {duration:?}: {stderr_excerpt}")]
    NonZeroExit {
        exit_code: i32,
        duration: Duration,
        stderr_excerpt: String,
    },

    #[error("Agent container cancelled")]
    Cancelled,

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    /// Flattened text used by the fallback classifier's pattern matching.
    pub fn classification_text(&self) -> String {
        self.to_string()
    }
}

//! Injected cloud capabilities.
//!
//! The controller never talks to cloud services directly; it consumes three
//! narrow capabilities that the embedding environment provides. All of them
//! are best-effort: a failing sink degrades to process logs and is never
//! fatal.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Severity for structured cloud log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Structured log sink capability.
#[async_trait]
pub trait CloudLogSink: Send + Sync {
    async fn write(&self, severity: LogSeverity, message: &str, payload: Option<Value>);
    /// Flush buffered records; bounded by the caller's timeout.
    async fn flush(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Fallback sink that forwards to the process logger.
pub struct StdoutLogSink;

#[async_trait]
impl CloudLogSink for StdoutLogSink {
    async fn write(&self, severity: LogSeverity, message: &str, payload: Option<Value>) {
        let payload = payload.unwrap_or(Value::Null);
        match severity {
            LogSeverity::Debug => debug!(%payload, "{message}"),
            LogSeverity::Info => info!(%payload, "{message}"),
            LogSeverity::Warning | LogSeverity::Error => warn!(%payload, "{message}"),
        }
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Secret-manager capability.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String>;
    async fn close(&self);
}

/// VM self-termination capability, invoked best-effort during cleanup.
#[async_trait]
pub trait VmTerminator: Send + Sync {
    async fn terminate(&self) -> Result<()>;
}

/// Bundle of injected capabilities handed to the session at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub log_sink: Arc<dyn CloudLogSink>,
    pub secrets: Option<Arc<dyn SecretFetcher>>,
    pub vm: Option<Arc<dyn VmTerminator>>,
}

impl Capabilities {
    /// Local development defaults: stdout sink, no secrets, no VM.
    pub fn local() -> Self {
        Self {
            log_sink: Arc::new(StdoutLogSink),
            secrets: None,
            vm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdout_sink_never_fails() {
        let sink = StdoutLogSink;
        sink.write(LogSeverity::Debug, "event", Some(serde_json::json!({"k": 1})))
            .await;
        sink.flush().await.unwrap();
        sink.close().await.unwrap();
    }
}

//! Audit trail for agent iterations.
//!
//! Structured events extracted from agent output are appended to a JSONL
//! file in the session state directory and mirrored to the cloud log sink at
//! DEBUG. The audit layer observes; it never drives control flow.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// One structured event from an agent run (a tool call, a text block, a
/// result record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: String,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: &str, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Final per-task line of the session summary artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: String,
    pub phase: String,
    pub workflow_path: String,
    pub pr_number: Option<u64>,
    pub pr_merged: bool,
    pub controller_overrode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub repository: String,
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tasks: Vec<TaskSummary>,
}

/// Append-only JSONL writer for audit events plus the final summary file.
pub struct AuditLog {
    events_path: PathBuf,
    summary_path: PathBuf,
}

impl AuditLog {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            events_path: state_dir.join("audit-events.jsonl"),
            summary_path: state_dir.join("session-summary.json"),
        }
    }

    /// Append events; failures are logged and swallowed (the audit trail is
    /// an observation layer).
    pub fn append(&self, tag: &str, events: &[AuditEvent]) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.try_append(tag, events) {
            warn!(error = %e, "failed to append audit events");
        }
    }

    fn try_append(&self, tag: &str, events: &[AuditEvent]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("open {}", self.events_path.display()))?;
        for event in events {
            let line = serde_json::json!({
                "tag": tag,
                "event": event,
            });
            writeln!(file, "{line}").context("write audit event")?;
        }
        Ok(())
    }

    pub fn write_summary(&self, summary: &SessionSummary) -> Result<()> {
        let json = serde_json::to_string_pretty(summary).context("serialize session summary")?;
        std::fs::write(&self.summary_path, json)
            .with_context(|| format!("write {}", self.summary_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_writes_jsonl_lines() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(
            "iter-1",
            &[
                AuditEvent::new("tool_use", serde_json::json!({"name": "Bash"})),
                AuditEvent::new("text", serde_json::json!({"chars": 120})),
            ],
        );
        let raw = std::fs::read_to_string(dir.path().join("audit-events.jsonl")).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["tag"], "iter-1");
        assert_eq!(first["event"]["kind"], "tool_use");
    }

    #[test]
    fn empty_append_creates_nothing() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("iter-1", &[]);
        assert!(!dir.path().join("audit-events.jsonl").exists());
    }

    #[test]
    fn summary_round_trips() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let summary = SessionSummary {
            session_id: "sess-1".into(),
            repository: "o/r".into(),
            iterations: 4,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            tasks: vec![TaskSummary {
                task: "issue:42".into(),
                phase: "COMPLETE".into(),
                workflow_path: "SIMPLE".into(),
                pr_number: Some(9),
                pr_merged: false,
                controller_overrode: false,
            }],
        };
        log.write_summary(&summary).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("session-summary.json")).unwrap();
        let parsed: SessionSummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.tasks[0].task, "issue:42");
    }
}

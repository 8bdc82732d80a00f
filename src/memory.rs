//! Feedback-propagation memory.
//!
//! An append-only, task-scoped log of signals extracted from agent output and
//! from the review/judge pipeline. Entries carry both the session iteration
//! and the phase iteration they were produced in, so the prompt composer can
//! retrieve exactly the feedback from the previous iteration of the current
//! phase. Pruning is FIFO past `max_entries`.
//!
//! The log is persisted as JSON inside the session state directory so a
//! within-session restart of the controller container observes prior
//! entries. Nothing survives across sessions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::warn;

static MEMORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^AGENTIUM_MEMORY:[ \t]+([A-Z_]+)[ \t]+(.+)$").unwrap()
});

/// Closed set of memory signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// Reviewer analysis captured on an ITERATE verdict.
    EvalFeedback,
    /// The judge's required actions captured on an ITERATE verdict.
    JudgeDirective,
    /// Summary of a phase that advanced cleanly.
    PhaseResult,
    /// Worker's `[ADDRESSED|DECLINED|PARTIAL]` response to a feedback point.
    FeedbackResponse,
    /// Freeform observation the worker wants carried forward.
    Learning,
}

impl SignalType {
    pub fn token(&self) -> &'static str {
        match self {
            SignalType::EvalFeedback => "EVAL_FEEDBACK",
            SignalType::JudgeDirective => "JUDGE_DIRECTIVE",
            SignalType::PhaseResult => "PHASE_RESULT",
            SignalType::FeedbackResponse => "FEEDBACK_RESPONSE",
            SignalType::Learning => "LEARNING",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "EVAL_FEEDBACK" => Some(Self::EvalFeedback),
            "JUDGE_DIRECTIVE" => Some(Self::JudgeDirective),
            "PHASE_RESULT" => Some(Self::PhaseResult),
            "FEEDBACK_RESPONSE" => Some(Self::FeedbackResponse),
            "LEARNING" => Some(Self::Learning),
            _ => None,
        }
    }
}

/// One appended signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Store-wide monotonic sequence; retrieval order within a task is the
    /// insertion order of these values.
    pub seq: u64,
    pub signal: SignalType,
    pub content: String,
    pub session_iteration: u32,
    pub phase_iteration: u32,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Scan agent output for `AGENTIUM_MEMORY: <TYPE> <content>` lines. Unknown
/// types are dropped with a warning so `SignalType` stays closed.
pub fn parse_memory_signals(text: &str) -> Vec<(SignalType, String)> {
    // Stripping fence lines leaves every other line verbatim, so anchored
    // matches outside fences are unaffected.
    let source = crate::signals::strip_code_fences(text);
    let mut out = Vec::new();
    for cap in MEMORY_REGEX.captures_iter(&source) {
        match SignalType::from_token(&cap[1]) {
            Some(signal) => out.push((signal, cap[2].trim().to_string())),
            None => warn!(token = &cap[1], "dropping memory signal with unknown type"),
        }
    }
    out
}

/// Serialized form of the store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    next_seq: u64,
    entries: Vec<MemoryEntry>,
}

/// Append-only log with FIFO pruning and task-scoped reads.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Vec<MemoryEntry>,
    next_seq: u64,
    max_entries: usize,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
            path: None,
        }
    }

    /// Attach a persistence path, loading any state a previous controller
    /// start left behind.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<MemoryFile>(&raw).map_err(Into::into))
            {
                Ok(file) => {
                    self.next_seq = file.next_seq;
                    self.entries = file.entries;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable memory file"),
            }
        }
        self.path = Some(path);
        self
    }

    /// Append parsed signals for one task iteration. Returns how many entries
    /// were pruned to stay within `max_entries`.
    pub fn append(
        &mut self,
        signals: Vec<(SignalType, String)>,
        session_iteration: u32,
        phase_iteration: u32,
        task_id: &str,
    ) -> usize {
        for (signal, content) in signals {
            let entry = MemoryEntry {
                seq: self.next_seq,
                signal,
                content,
                session_iteration,
                phase_iteration,
                task_id: task_id.to_string(),
                timestamp: Utc::now(),
            };
            self.next_seq += 1;
            self.entries.push(entry);
        }
        let mut pruned = 0;
        while self.entries.len() > self.max_entries {
            self.entries.remove(0);
            pruned += 1;
        }
        if pruned > 0 {
            warn!(pruned, "memory store pruned oldest entries");
        }
        self.save();
        pruned
    }

    /// Feedback appended for the previous iteration of the task's current
    /// phase: `EvalFeedback` and `JudgeDirective` entries with
    /// `phase_iteration == current_phase_iteration - 1`, in insertion order.
    pub fn previous_iteration_feedback(
        &self,
        task_id: &str,
        current_phase_iteration: u32,
    ) -> Vec<&MemoryEntry> {
        let Some(wanted) = current_phase_iteration.checked_sub(1) else {
            return Vec::new();
        };
        self.entries
            .iter()
            .filter(|e| {
                e.task_id == task_id
                    && e.phase_iteration == wanted
                    && matches!(
                        e.signal,
                        SignalType::EvalFeedback | SignalType::JudgeDirective
                    )
            })
            .collect()
    }

    /// All entries for a task, insertion order.
    pub fn entries_for_task(&self, task_id: &str) -> Vec<&MemoryEntry> {
        self.entries.iter().filter(|e| e.task_id == task_id).collect()
    }

    /// Drop every entry of one type for one task. Used on phase advance to
    /// keep stale `EvalFeedback` from leaking into the next phase. Like every
    /// other read and write, the clear is task-scoped: advancing one task
    /// must not wipe feedback another task is about to consume.
    pub fn clear_by_type(&mut self, signal: SignalType, task_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.signal == signal && e.task_id == task_id));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.save();
        }
        removed
    }

    /// Render a recent-memory markdown section for prompts that have no
    /// handoff context to lean on.
    pub fn build_context(&self, task_id: &str) -> String {
        const RECENT: usize = 15;
        let entries = self.entries_for_task(task_id);
        if entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Recent Memory\n\n");
        let start = entries.len().saturating_sub(RECENT);
        for entry in &entries[start..] {
            out.push_str(&format!(
                "- [{} iter {}] {}\n",
                entry.signal.token(),
                entry.phase_iteration,
                entry.content
            ));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best-effort persistence; the in-memory store is authoritative.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(error = %e, "failed to persist memory store");
        }
    }

    fn try_save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = MemoryFile {
            next_seq: self.next_seq,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize memory store")?;
        std::fs::write(path, json)
            .with_context(|| format!("write memory store to {}", path.display()))?;
        Ok(())
    }
}

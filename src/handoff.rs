//! Structured phase handoff.
//!
//! Workers emit an `AGENTIUM_HANDOFF` marker followed by a JSON payload whose
//! schema depends on the phase. The store keys entries by
//! `(task, phase, phase-iteration)` and never overwrites an occupied key; a
//! later iteration writes a new record. The prompt composer reads the latest
//! entry of the prior phase to seed the next phase's prompt.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::phases::TaskPhase;

/// Structured output of a PLAN iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub implementation_steps: Vec<String>,
    #[serde(default)]
    pub testing_approach: String,
}

/// Structured output of an IMPLEMENT iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementOutput {
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub draft_pr_number: Option<u64>,
    #[serde(default)]
    pub draft_pr_url: Option<String>,
}

/// Structured output of a DOCS iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocsOutput {
    #[serde(default)]
    pub files_updated: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Structured output of a VERIFY iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutput {
    #[serde(default)]
    pub checks_passed: Vec<String>,
    #[serde(default)]
    pub remaining_failures: Vec<String>,
}

/// One phase's structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffOutput {
    Plan(PlanOutput),
    Implement(ImplementOutput),
    Docs(DocsOutput),
    Verify(VerifyOutput),
}

impl HandoffOutput {
    pub fn phase(&self) -> TaskPhase {
        match self {
            HandoffOutput::Plan(_) => TaskPhase::Plan,
            HandoffOutput::Implement(_) => TaskPhase::Implement,
            HandoffOutput::Docs(_) => TaskPhase::Docs,
            HandoffOutput::Verify(_) => TaskPhase::Verify,
        }
    }

    /// Markdown rendering used as the next phase's "Phase Input" section.
    pub fn render_markdown(&self) -> String {
        match self {
            HandoffOutput::Plan(plan) => {
                let mut out = format!("### Approved Plan\n\n{}\n", plan.summary);
                if !plan.files_to_modify.is_empty() {
                    out.push_str("\n**Files to modify:**\n");
                    for f in &plan.files_to_modify {
                        out.push_str(&format!("- {f}\n"));
                    }
                }
                if !plan.implementation_steps.is_empty() {
                    out.push_str("\n**Implementation steps:**\n");
                    for (i, step) in plan.implementation_steps.iter().enumerate() {
                        out.push_str(&format!("{}. {step}\n", i + 1));
                    }
                }
                if !plan.testing_approach.is_empty() {
                    out.push_str(&format!("\n**Testing approach:** {}\n", plan.testing_approach));
                }
                out
            }
            HandoffOutput::Implement(imp) => {
                let mut out = format!("### Implementation State\n\nBranch: `{}`\n", imp.branch_name);
                if !imp.commits.is_empty() {
                    out.push_str("\n**Commits:**\n");
                    for c in &imp.commits {
                        out.push_str(&format!("- {c}\n"));
                    }
                }
                if let Some(n) = imp.draft_pr_number {
                    out.push_str(&format!("\nDraft PR: #{n}"));
                    if let Some(url) = &imp.draft_pr_url {
                        out.push_str(&format!(" ({url})"));
                    }
                    out.push('\n');
                }
                out
            }
            HandoffOutput::Docs(docs) => {
                let mut out = format!("### Documentation Update\n\n{}\n", docs.summary);
                if !docs.files_updated.is_empty() {
                    out.push_str("\n**Files updated:**\n");
                    for f in &docs.files_updated {
                        out.push_str(&format!("- {f}\n"));
                    }
                }
                out
            }
            HandoffOutput::Verify(verify) => {
                let mut out = String::from("### Verification State\n");
                if !verify.checks_passed.is_empty() {
                    out.push_str("\n**Checks passed:**\n");
                    for c in &verify.checks_passed {
                        out.push_str(&format!("- {c}\n"));
                    }
                }
                if !verify.remaining_failures.is_empty() {
                    out.push_str("\n**Remaining failures:**\n");
                    for f in &verify.remaining_failures {
                        out.push_str(&format!("- {f}\n"));
                    }
                }
                out
            }
        }
    }
}

/// Find the `AGENTIUM_HANDOFF` marker and parse the JSON payload that follows
/// it, fenced or bare, against the schema for `phase`.
///
/// Returns `None` when no marker is present, `Some(Err)` for a marker with a
/// malformed payload (the caller logs and skips — memory parsing still
/// happens), and `Some(Ok)` for a valid handoff.
pub fn parse_handoff_block(text: &str, phase: TaskPhase) -> Option<Result<HandoffOutput>> {
    let marker_pos = text
        .lines()
        .position(|line| line.trim() == "AGENTIUM_HANDOFF")?;
    let rest: Vec<&str> = text.lines().skip(marker_pos + 1).collect();
    let payload = extract_json_payload(&rest);
    Some(parse_payload(&payload, phase))
}

/// Collect the JSON object following the marker. A fenced block is preferred;
/// otherwise lines are consumed until braces balance.
fn extract_json_payload(lines: &[&str]) -> String {
    let mut in_fence = false;
    let mut depth: i32 = 0;
    let mut started = false;
    let mut out = String::new();

    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            if in_fence && started {
                break;
            }
            in_fence = true;
            continue;
        }
        if !started && trimmed.is_empty() {
            continue;
        }
        started = true;
        out.push_str(line);
        out.push('\n');
        depth += line.matches('{').count() as i32;
        depth -= line.matches('}').count() as i32;
        if depth <= 0 {
            break;
        }
    }
    out
}

fn parse_payload(payload: &str, phase: TaskPhase) -> Result<HandoffOutput> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("handoff marker with empty payload"));
    }
    let output = match phase {
        TaskPhase::Plan => HandoffOutput::Plan(
            serde_json::from_str(trimmed).context("malformed PLAN handoff payload")?,
        ),
        TaskPhase::Implement => HandoffOutput::Implement(
            serde_json::from_str(trimmed).context("malformed IMPLEMENT handoff payload")?,
        ),
        TaskPhase::Docs => HandoffOutput::Docs(
            serde_json::from_str(trimmed).context("malformed DOCS handoff payload")?,
        ),
        TaskPhase::Verify => HandoffOutput::Verify(
            serde_json::from_str(trimmed).context("malformed VERIFY handoff payload")?,
        ),
        other => return Err(anyhow!("phase {other} does not produce handoffs")),
    };
    Ok(output)
}

/// Per-session store of structured phase outputs.
#[derive(Debug, Default)]
pub struct HandoffStore {
    entries: BTreeMap<(String, TaskPhase, u32), HandoffOutput>,
}

impl HandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an output. First write wins for an occupied key; returns
    /// whether the entry was stored.
    pub fn record(
        &mut self,
        task_id: &str,
        phase: TaskPhase,
        phase_iteration: u32,
        output: HandoffOutput,
    ) -> bool {
        let key = (task_id.to_string(), phase, phase_iteration);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, output);
        true
    }

    /// The entry with the highest phase-iteration for `(task, phase)`.
    pub fn latest_for_phase(
        &self,
        task_id: &str,
        phase: TaskPhase,
    ) -> Option<(&HandoffOutput, u32)> {
        self.entries
            .range(
                (task_id.to_string(), phase, 0)..=(task_id.to_string(), phase, u32::MAX),
            )
            .next_back()
            .map(|((_, _, iteration), output)| (output, *iteration))
    }

    pub fn get(
        &self,
        task_id: &str,
        phase: TaskPhase,
        phase_iteration: u32,
    ) -> Option<&HandoffOutput> {
        self.entries
            .get(&(task_id.to_string(), phase, phase_iteration))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

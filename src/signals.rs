//! Signal parsing from agent output.
//!
//! All controller-visible signals are line-oriented and anchored at line
//! start, tolerant to surrounding markdown code fences:
//! - `AGENTIUM_STATUS: <TOKEN> [message]` — phase-advance hint
//! - `AGENTIUM_EVAL: (ADVANCE|ITERATE|BLOCKED) [text]` — judge verdict
//! - `AGENTIUM_COMPLEXITY: (SIMPLE|COMPLEX)` — complexity assessment
//!
//! The judge parser fails closed: no anchored match means `BLOCKED`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^AGENTIUM_STATUS:[ \t]+([A-Z_]+)[ \t]*(.*)$").unwrap()
});

static EVAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^AGENTIUM_EVAL:[ \t]+(ADVANCE|ITERATE|BLOCKED)[ \t]*(.*)$").unwrap()
});

static COMPLEXITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^AGENTIUM_COMPLEXITY:[ \t]+(SIMPLE|COMPLEX)[ \t]*$").unwrap()
});

static REVIEW_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^AGENTIUM_REVIEW:[ \t]+(APPROVE|REQUEST_CHANGES)[ \t]*(.*)$").unwrap()
});

/// Status tokens a worker may emit to hint at its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    TestsRunning,
    TestsPassed,
    TestsFailed,
    PrCreated,
    Pushed,
    Complete,
    NothingToDo,
    Blocked,
    Failed,
    Analyzing,
}

impl AgentStatus {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "TESTS_RUNNING" => Some(Self::TestsRunning),
            "TESTS_PASSED" => Some(Self::TestsPassed),
            "TESTS_FAILED" => Some(Self::TestsFailed),
            "PR_CREATED" => Some(Self::PrCreated),
            "PUSHED" => Some(Self::Pushed),
            "COMPLETE" => Some(Self::Complete),
            "NOTHING_TO_DO" => Some(Self::NothingToDo),
            "BLOCKED" => Some(Self::Blocked),
            "FAILED" => Some(Self::Failed),
            "ANALYZING" => Some(Self::Analyzing),
            _ => None,
        }
    }
}

/// A parsed `AGENTIUM_STATUS` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSignal {
    pub status: AgentStatus,
    pub message: String,
}

/// Extract the agent's status hint. When a run emits several status lines the
/// last one wins, as it reflects the final state of the iteration. Unknown
/// tokens are skipped.
pub fn parse_agent_status(text: &str) -> Option<StatusSignal> {
    let mut found = None;
    for cap in STATUS_REGEX.captures_iter(text) {
        if let Some(status) = AgentStatus::from_token(&cap[1]) {
            found = Some(StatusSignal {
                status,
                message: cap[2].trim().to_string(),
            });
        }
    }
    found
}

/// The judge's decision for a completed phase iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JudgeVerdict {
    Advance,
    Iterate,
    Blocked,
}

impl JudgeVerdict {
    pub fn token(&self) -> &'static str {
        match self {
            JudgeVerdict::Advance => "ADVANCE",
            JudgeVerdict::Iterate => "ITERATE",
            JudgeVerdict::Blocked => "BLOCKED",
        }
    }
}

/// A parsed `AGENTIUM_EVAL` line, or the fail-closed default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictSignal {
    pub verdict: JudgeVerdict,
    pub feedback: String,
    /// False when no anchored eval line was found and the verdict defaulted
    /// to BLOCKED.
    pub signal_found: bool,
}

/// Parse the judge verdict. The match is attempted on the raw output first,
/// then after stripping code fences; the first anchored match wins. Absence
/// of a match is BLOCKED.
pub fn parse_judge_verdict(text: &str) -> VerdictSignal {
    if let Some(found) = first_eval_match(text) {
        return found;
    }
    let stripped = strip_code_fences(text);
    if let Some(found) = first_eval_match(&stripped) {
        return found;
    }
    VerdictSignal {
        verdict: JudgeVerdict::Blocked,
        feedback: String::new(),
        signal_found: false,
    }
}

fn first_eval_match(text: &str) -> Option<VerdictSignal> {
    EVAL_REGEX.captures(text).map(|cap| {
        let verdict = match &cap[1] {
            "ADVANCE" => JudgeVerdict::Advance,
            "ITERATE" => JudgeVerdict::Iterate,
            _ => JudgeVerdict::Blocked,
        };
        VerdictSignal {
            verdict,
            feedback: cap[2].trim().to_string(),
            signal_found: true,
        }
    })
}

/// The reviewer's recommendation, emitted ahead of the judge's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewerRecommendation {
    Approve,
    RequestChanges,
}

/// Parse the reviewer's `AGENTIUM_REVIEW` line: raw output first, then after
/// fence stripping; first anchored match wins. Returns `None` when the
/// reviewer made no parseable recommendation — the judge still decides, but
/// an override cannot be established.
pub fn parse_reviewer_recommendation(text: &str) -> Option<ReviewerRecommendation> {
    if let Some(cap) = REVIEW_REGEX.captures(text) {
        return Some(recommendation_from_token(&cap[1]));
    }
    let stripped = strip_code_fences(text);
    REVIEW_REGEX
        .captures(&stripped)
        .map(|cap| recommendation_from_token(&cap[1]))
}

fn recommendation_from_token(token: &str) -> ReviewerRecommendation {
    if token == "APPROVE" {
        ReviewerRecommendation::Approve
    } else {
        ReviewerRecommendation::RequestChanges
    }
}

/// Complexity assessment for an issue at PLAN iteration 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

/// Parse the assessor's output. Unparseable output is COMPLEX so the full
/// review loop stays engaged.
pub fn parse_complexity(text: &str) -> Complexity {
    if let Some(cap) = COMPLEXITY_REGEX.captures(text) {
        return complexity_from_token(&cap[1]);
    }
    let stripped = strip_code_fences(text);
    match COMPLEXITY_REGEX.captures(&stripped) {
        Some(cap) => complexity_from_token(&cap[1]),
        None => Complexity::Complex,
    }
}

fn complexity_from_token(token: &str) -> Complexity {
    if token == "SIMPLE" {
        Complexity::Simple
    } else {
        Complexity::Complex
    }
}

/// Drop triple-backtick fence lines so signals wrapped in markdown code
/// blocks still anchor at line start.
pub fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

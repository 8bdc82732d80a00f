//! Task phases, workflow paths, and per-phase iteration budgets.
//!
//! Phases are a closed set; every `match` over them is exhaustive so that
//! adding a phase forces each consumer to be revisited.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A coarse stage in a task's lifecycle.
///
/// Issue tasks travel `PLAN → IMPLEMENT → DOCS → VERIFY → COMPLETE` (the
/// COMPLEX chain) or `PLAN → IMPLEMENT → COMPLETE` (SIMPLE). PR tasks travel
/// `ANALYZE → REVIEW → PUSH → COMPLETE`. `BLOCKED` and `NOTHING_TO_DO` are
/// terminal from anywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    Plan,
    Implement,
    Docs,
    Verify,
    Analyze,
    Review,
    Push,
    Complete,
    Blocked,
    NothingToDo,
}

impl TaskPhase {
    /// Token form used in config keys, prompts, and signals.
    pub fn token(&self) -> &'static str {
        match self {
            TaskPhase::Plan => "PLAN",
            TaskPhase::Implement => "IMPLEMENT",
            TaskPhase::Docs => "DOCS",
            TaskPhase::Verify => "VERIFY",
            TaskPhase::Analyze => "ANALYZE",
            TaskPhase::Review => "REVIEW",
            TaskPhase::Push => "PUSH",
            TaskPhase::Complete => "COMPLETE",
            TaskPhase::Blocked => "BLOCKED",
            TaskPhase::NothingToDo => "NOTHING_TO_DO",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PLAN" => Some(TaskPhase::Plan),
            "IMPLEMENT" => Some(TaskPhase::Implement),
            "DOCS" => Some(TaskPhase::Docs),
            "VERIFY" => Some(TaskPhase::Verify),
            "ANALYZE" => Some(TaskPhase::Analyze),
            "REVIEW" => Some(TaskPhase::Review),
            "PUSH" => Some(TaskPhase::Push),
            "COMPLETE" => Some(TaskPhase::Complete),
            "BLOCKED" => Some(TaskPhase::Blocked),
            "NOTHING_TO_DO" => Some(TaskPhase::NothingToDo),
            _ => None,
        }
    }

    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Complete | TaskPhase::Blocked | TaskPhase::NothingToDo
        )
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Chosen once at PLAN iteration 1 by the complexity assessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPath {
    #[default]
    Unset,
    Simple,
    Complex,
}

impl WorkflowPath {
    pub fn token(&self) -> &'static str {
        match self {
            WorkflowPath::Unset => "UNSET",
            WorkflowPath::Simple => "SIMPLE",
            WorkflowPath::Complex => "COMPLEX",
        }
    }
}

/// The kind of source a task was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Issue,
    Pr,
}

impl TaskKind {
    pub fn token(&self) -> &'static str {
        match self {
            TaskKind::Issue => "issue",
            TaskKind::Pr => "pr",
        }
    }

    /// Phase every task of this kind starts in.
    pub fn initial_phase(&self) -> TaskPhase {
        match self {
            TaskKind::Issue => TaskPhase::Plan,
            TaskKind::Pr => TaskPhase::Analyze,
        }
    }
}

/// The phase that follows `phase` for a task of `kind` on `path`, or `None`
/// when `phase` is terminal.
pub fn next_phase(phase: TaskPhase, path: WorkflowPath, kind: TaskKind) -> Option<TaskPhase> {
    match kind {
        TaskKind::Issue => match phase {
            TaskPhase::Plan => Some(TaskPhase::Implement),
            TaskPhase::Implement => match path {
                WorkflowPath::Simple => Some(TaskPhase::Complete),
                WorkflowPath::Complex | WorkflowPath::Unset => Some(TaskPhase::Docs),
            },
            TaskPhase::Docs => Some(TaskPhase::Verify),
            TaskPhase::Verify => Some(TaskPhase::Complete),
            // PR-chain phases never occur on issue tasks; close the cycle
            // defensively rather than panic.
            TaskPhase::Analyze | TaskPhase::Review | TaskPhase::Push => Some(TaskPhase::Complete),
            TaskPhase::Complete | TaskPhase::Blocked | TaskPhase::NothingToDo => None,
        },
        TaskKind::Pr => match phase {
            TaskPhase::Analyze => Some(TaskPhase::Review),
            TaskPhase::Review => Some(TaskPhase::Push),
            TaskPhase::Push => Some(TaskPhase::Complete),
            TaskPhase::Plan | TaskPhase::Implement | TaskPhase::Docs | TaskPhase::Verify => {
                Some(TaskPhase::Complete)
            }
            TaskPhase::Complete | TaskPhase::Blocked | TaskPhase::NothingToDo => None,
        },
    }
}

/// Per-phase iteration budgets: config overrides layered over phase-dependent
/// defaults. Override keys are `"<PHASE>"` or `"<PHASE>_<PATH>"`; the most
/// specific key wins.
#[derive(Debug, Clone, Default)]
pub struct BudgetTable {
    overrides: HashMap<String, u32>,
}

impl BudgetTable {
    pub fn new(overrides: HashMap<String, u32>) -> Self {
        Self { overrides }
    }

    pub fn budget_for(&self, phase: TaskPhase, path: WorkflowPath) -> u32 {
        let specific = format!("{}_{}", phase.token(), path.token());
        if let Some(&n) = self.overrides.get(&specific) {
            return n.max(1);
        }
        if let Some(&n) = self.overrides.get(phase.token()) {
            return n.max(1);
        }
        default_budget(phase, path)
    }
}

fn default_budget(phase: TaskPhase, path: WorkflowPath) -> u32 {
    let simple = path == WorkflowPath::Simple;
    match phase {
        TaskPhase::Plan => {
            if simple {
                1
            } else {
                3
            }
        }
        TaskPhase::Implement => {
            if simple {
                2
            } else {
                3
            }
        }
        TaskPhase::Docs => 2,
        TaskPhase::Verify => 3,
        TaskPhase::Analyze | TaskPhase::Review | TaskPhase::Push => 2,
        TaskPhase::Complete | TaskPhase::Blocked | TaskPhase::NothingToDo => 1,
    }
}

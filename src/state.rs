//! In-memory registry of per-task lifecycle state.
//!
//! The store is populated once at session initialization and mutated only by
//! the phase machine (single control-loop writer). Tasks are never removed
//! before session end.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::phases::{BudgetTable, TaskKind, TaskPhase, WorkflowPath};

/// Mutable lifecycle state for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub kind: TaskKind,
    pub phase: TaskPhase,
    /// 1-indexed iteration counter within the current phase; resets to 1 on
    /// every phase transition.
    pub phase_iteration: u32,
    /// Budget for the current phase, fixed at phase entry.
    pub max_phase_iterations: u32,
    pub test_retries: u32,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub pr_merged: bool,
    pub draft_pr_created: bool,
    /// Set when the controller forced a phase advance on budget exhaustion.
    pub controller_overrode: bool,
    /// Set when the judge advanced against the reviewer's recommendation.
    pub judge_overrode_reviewer: bool,
    pub workflow_path: WorkflowPath,
    /// Branch to fork from instead of the default branch, when set.
    pub parent_branch: Option<String>,
}

impl TaskState {
    pub fn new(id: &str, kind: TaskKind, budgets: &BudgetTable) -> Self {
        let phase = kind.initial_phase();
        Self {
            id: id.to_string(),
            kind,
            phase,
            phase_iteration: 1,
            max_phase_iterations: budgets.budget_for(phase, WorkflowPath::Unset),
            test_retries: 0,
            pr_number: None,
            pr_url: None,
            pr_merged: false,
            draft_pr_created: false,
            controller_overrode: false,
            judge_overrode_reviewer: false,
            workflow_path: WorkflowPath::Unset,
            parent_branch: None,
        }
    }

    /// Composite key, e.g. `issue:42` or `pr:17`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.token(), self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// The PR for this task reached COMPLETE without clean judge approval.
    pub fn nomerge(&self) -> bool {
        self.controller_overrode || self.judge_overrode_reviewer
    }

    /// Move to `phase`, resetting the iteration counter and pinning the new
    /// phase's budget. Transitions out of a terminal phase are ignored.
    pub fn enter_phase(&mut self, phase: TaskPhase, budgets: &BudgetTable) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = phase;
        self.phase_iteration = 1;
        self.max_phase_iterations = budgets.budget_for(phase, self.workflow_path);
    }
}

/// Composite-key map over every configured task, preserving config order for
/// enumeration and round-robin scheduling.
#[derive(Debug, Default)]
pub struct TaskStateStore {
    order: Vec<String>,
    tasks: HashMap<String, TaskState>,
}

impl TaskStateStore {
    /// Seed the store: every issue starts in PLAN, every PR in ANALYZE.
    pub fn new(issues: &[String], prs: &[String], budgets: &BudgetTable) -> Self {
        let mut store = Self::default();
        for id in issues {
            store.insert(TaskState::new(id, TaskKind::Issue, budgets));
        }
        for id in prs {
            store.insert(TaskState::new(id, TaskKind::Pr, budgets));
        }
        store
    }

    fn insert(&mut self, task: TaskState) {
        let key = task.key();
        if self.tasks.insert(key.clone(), task).is_none() {
            self.order.push(key);
        }
    }

    pub fn get(&self, key: &str) -> Option<&TaskState> {
        self.tasks.get(key)
    }

    /// Apply a mutation to one task. Returns false for an unknown key.
    pub fn update<F>(&mut self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskState),
    {
        match self.tasks.get_mut(key) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    /// Keys in config order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Tasks in config order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskState> {
        self.order.iter().filter_map(|k| self.tasks.get(k))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn all_terminal(&self) -> bool {
        self.iter().all(TaskState::is_terminal)
    }

    /// The next non-terminal key at or after `cursor` (wrapping), for
    /// round-robin task selection.
    pub fn next_active(&self, cursor: usize) -> Option<(usize, String)> {
        let n = self.order.len();
        for offset in 0..n {
            let idx = (cursor + offset) % n;
            let key = &self.order[idx];
            if let Some(task) = self.tasks.get(key)
                && !task.is_terminal()
            {
                return Some((idx, key.clone()));
            }
        }
        None
    }
}

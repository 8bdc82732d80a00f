//! Per-task phase state machine.
//!
//! `PhaseMachine::run_task_iteration` drives exactly one iteration of one
//! task: compose the prompt, run the worker container (or a delegated
//! sub-agent), fold the agent's status into the task state, consult the
//! complexity assessor at PLAN iteration 1, and let the review/judge pipeline
//! decide between advancing the phase, iterating it, or blocking the task.
//! Budget exhaustion forces an advance with the controller-override flag set.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::ModelRouting;
use crate::config::SessionConfig;
use crate::delegation::DelegationRouter;
use crate::executor::{ContainerExecutor, ExecRequest, IterationResult, TaskContext};
use crate::github::{ExistingWork, GhClient, IssueDetails};
use crate::handoff::HandoffStore;
use crate::memory::{MemoryStore, SignalType};
use crate::phases::{BudgetTable, TaskKind, TaskPhase, WorkflowPath, next_phase};
use crate::pr::PrManager;
use crate::prompt::{PromptComposer, PromptInputs};
use crate::review::ReviewJudgePipeline;
use crate::signals::{AgentStatus, Complexity, JudgeVerdict, parse_complexity};
use crate::state::{TaskState, TaskStateStore};

/// Consecutive test failures tolerated before a task is blocked.
const TEST_RETRY_LIMIT: u32 = 3;

/// Orders the prior phases consulted for handoff context, nearest first.
fn prior_phases(phase: TaskPhase) -> &'static [TaskPhase] {
    match phase {
        TaskPhase::Implement => &[TaskPhase::Plan],
        TaskPhase::Docs => &[TaskPhase::Implement, TaskPhase::Plan],
        TaskPhase::Verify => &[TaskPhase::Docs, TaskPhase::Implement, TaskPhase::Plan],
        _ => &[],
    }
}

/// The state machine and its collaborators for one session.
pub struct PhaseMachine {
    config: Arc<SessionConfig>,
    budgets: BudgetTable,
    state: TaskStateStore,
    memory: Arc<Mutex<MemoryStore>>,
    handoff: Arc<Mutex<HandoffStore>>,
    executor: Arc<ContainerExecutor>,
    pipeline: ReviewJudgePipeline,
    routing: ModelRouting,
    composer: PromptComposer,
    pr: PrManager,
    gh: GhClient,
    delegation: DelegationRouter,
    system_prompt: String,
    issue_cache: HashMap<String, IssueDetails>,
    existing_work: HashMap<String, Option<ExistingWork>>,
}

impl PhaseMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SessionConfig>,
        budgets: BudgetTable,
        state: TaskStateStore,
        memory: Arc<Mutex<MemoryStore>>,
        handoff: Arc<Mutex<HandoffStore>>,
        executor: Arc<ContainerExecutor>,
        pipeline: ReviewJudgePipeline,
        routing: ModelRouting,
        composer: PromptComposer,
        pr: PrManager,
        gh: GhClient,
        delegation: DelegationRouter,
        system_prompt: String,
    ) -> Self {
        Self {
            config,
            budgets,
            state,
            memory,
            handoff,
            executor,
            pipeline,
            routing,
            composer,
            pr,
            gh,
            delegation,
            system_prompt,
            issue_cache: HashMap::new(),
            existing_work: HashMap::new(),
        }
    }

    pub fn state(&self) -> &TaskStateStore {
        &self.state
    }

    /// Drive one iteration of one task.
    pub async fn run_task_iteration(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        session_iteration: u32,
    ) -> Result<()> {
        let Some(task) = self.state.get(task_key).cloned() else {
            warn!(task = task_key, "unknown task key");
            return Ok(());
        };
        if task.is_terminal() {
            return Ok(());
        }

        info!(
            task = task_key,
            phase = %task.phase,
            iteration = task.phase_iteration,
            of = task.max_phase_iterations,
            "starting task iteration"
        );

        self.refresh_task_context(cancel, &task).await;

        let prompt = self.compose_worker_prompt(&task).await;
        let ctx = TaskContext {
            task_id: task_key.to_string(),
            phase: task.phase,
            session_iteration,
            phase_iteration: task.phase_iteration,
        };

        let run = match self.delegation.delegate(cancel, &ctx, &prompt).await {
            Some(result) => result,
            None => {
                let req = ExecRequest::worker(
                    &self.config.agent,
                    format!("{}\n\n---\n\n{prompt}", self.system_prompt),
                    &format!("{task_key}-{}-{}", task.phase.token(), task.phase_iteration),
                )
                .with_route(&self.routing.worker_route(task.phase));
                self.executor.run_with_fallback(cancel, req, &ctx).await
            }
        };

        let result = match run {
            Ok(result) => result,
            Err(crate::errors::ExecutorError::Cancelled) => {
                return Err(crate::errors::SessionError::Cancelled.into());
            }
            Err(e) => {
                // Non-fatal per iteration: burn the iteration and let the
                // budget accounting decide what happens next.
                warn!(task = task_key, error = %e, "iteration failed in the executor");
                self.iterate_or_force_advance(cancel, task_key, session_iteration)
                    .await;
                return Ok(());
            }
        };

        self.adopt_handoff_pr(task_key).await;
        self.maybe_create_draft_pr(cancel, task_key).await;

        if self.apply_status(cancel, task_key, &result).await {
            return Ok(());
        }

        // Complexity assessor: once, after the first PLAN iteration.
        if task.kind == TaskKind::Issue
            && task.phase == TaskPhase::Plan
            && task.phase_iteration == 1
            && task.workflow_path == WorkflowPath::Unset
        {
            let complexity = self.assess_complexity(cancel, &ctx, &result).await;
            self.apply_workflow_path(cancel, task_key, complexity).await;
            if complexity == Complexity::Simple {
                // SIMPLE skips reviewer and judge for PLAN entirely.
                self.advance_task(cancel, task_key, session_iteration).await;
                return Ok(());
            }
        }

        if !self.config.phase_loop.enabled {
            if result.success {
                self.advance_task(cancel, task_key, session_iteration).await;
            } else {
                self.iterate_or_force_advance(cancel, task_key, session_iteration)
                    .await;
            }
            return Ok(());
        }

        let current = self
            .state
            .get(task_key)
            .cloned()
            .unwrap_or(task);
        let outcome = self
            .pipeline
            .evaluate(cancel, &current, session_iteration, &result.text_content)
            .await?;

        match outcome.verdict {
            JudgeVerdict::Advance => {
                if outcome.judge_overrode_reviewer {
                    // NOMERGE: the PR may complete, but it stays out of
                    // auto-merge and ready-for-review.
                    self.state
                        .update(task_key, |t| t.judge_overrode_reviewer = true);
                }
                self.advance_task(cancel, task_key, session_iteration).await;
            }
            JudgeVerdict::Iterate => {
                self.iterate_or_force_advance(cancel, task_key, session_iteration)
                    .await;
            }
            JudgeVerdict::Blocked => {
                info!(task = task_key, "judge blocked the task");
                self.state.update(task_key, |t| {
                    t.enter_phase(TaskPhase::Blocked, &self.budgets);
                });
            }
        }
        Ok(())
    }

    /// Cache issue details and the one-shot existing-work probe.
    async fn refresh_task_context(&mut self, cancel: &CancellationToken, task: &TaskState) {
        let key = task.key();
        if task.kind != TaskKind::Issue {
            return;
        }
        if !self.issue_cache.contains_key(&key) {
            match self.gh.issue_details(cancel, &task.id).await {
                Ok(details) => {
                    self.issue_cache.insert(key.clone(), details);
                }
                Err(e) => warn!(task = %key, error = %e, "could not fetch issue details"),
            }
        }
        if !self.existing_work.contains_key(&key) {
            let found = match self.gh.find_existing_work(cancel, &task.id).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(task = %key, error = %e, "existing-work probe failed");
                    None
                }
            };
            if let Some(work) = &found {
                info!(task = %key, branch = %work.branch, "existing work detected");
            }
            self.existing_work.insert(key, found);
        }
    }

    async fn compose_worker_prompt(&self, task: &TaskState) -> String {
        let key = task.key();
        let handoff = self.handoff.lock().await;
        let memory = self.memory.lock().await;

        let phase_input = prior_phases(task.phase)
            .iter()
            .find_map(|phase| handoff.latest_for_phase(&key, *phase))
            .map(|(output, _)| output.render_markdown());

        let memory_context = if phase_input.is_none() {
            memory.build_context(&key)
        } else {
            String::new()
        };

        let feedback = memory.previous_iteration_feedback(&key, task.phase_iteration);
        let judge_directives = feedback
            .iter()
            .filter(|e| e.signal == SignalType::JudgeDirective)
            .map(|e| e.content.clone())
            .collect();
        let reviewer_analysis = feedback
            .iter()
            .filter(|e| e.signal == SignalType::EvalFeedback)
            .map(|e| e.content.clone())
            .collect();

        let current_plan = (task.phase == TaskPhase::Plan && task.phase_iteration > 1)
            .then(|| {
                handoff
                    .latest_for_phase(&key, TaskPhase::Plan)
                    .map(|(output, _)| output.render_markdown())
            })
            .flatten();

        let inputs = PromptInputs {
            task: Some(task),
            issue: self.issue_cache.get(&key),
            existing_work: self.existing_work.get(&key).and_then(Option::as_ref),
            phase_input,
            memory_context,
            judge_directives,
            reviewer_analysis,
            current_plan,
        };
        self.composer.compose(&inputs)
    }

    /// Pick up a PR the worker reported through its IMPLEMENT handoff.
    async fn adopt_handoff_pr(&mut self, task_key: &str) {
        let Some(task) = self.state.get(task_key) else {
            return;
        };
        if task.pr_number.is_some() {
            return;
        }
        let handoff = self.handoff.lock().await;
        if let Some((crate::handoff::HandoffOutput::Implement(imp), _)) =
            handoff.latest_for_phase(task_key, TaskPhase::Implement)
            && let Some(number) = imp.draft_pr_number
        {
            let url = imp.draft_pr_url.clone();
            drop(handoff);
            info!(task = task_key, pr = number, "adopting PR reported in handoff");
            self.state.update(task_key, |t| {
                t.pr_number = Some(number);
                t.pr_url = url;
                t.draft_pr_created = true;
            });
        }
    }

    async fn maybe_create_draft_pr(&mut self, cancel: &CancellationToken, task_key: &str) {
        let Some(task) = self.state.get(task_key).cloned() else {
            return;
        };
        if task.kind != TaskKind::Issue || task.phase != TaskPhase::Implement {
            return;
        }
        let title_hint = self.issue_cache.get(task_key).map(|i| i.title.clone());
        match self
            .pr
            .maybe_create_draft_pr(cancel, &task, title_hint.as_deref())
            .await
        {
            Ok(Some(draft)) => {
                self.state.update(task_key, |t| {
                    t.pr_number = Some(draft.number);
                    t.pr_url = Some(draft.url.clone());
                    t.draft_pr_created = true;
                });
            }
            Ok(None) => {}
            Err(e) => warn!(task = task_key, error = %e, "draft PR creation failed"),
        }
    }

    /// Fold the agent's status hint into the task state. Returns true when
    /// the iteration is fully handled (terminal state or early phase move).
    async fn apply_status(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        result: &IterationResult,
    ) -> bool {
        let Some(signal) = &result.status else {
            return false;
        };
        let Some(task) = self.state.get(task_key).cloned() else {
            return false;
        };
        match signal.status {
            AgentStatus::TestsFailed => {
                let retries = task.test_retries + 1;
                self.state.update(task_key, |t| t.test_retries = retries);
                if retries >= TEST_RETRY_LIMIT {
                    warn!(task = task_key, retries, "test retries exhausted, blocking task");
                    self.state.update(task_key, |t| {
                        t.enter_phase(TaskPhase::Blocked, &self.budgets);
                    });
                    return true;
                }
                false
            }
            AgentStatus::TestsPassed => {
                self.state.update(task_key, |t| t.test_retries = 0);
                false
            }
            AgentStatus::NothingToDo => {
                info!(task = task_key, "agent reports nothing to do");
                self.state.update(task_key, |t| {
                    t.enter_phase(TaskPhase::NothingToDo, &self.budgets);
                });
                true
            }
            AgentStatus::Blocked => {
                warn!(task = task_key, message = %signal.message, "agent reports blocked");
                self.state.update(task_key, |t| {
                    t.enter_phase(TaskPhase::Blocked, &self.budgets);
                });
                true
            }
            AgentStatus::Pushed if task.kind == TaskKind::Pr && task.phase == TaskPhase::Push => {
                self.advance_task(cancel, task_key, 0).await;
                true
            }
            AgentStatus::PrCreated | AgentStatus::Pushed => {
                debug!(task = task_key, status = ?signal.status, "progress status noted");
                false
            }
            AgentStatus::TestsRunning | AgentStatus::Analyzing | AgentStatus::Complete => false,
            AgentStatus::Failed => {
                warn!(task = task_key, message = %signal.message, "agent reports failure");
                false
            }
        }
    }

    /// Run the complexity assessor over the first PLAN output.
    async fn assess_complexity(
        &self,
        cancel: &CancellationToken,
        ctx: &TaskContext,
        result: &IterationResult,
    ) -> Complexity {
        let plan_context = {
            let handoff = self.handoff.lock().await;
            handoff
                .latest_for_phase(&ctx.task_id, TaskPhase::Plan)
                .map(|(output, _)| output.render_markdown())
                .unwrap_or_else(|| result.text_content.clone())
        };
        let prompt = format!(
            "Assess the complexity of this implementation plan. A SIMPLE change \
             is small, low-risk, and needs no dedicated documentation or \
             verification phases; everything else is COMPLEX.\n\n\
             Respond with exactly one line: `AGENTIUM_COMPLEXITY: SIMPLE` or \
             `AGENTIUM_COMPLEXITY: COMPLEX`.\n\n## Plan\n\n{plan_context}\n"
        );
        let req = ExecRequest::observer(
            &self.config.agent,
            prompt,
            &format!("{}-assessor", ctx.task_id),
        )
        .with_route(&self.routing.judge_route(TaskPhase::Plan));
        match self.executor.run_with_fallback(cancel, req, ctx).await {
            Ok(run) => parse_complexity(&run.text_content),
            Err(e) => {
                warn!(task = %ctx.task_id, error = %e, "complexity assessor failed, assuming COMPLEX");
                Complexity::Complex
            }
        }
    }

    async fn apply_workflow_path(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        complexity: Complexity,
    ) {
        let path = match complexity {
            Complexity::Simple => WorkflowPath::Simple,
            Complexity::Complex => WorkflowPath::Complex,
        };
        info!(task = task_key, path = path.token(), "workflow path chosen");
        let budgets = self.budgets.clone();
        self.state.update(task_key, |t| {
            t.workflow_path = path;
            // Re-pin the current phase's budget now that the path is known.
            t.max_phase_iterations = budgets.budget_for(t.phase, path);
        });

        if complexity == Complexity::Simple {
            let plan_comment = {
                let handoff = self.handoff.lock().await;
                handoff
                    .latest_for_phase(task_key, TaskPhase::Plan)
                    .map(|(output, _)| output.render_markdown())
            };
            if let (Some(body), Some(task)) = (plan_comment, self.state.get(task_key).cloned()) {
                let comment = format!("Plan accepted (simple workflow):\n\n{body}");
                if let Err(e) = self.pr.post_comment(cancel, &task, &comment).await {
                    warn!(task = task_key, error = %e, "could not post plan comment");
                }
            }
        }
    }

    /// Move the task to its next phase, firing the VERIFY auto-merge attempt
    /// and COMPLETE finalization on the way.
    async fn advance_task(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        session_iteration: u32,
    ) {
        self.advance_task_inner(cancel, task_key, session_iteration, true)
            .await;
    }

    async fn advance_task_inner(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        session_iteration: u32,
        attempt_merge: bool,
    ) {
        let Some(task) = self.state.get(task_key).cloned() else {
            return;
        };
        if attempt_merge && task.phase == TaskPhase::Verify {
            match self.pr.try_auto_merge(cancel, &task).await {
                Ok(true) => {
                    self.state.update(task_key, |t| t.pr_merged = true);
                }
                Ok(false) => {}
                Err(e) => warn!(task = task_key, error = %e, "auto-merge attempt errored"),
            }
        }

        let Some(next) = next_phase(task.phase, task.workflow_path, task.kind) else {
            return;
        };
        info!(task = task_key, from = %task.phase, to = %next, "phase advance");
        let budgets = self.budgets.clone();
        self.state
            .update(task_key, |t| t.enter_phase(next, &budgets));

        if next == TaskPhase::Complete {
            self.on_complete(cancel, task_key, session_iteration).await;
        }
    }

    /// Iterate the current phase, or force an advance when the budget is
    /// spent without a clean ADVANCE.
    async fn iterate_or_force_advance(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        session_iteration: u32,
    ) {
        let Some(task) = self.state.get(task_key).cloned() else {
            return;
        };
        if task.phase_iteration < task.max_phase_iterations {
            self.state.update(task_key, |t| t.phase_iteration += 1);
            return;
        }

        if task.phase == TaskPhase::Verify {
            warn!(
                task = task_key,
                "VERIFY budget exhausted without approval; auto-merge abandoned, PR remains open"
            );
            self.advance_task_inner(cancel, task_key, session_iteration, false)
                .await;
            return;
        }

        warn!(
            task = task_key,
            phase = %task.phase,
            "phase budget exhausted, forcing advance with controller override"
        );
        self.state.update(task_key, |t| t.controller_overrode = true);
        self.memory
            .lock()
            .await
            .clear_by_type(SignalType::EvalFeedback, task_key);

        let comment = format!(
            "Forced advance: the {} phase used its full budget of {} iteration(s) \
             without judge approval. Work continues, but the pull request will not \
             be auto-merged.",
            task.phase, task.max_phase_iterations
        );
        if let Err(e) = self.pr.post_comment(cancel, &task, &comment).await {
            warn!(task = task_key, error = %e, "could not post forced-advance comment");
        }
        self.advance_task(cancel, task_key, session_iteration).await;
    }

    async fn on_complete(
        &mut self,
        cancel: &CancellationToken,
        task_key: &str,
        _session_iteration: u32,
    ) {
        let Some(task) = self.state.get(task_key).cloned() else {
            return;
        };
        match self.pr.finalize(cancel, &task).await {
            Ok(true) => info!(task = task_key, "task complete, PR ready for review"),
            Ok(false) => info!(task = task_key, "task complete"),
            Err(e) => warn!(task = task_key, error = %e, "PR finalization failed"),
        }
    }
}

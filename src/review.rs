//! Review / judge pipeline.
//!
//! After a phase iteration completes, a reviewer agent analyzes the phase
//! output, then a judge agent reads that analysis and emits the verdict that
//! drives phase iteration:
//!
//! - `ADVANCE` — the phase is done; stale `EvalFeedback` is cleared and a
//!   `PhaseResult` entry is recorded.
//! - `ITERATE` — reviewer analysis and the judge's directives are appended to
//!   memory, scoped to the current phase iteration, for the next prompt.
//! - `BLOCKED` — the task cannot proceed. Absence of a parseable verdict is
//!   BLOCKED (fail-closed).

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::{ModelRouting, TokenUsage};
use crate::executor::{ContainerExecutor, ExecRequest, TaskContext};
use crate::memory::{MemoryStore, SignalType};
use crate::signals::{
    JudgeVerdict, ReviewerRecommendation, parse_judge_verdict, parse_reviewer_recommendation,
};
use crate::state::TaskState;

/// Number of prior judge directives shown to the judge for loop detection.
const PRIOR_DIRECTIVE_WINDOW: usize = 5;

/// Outcome of one reviewer + judge evaluation.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub verdict: JudgeVerdict,
    pub judge_feedback: String,
    pub reviewer_feedback: String,
    pub reviewer_recommendation: Option<ReviewerRecommendation>,
    /// The judge advanced the phase against an explicit REQUEST_CHANGES
    /// recommendation. Feeds the task's NOMERGE flag.
    pub judge_overrode_reviewer: bool,
    pub signal_found: bool,
    pub duration: Duration,
    pub token_usage: Option<TokenUsage>,
}

/// Drives reviewer and judge invocations for one session.
pub struct ReviewJudgePipeline {
    executor: Arc<ContainerExecutor>,
    routing: ModelRouting,
    memory: Arc<Mutex<MemoryStore>>,
    primary_agent: String,
    judge_context_budget: usize,
}

impl ReviewJudgePipeline {
    pub fn new(
        executor: Arc<ContainerExecutor>,
        routing: ModelRouting,
        memory: Arc<Mutex<MemoryStore>>,
        primary_agent: &str,
        judge_context_budget: usize,
    ) -> Self {
        Self {
            executor,
            routing,
            memory,
            primary_agent: primary_agent.to_string(),
            judge_context_budget,
        }
    }

    /// Run the full pipeline for a completed phase iteration and record the
    /// verdict's memory effects.
    pub async fn evaluate(
        &self,
        cancel: &CancellationToken,
        task: &TaskState,
        session_iteration: u32,
        phase_output: &str,
    ) -> Result<ReviewOutcome> {
        let started = Instant::now();
        let task_key = task.key();
        let ctx = TaskContext {
            task_id: task_key.clone(),
            phase: task.phase,
            session_iteration,
            phase_iteration: task.phase_iteration,
        };

        // Reviewer pass.
        let review_prompt = build_review_prompt(task, phase_output);
        let review_req = ExecRequest::observer(
            &self.primary_agent,
            review_prompt,
            &format!("{task_key}-review-{}", task.phase_iteration),
        )
        .with_route(&self.routing.judge_route(task.phase));
        let review_result = self
            .executor
            .run_with_fallback(cancel, review_req, &ctx)
            .await?;
        let reviewer_feedback = review_result.text_content.trim().to_string();
        let reviewer_recommendation = parse_reviewer_recommendation(&reviewer_feedback);

        // Judge pass, with prior directives for loop detection.
        let prior_directives = self.prior_directives(&task_key).await;
        let is_final_iteration = task.phase_iteration >= task.max_phase_iterations;
        let judge_prompt = build_judge_prompt(
            task,
            truncate_tail(phase_output, self.judge_context_budget),
            &reviewer_feedback,
            &prior_directives,
            is_final_iteration,
        );
        let judge_req = ExecRequest::observer(
            &self.primary_agent,
            judge_prompt,
            &format!("{task_key}-judge-{}", task.phase_iteration),
        )
        .with_route(&self.routing.judge_route(task.phase));
        let judge_result = self
            .executor
            .run_with_fallback(cancel, judge_req, &ctx)
            .await?;

        let verdict = parse_judge_verdict(&judge_result.text_content);
        if !verdict.signal_found {
            debug!(task = %task_key, "judge emitted no verdict signal, failing closed to BLOCKED");
        }
        info!(
            task = %task_key,
            phase = %task.phase,
            iteration = task.phase_iteration,
            verdict = verdict.verdict.token(),
            "judge verdict"
        );

        self.record_verdict_effects(task, session_iteration, &verdict.verdict, &verdict.feedback, &reviewer_feedback)
            .await;

        let judge_overrode_reviewer = verdict.verdict == JudgeVerdict::Advance
            && reviewer_recommendation == Some(ReviewerRecommendation::RequestChanges);
        if judge_overrode_reviewer {
            info!(
                task = %task_key,
                phase = %task.phase,
                "judge advanced against the reviewer's REQUEST_CHANGES recommendation"
            );
        }

        Ok(ReviewOutcome {
            verdict: verdict.verdict,
            judge_feedback: verdict.feedback,
            reviewer_feedback,
            reviewer_recommendation,
            judge_overrode_reviewer,
            signal_found: verdict.signal_found,
            duration: started.elapsed(),
            token_usage: judge_result.token_usage,
        })
    }

    async fn prior_directives(&self, task_key: &str) -> Vec<String> {
        let memory = self.memory.lock().await;
        let entries = memory.entries_for_task(task_key);
        entries
            .iter()
            .filter(|e| e.signal == SignalType::JudgeDirective)
            .rev()
            .take(PRIOR_DIRECTIVE_WINDOW)
            .map(|e| e.content.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    async fn record_verdict_effects(
        &self,
        task: &TaskState,
        session_iteration: u32,
        verdict: &JudgeVerdict,
        judge_feedback: &str,
        reviewer_feedback: &str,
    ) {
        let mut memory = self.memory.lock().await;
        match verdict {
            JudgeVerdict::Iterate => {
                let mut signals = Vec::new();
                if !reviewer_feedback.is_empty() {
                    signals.push((SignalType::EvalFeedback, reviewer_feedback.to_string()));
                }
                if !judge_feedback.is_empty() {
                    signals.push((SignalType::JudgeDirective, judge_feedback.to_string()));
                }
                memory.append(
                    signals,
                    session_iteration,
                    task.phase_iteration,
                    &task.key(),
                );
            }
            JudgeVerdict::Advance => {
                memory.clear_by_type(SignalType::EvalFeedback, &task.key());
                memory.append(
                    vec![(
                        SignalType::PhaseResult,
                        format!("{} approved: {}", task.phase, summarize(judge_feedback)),
                    )],
                    session_iteration,
                    task.phase_iteration,
                    &task.key(),
                );
            }
            JudgeVerdict::Blocked => {}
        }
    }
}

/// Keep the final `budget` bytes of `s`, respecting UTF-8 boundaries. The
/// tail carries the iteration's conclusion, which is what the judge needs.
pub fn truncate_tail(s: &str, budget: usize) -> &str {
    if s.len() <= budget {
        return s;
    }
    let mut start = s.len() - budget;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn summarize(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.is_empty() {
        "no notes".to_string()
    } else {
        line.to_string()
    }
}

fn build_review_prompt(task: &TaskState, phase_output: &str) -> String {
    format!(
        "You are reviewing the output of the {phase} phase for {kind} #{id}.\n\n\
         Analyze the work below for completeness, correctness, and risks. Be \
         specific about anything the worker must change; cite files or steps \
         by name. Close your analysis with exactly one line:\n\
         `AGENTIUM_REVIEW: APPROVE` or `AGENTIUM_REVIEW: REQUEST_CHANGES [summary]`\n\
         Do not emit `AGENTIUM_EVAL` — the final verdict belongs to a separate \
         judge.\n\n\
         ## Phase Output\n\n{phase_output}\n",
        phase = task.phase,
        kind = task.kind.token(),
        id = task.id,
    )
}

fn build_judge_prompt(
    task: &TaskState,
    phase_output_tail: &str,
    reviewer_feedback: &str,
    prior_directives: &[String],
    is_final_iteration: bool,
) -> String {
    let mut prompt = format!(
        "You are the judge for the {phase} phase of {kind} #{id}, iteration {iter} of {max}.\n\n\
         Decide whether the phase may advance. Respond with exactly one line:\n\
         `AGENTIUM_EVAL: ADVANCE|ITERATE|BLOCKED [required actions]`\n\n\
         - ADVANCE when the phase goal is met.\n\
         - ITERATE with concrete required actions when fixable gaps remain.\n\
         - BLOCKED only when the task cannot proceed without outside help.\n",
        phase = task.phase,
        kind = task.kind.token(),
        id = task.id,
        iter = task.phase_iteration,
        max = task.max_phase_iterations,
    );

    if !prior_directives.is_empty() {
        prompt.push_str(
            "\n## Prior Directives\n\nDirectives already issued for this task; if the same \
             gap keeps recurring, say so rather than repeating it:\n",
        );
        for directive in prior_directives {
            prompt.push_str(&format!("- {directive}\n"));
        }
    }

    if is_final_iteration {
        prompt.push_str(
            "\nThis is the final iteration of this phase's budget: prefer ADVANCE unless \
             the remaining issues are critical.\n",
        );
    }

    prompt.push_str(&format!(
        "\n## Reviewer Analysis\n\n{reviewer_feedback}\n\n## Phase Output (tail)\n\n{phase_output_tail}\n"
    ));
    prompt
}

//! Worker prompt composition.
//!
//! One prompt string per iteration, assembled from the task framing, issue
//! details, existing-work detection, phase instructions, prior-phase handoff
//! context, and — from the second phase iteration on — the feedback produced
//! by the review/judge pipeline. `{{variable}}` substitution runs last.

use std::collections::HashMap;

use crate::github::{ExistingWork, IssueDetails};
use crate::phases::{TaskKind, TaskPhase};
use crate::state::TaskState;

const MAX_SLUG_LEN: usize = 40;

/// Everything the composer needs for one iteration.
#[derive(Default)]
pub struct PromptInputs<'a> {
    pub task: Option<&'a TaskState>,
    pub issue: Option<&'a IssueDetails>,
    pub existing_work: Option<&'a ExistingWork>,
    /// Rendered handoff output of the prior phase.
    pub phase_input: Option<String>,
    /// Recent-memory fallback used when no handoff context exists.
    pub memory_context: String,
    /// Judge directives from the previous iteration of this phase.
    pub judge_directives: Vec<String>,
    /// Reviewer analysis from the previous iteration of this phase.
    pub reviewer_analysis: Vec<String>,
    /// The worker's current plan, embedded verbatim on PLAN iterate.
    pub current_plan: Option<String>,
}

/// Builds worker prompts for one session.
pub struct PromptComposer {
    repo_slug: String,
    issue_url: Option<String>,
    workflow_prompt: Option<String>,
    parameters: HashMap<String, String>,
}

impl PromptComposer {
    pub fn new(
        repo_slug: &str,
        issue_url: Option<String>,
        workflow_prompt: Option<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            repo_slug: repo_slug.to_string(),
            issue_url,
            workflow_prompt,
            parameters,
        }
    }

    /// Compose the full worker prompt for one iteration.
    pub fn compose(&self, inputs: &PromptInputs<'_>) -> String {
        let Some(task) = inputs.task else {
            return self.substitute("You are working on repository: {{repository}}\n", None);
        };

        let mut sections: Vec<String> = Vec::new();
        sections.push(self.header(task));

        if self.wants_task_body(task, inputs) {
            if let Some(issue) = inputs.issue {
                sections.push(render_issue_body(issue));
            }
        }

        if let Some(work) = inputs.existing_work
            && !work.is_empty()
        {
            sections.push(render_existing_work(work));
        }

        sections.push(self.phase_instructions(task, inputs));

        if let Some(phase_input) = &inputs.phase_input {
            sections.push(format!("## Phase Input\n\n{phase_input}"));
        } else if !inputs.memory_context.is_empty() {
            sections.push(inputs.memory_context.clone());
        }

        if task.phase_iteration > 1 {
            sections.push(self.iterate_feedback(task, inputs));
        }

        if let Some(extra) = &self.workflow_prompt {
            sections.push(extra.clone());
        }

        let issue_number = inputs.issue.map(|i| i.number.to_string()).or_else(|| {
            (task.kind == TaskKind::Issue).then(|| task.id.clone())
        });
        self.substitute(&sections.join("\n\n"), issue_number.as_deref())
    }

    fn header(&self, task: &TaskState) -> String {
        let framing = match task.kind {
            TaskKind::Issue => format!("## Your Task: Issue #{}", task.id),
            TaskKind::Pr => format!("## Your Task: Pull Request #{}", task.id),
        };
        format!(
            "You are working on repository: {}\n\n{framing}\nActive phase: {}",
            self.repo_slug, task.phase
        )
    }

    /// PLAN always carries the issue body; IMPLEMENT carries it only when no
    /// plan handoff exists to defer to.
    fn wants_task_body(&self, task: &TaskState, inputs: &PromptInputs<'_>) -> bool {
        match task.phase {
            TaskPhase::Plan => true,
            TaskPhase::Implement => inputs.phase_input.is_none(),
            _ => false,
        }
    }

    fn phase_instructions(&self, task: &TaskState, inputs: &PromptInputs<'_>) -> String {
        match task.phase {
            TaskPhase::Implement => {
                let branch = inputs
                    .issue
                    .map(|issue| {
                        branch_name(&issue.label_names(), &task.id, &issue.title)
                    })
                    .unwrap_or_else(|| format!("feature/issue-{}", task.id));
                let mut out = String::from("## Phase Instructions\n\n");
                match &task.parent_branch {
                    Some(parent) => out.push_str(&format!(
                        "1. Create the work branch `{branch}` from `{parent}`.\n"
                    )),
                    None => out.push_str(&format!(
                        "1. Create the work branch `{branch}` from the default branch.\n"
                    )),
                }
                out.push_str(
                    "2. Implement the change in small commits on that branch.\n\
                     3. Push the branch and open a draft pull request",
                );
                if task.parent_branch.is_some() {
                    out.push_str(" targeting `main`");
                }
                out.push_str(
                    ".\n4. Emit the IMPLEMENT handoff block when the branch is ready.\n",
                );
                out
            }
            TaskPhase::Verify => {
                let pr = task
                    .pr_number
                    .map(|n| format!("#{n}"))
                    .unwrap_or_else(|| "(no PR recorded)".to_string());
                format!(
                    "## Phase Instructions\n\nVerify pull request {pr} on {}. Follow the VERIFY \
                     procedure from the system prompt and report every check you ran.",
                    self.repo_slug
                )
            }
            other => format!(
                "## Phase Instructions\n\nFollow the {other} procedure from the system prompt."
            ),
        }
    }

    fn iterate_feedback(&self, task: &TaskState, inputs: &PromptInputs<'_>) -> String {
        let base_ref = task.parent_branch.as_deref().unwrap_or("main");
        let mut out = format!(
            "## Iteration Feedback (iteration {} of {})\n\n{}\n",
            task.phase_iteration,
            task.max_phase_iterations,
            required_actions(task.phase)
        );

        out.push_str("\n### Judge Directives (REQUIRED)\n\n");
        if inputs.judge_directives.is_empty() {
            out.push_str("(none recorded)\n");
        } else {
            for directive in &inputs.judge_directives {
                out.push_str(&format!("- {directive}\n"));
            }
        }

        out.push_str("\n### Reviewer Analysis (Context)\n\n");
        if inputs.reviewer_analysis.is_empty() {
            out.push_str("(none recorded)\n");
        } else {
            for item in &inputs.reviewer_analysis {
                out.push_str(&format!("- {item}\n"));
            }
        }

        if task.phase == TaskPhase::Plan
            && let Some(plan) = &inputs.current_plan
        {
            out.push_str(&format!("\n### Your Current Plan\n\n{plan}\n"));
        }

        out.push_str(&format!(
            "\nCompare your work against `{base_ref}` with `git diff {base_ref}...HEAD`.\n\
             For every directive above, emit one line:\n\
             `AGENTIUM_MEMORY: FEEDBACK_RESPONSE [ADDRESSED|DECLINED|PARTIAL] <point>`\n"
        ));
        out
    }

    /// Substitution: built-ins first, user parameters override, unknown
    /// placeholders pass through verbatim.
    pub fn substitute(&self, template: &str, issue_number: Option<&str>) -> String {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("repository".to_string(), self.repo_slug.clone());
        if let Some(url) = &self.issue_url {
            vars.insert("issue_url".to_string(), url.clone());
        }
        if let Some(number) = issue_number {
            vars.insert("issue_number".to_string(), number.to_string());
        }
        for (key, value) in &self.parameters {
            vars.insert(key.clone(), value.clone());
        }

        let mut out = template.to_string();
        for (key, value) in &vars {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

fn render_issue_body(issue: &IssueDetails) -> String {
    let mut out = format!("## Issue Details\n\n**{}**\n\n{}\n", issue.title, issue.body);
    if !issue.comments.is_empty() {
        out.push_str("\n### Discussion\n\n");
        for comment in &issue.comments {
            out.push_str(&format!("**@{}**: {}\n\n", comment.author.login, comment.body));
        }
    }
    out
}

fn render_existing_work(work: &ExistingWork) -> String {
    let pr_line = match work.pr_number {
        Some(n) => format!("- Open PR: #{n} {}\n", work.pr_title),
        None => String::new(),
    };
    format!(
        "## Existing Work Detected\n\n\
         - Branch: `{}`\n{pr_line}\
         Do NOT create a new branch or a new pull request. Continue on the \
         existing branch and update the existing PR.",
        work.branch
    )
}

fn required_actions(phase: TaskPhase) -> &'static str {
    match phase {
        TaskPhase::Plan => {
            "Required Actions: revise the plan to resolve every judge directive, \
             keeping the parts the reviewer accepted."
        }
        TaskPhase::Implement => {
            "Required Actions: address every judge directive with code changes on \
             the existing work branch; do not start over."
        }
        TaskPhase::Docs => {
            "Required Actions: correct the documentation gaps the judge named."
        }
        TaskPhase::Verify => {
            "Required Actions: make the named failing checks pass; do not skip or \
             silence them."
        }
        _ => "Required Actions: resolve every judge directive before finishing.",
    }
}

/// Branch prefix from issue labels: `bug/`, `enhancement/`, default `feature/`.
pub fn branch_prefix(labels: &[&str]) -> &'static str {
    if labels.iter().any(|l| l.eq_ignore_ascii_case("bug")) {
        "bug/"
    } else if labels.iter().any(|l| l.eq_ignore_ascii_case("enhancement")) {
        "enhancement/"
    } else {
        "feature/"
    }
}

/// Lowercased title slug: alphanumeric runs joined by dashes, bounded length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

/// `<prefix>issue-<n>-<slug>`.
pub fn branch_name(labels: &[&str], issue_number: &str, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}issue-{issue_number}", branch_prefix(labels))
    } else {
        format!("{}issue-{issue_number}-{slug}", branch_prefix(labels))
    }
}

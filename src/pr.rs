//! Draft-PR lifecycle.
//!
//! The first iteration that leaves commits on a recognized work branch gets a
//! draft PR; terminal COMPLETE flips it to ready-for-review unless the PR
//! was merged already or a NOMERGE flag is set. Auto-merge is attempted only
//! from the VERIFY phase and failure always leaves the PR open for humans.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::github::GhClient;
use crate::repo::{RepoClient, extract_issue_number};
use crate::state::TaskState;

/// Branch prefixes the controller recognizes as its own work branches.
const WORK_BRANCH_PREFIXES: &[&str] = &["agentium/", "bug/", "enhancement/", "feature/"];

/// A freshly created draft PR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftPr {
    pub number: u64,
    pub url: String,
    pub branch: String,
}

pub fn is_work_branch(branch: &str) -> bool {
    WORK_BRANCH_PREFIXES.iter().any(|p| branch.starts_with(p))
}

/// True when `branch` may be adopted for `task`: a work branch whose embedded
/// issue number, if any, matches the task. A branch carrying a different
/// issue number is contamination and must be refused.
pub fn branch_matches_task(branch: &str, task_id: &str) -> bool {
    if !is_work_branch(branch) {
        return false;
    }
    let embedded = extract_issue_number(branch);
    embedded.is_empty() || embedded == task_id
}

/// Drives draft creation and finalization through git and `gh`.
pub struct PrManager {
    repo: RepoClient,
    gh: GhClient,
}

impl PrManager {
    pub fn new(repo: RepoClient, gh: GhClient) -> Self {
        Self { repo, gh }
    }

    /// Create the draft PR for a task's work branch if this iteration calls
    /// for it. Returns `None` (without side effects) when there is nothing to
    /// do: draft already created, no work branch checked out, branch
    /// contamination, or no unpushed commits.
    pub async fn maybe_create_draft_pr(
        &self,
        cancel: &CancellationToken,
        task: &TaskState,
        title_hint: Option<&str>,
    ) -> Result<Option<DraftPr>> {
        if task.draft_pr_created || task.pr_number.is_some() {
            return Ok(None);
        }

        let branch = self.repo.current_branch(cancel).await?;
        if !is_work_branch(&branch) {
            debug!(branch = %branch, "not a work branch, skipping draft PR");
            return Ok(None);
        }
        if !branch_matches_task(&branch, &task.id) {
            warn!(
                branch = %branch,
                task = %task.key(),
                "branch embeds a different issue number, refusing to adopt it"
            );
            return Ok(None);
        }
        if !self.repo.has_unpushed_commits(cancel, &branch).await? {
            debug!(branch = %branch, "no unpushed commits, skipping draft PR");
            return Ok(None);
        }

        self.repo.push_upstream(cancel, &branch).await?;

        let title = match title_hint {
            Some(hint) => format!("Resolve issue #{}: {hint}", task.id),
            None => format!("Resolve issue #{}", task.id),
        };
        let body = format!(
            "Automated work for issue #{id}.\n\nCloses #{id}.",
            id = task.id
        );
        let (number, url) = self
            .gh
            .pr_create_draft(cancel, &branch, "main", &title, &body)
            .await?;
        info!(pr = number, branch = %branch, "created draft PR");
        Ok(Some(DraftPr {
            number,
            url,
            branch,
        }))
    }

    /// Flip the PR to ready-for-review on terminal COMPLETE, unless it was
    /// merged already or reached COMPLETE under a NOMERGE flag.
    pub async fn finalize(&self, cancel: &CancellationToken, task: &TaskState) -> Result<bool> {
        let Some(number) = task.pr_number else {
            return Ok(false);
        };
        if task.pr_merged {
            debug!(pr = number, "PR already merged, nothing to finalize");
            return Ok(false);
        }
        if task.nomerge() {
            info!(
                pr = number,
                "PR completed under a controller override, leaving as draft for human review"
            );
            return Ok(false);
        }
        self.gh.pr_ready(cancel, number).await?;
        info!(pr = number, "marked PR ready for review");
        Ok(true)
    }

    /// One auto-merge attempt from VERIFY. Failure is reported, never fatal.
    pub async fn try_auto_merge(
        &self,
        cancel: &CancellationToken,
        task: &TaskState,
    ) -> Result<bool> {
        let Some(number) = task.pr_number else {
            return Ok(false);
        };
        if task.pr_merged || task.nomerge() {
            return Ok(false);
        }
        let output = self.gh.pr_merge_squash(cancel, number).await?;
        if output.success() {
            info!(pr = number, "auto-merged PR");
            Ok(true)
        } else {
            warn!(
                pr = number,
                stderr = %output.stderr.trim(),
                "auto-merge failed, PR remains open for human review"
            );
            Ok(false)
        }
    }

    /// Post the forced-advance or plan comment for a task.
    pub async fn post_comment(
        &self,
        cancel: &CancellationToken,
        task: &TaskState,
        body: &str,
    ) -> Result<()> {
        match task.pr_number {
            Some(number) => self.gh.pr_comment(cancel, number, body).await,
            None => self.gh.issue_comment(cancel, &task.id, body).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_branch_prefixes() {
        assert!(is_work_branch("agentium/issue-42"));
        assert!(is_work_branch("bug/issue-7-fix"));
        assert!(is_work_branch("enhancement/issue-334-speedup"));
        assert!(is_work_branch("feature/issue-9-x"));
        assert!(!is_work_branch("main"));
        assert!(!is_work_branch("release/1.2"));
    }

    #[test]
    fn branch_contamination_is_refused() {
        assert!(!branch_matches_task("enhancement/issue-334-speedup", "363"));
        assert!(branch_matches_task("enhancement/issue-363-speedup", "363"));
    }

    #[test]
    fn branch_without_issue_number_is_adoptable() {
        assert!(branch_matches_task("agentium/cleanup", "42"));
    }

    #[test]
    fn non_work_branch_never_matches() {
        assert!(!branch_matches_task("main", "42"));
    }
}

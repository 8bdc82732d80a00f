//! GitHub surface: credential capability and the `gh` CLI client.
//!
//! Credential issuance (App JWT → installation token) happens outside the
//! controller; the session consumes it through the `TokenProvider`
//! capability. Everything else goes through `gh` with the injectable runner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::repo::{CmdOutput, CmdRunner, CommandSpec, Subprocess, parse_pr_create_output};

/// Injected credential capability.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid installation token.
    async fn installation_token(&self) -> Result<String>;
}

/// Provider backed by a token resolved before session start (typically the
/// `GITHUB_TOKEN` environment variable in development).
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn installation_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// An issue comment as returned by `gh issue view --json comments`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueComment {
    #[serde(default)]
    pub author: CommentAuthor,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentAuthor {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueLabel {
    #[serde(default)]
    pub name: String,
}

/// Issue details consumed by the prompt composer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueDetails {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
}

impl IssueDetails {
    pub fn label_names(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }
}

/// Prior work discovered for an issue before the first iteration.
#[derive(Debug, Clone, Default)]
pub struct ExistingWork {
    pub branch: String,
    pub pr_number: Option<u64>,
    pub pr_title: String,
}

impl ExistingWork {
    pub fn is_empty(&self) -> bool {
        self.branch.is_empty() && self.pr_number.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PrListEntry {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(rename = "headRefName", default)]
    head_ref_name: String,
}

/// `gh` CLI client bound to the session's repository.
#[derive(Clone)]
pub struct GhClient {
    sub: Subprocess,
    workdir: PathBuf,
    repo: String,
}

impl GhClient {
    pub fn new(runner: CmdRunner, workdir: PathBuf, repo_slug: &str) -> Self {
        Self {
            sub: Subprocess::new(runner),
            workdir,
            repo: repo_slug.to_string(),
        }
    }

    fn gh_spec(&self, args: &[&str]) -> CommandSpec {
        let mut full: Vec<&str> = args.to_vec();
        full.push("--repo");
        full.push(&self.repo);
        CommandSpec::new("gh", &full).with_cwd(self.workdir.clone())
    }

    pub async fn issue_details(
        &self,
        cancel: &CancellationToken,
        number: &str,
    ) -> Result<IssueDetails> {
        let output = self
            .sub
            .run_checked(
                cancel,
                self.gh_spec(&[
                    "issue",
                    "view",
                    number,
                    "--json",
                    "number,title,body,url,labels,comments",
                ]),
            )
            .await?;
        serde_json::from_str(&output.stdout).context("parse gh issue view output")
    }

    /// Look for an open PR whose head branch embeds the issue number.
    pub async fn find_existing_work(
        &self,
        cancel: &CancellationToken,
        issue_number: &str,
    ) -> Result<Option<ExistingWork>> {
        let output = self
            .sub
            .run(
                cancel,
                self.gh_spec(&[
                    "pr",
                    "list",
                    "--state",
                    "open",
                    "--json",
                    "number,title,headRefName",
                ]),
            )
            .await?;
        if !output.success() {
            debug!(stderr = %output.stderr.trim(), "gh pr list failed, assuming no existing work");
            return Ok(None);
        }
        let entries: Vec<PrListEntry> =
            serde_json::from_str(&output.stdout).unwrap_or_default();
        let found = entries.into_iter().find(|entry| {
            crate::repo::extract_issue_number(&entry.head_ref_name) == issue_number
        });
        Ok(found.map(|entry| ExistingWork {
            branch: entry.head_ref_name,
            pr_number: Some(entry.number),
            pr_title: entry.title,
        }))
    }

    /// `gh pr create --draft`, returning the parsed number and URL.
    pub async fn pr_create_draft(
        &self,
        cancel: &CancellationToken,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<(u64, String)> {
        let output = self
            .sub
            .run_checked(
                cancel,
                self.gh_spec(&[
                    "pr", "create", "--draft", "--head", head, "--base", base, "--title", title,
                    "--body", body,
                ]),
            )
            .await?;
        parse_pr_create_output(&output.stdout)
            .or_else(|| parse_pr_create_output(&output.stderr))
            .context("gh pr create output did not contain a PR URL")
    }

    pub async fn pr_ready(&self, cancel: &CancellationToken, number: u64) -> Result<()> {
        self.sub
            .run_checked(cancel, self.gh_spec(&["pr", "ready", &number.to_string()]))
            .await?;
        Ok(())
    }

    /// One-shot squash-merge attempt; the caller treats failure as
    /// "leave the PR open for humans".
    pub async fn pr_merge_squash(
        &self,
        cancel: &CancellationToken,
        number: u64,
    ) -> Result<CmdOutput> {
        let output = self
            .sub
            .run(
                cancel,
                self.gh_spec(&["pr", "merge", &number.to_string(), "--squash"]),
            )
            .await?;
        Ok(output)
    }

    pub async fn issue_comment(
        &self,
        cancel: &CancellationToken,
        number: &str,
        body: &str,
    ) -> Result<()> {
        self.sub
            .run_checked(
                cancel,
                self.gh_spec(&["issue", "comment", number, "--body", body]),
            )
            .await?;
        Ok(())
    }

    pub async fn pr_comment(
        &self,
        cancel: &CancellationToken,
        number: u64,
        body: &str,
    ) -> Result<()> {
        self.sub
            .run_checked(
                cancel,
                self.gh_spec(&["pr", "comment", &number.to_string(), "--body", body]),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_provider_returns_token() {
        let provider = StaticTokenProvider::new("ghs_abc".into());
        assert_eq!(provider.installation_token().await.unwrap(), "ghs_abc");
    }

    #[test]
    fn issue_details_parse_gh_json() {
        let json = r#"{
            "number": 42,
            "title": "Widget crashes",
            "body": "steps to reproduce",
            "url": "https://github.com/o/r/issues/42",
            "labels": [{"name": "bug"}, {"name": "p1"}],
            "comments": [{"author": {"login": "alice"}, "body": "same here"}]
        }"#;
        let details: IssueDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.number, 42);
        assert_eq!(details.label_names(), vec!["bug", "p1"]);
        assert_eq!(details.comments[0].author.login, "alice");
    }

    #[test]
    fn existing_work_is_empty() {
        assert!(ExistingWork::default().is_empty());
        let work = ExistingWork {
            branch: "feature/issue-42-x".into(),
            pr_number: Some(9),
            pr_title: "WIP".into(),
        };
        assert!(!work.is_empty());
    }
}

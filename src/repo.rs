//! Subprocess surface: the injectable command runner, the concurrent
//! stream drainer, and the git repository client.
//!
//! Every external command (`git`, `gh`, `docker`, `curl`, `gcloud`) flows
//! through a `CmdRunner`, a function from a `CommandSpec` to a spawned child.
//! Tests inject a runner that rewrites commands into scripted shell
//! invocations; production uses `system_runner`.

use anyhow::{Result, bail};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ExecutorError;

static ISSUE_BRANCH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"issue-(\d+)").unwrap());

static PR_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https://github\.com/[^\s]+/pull/(\d+))").unwrap());

/// Description of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Keep stdin open for prompt delivery.
    pub pipe_stdin: bool,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    /// `program arg arg…` for log lines.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Injectable spawn function. The returned child always has piped
/// stdout/stderr, and piped stdin iff the spec asks for it.
pub type CmdRunner = Arc<dyn Fn(&CommandSpec) -> std::io::Result<Child> + Send + Sync>;

/// Runner that spawns real processes.
pub fn system_runner() -> CmdRunner {
    Arc::new(|spec: &CommandSpec| {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.spawn()
    })
}

/// Captured result of a completed command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Drive a spawned child to completion: deliver the optional stdin payload,
/// drain stdout and stderr through two concurrent readers, then wait.
///
/// The two readers must run in parallel — a child that fills one pipe while
/// the controller reads the other would deadlock under a sequential drain.
/// Both readers are joined before `wait()` is called.
pub async fn run_child(
    mut child: Child,
    stdin_data: Option<String>,
    cancel: &CancellationToken,
) -> Result<CmdOutput, ExecutorError> {
    match (stdin_data, child.stdin.take()) {
        (Some(data), Some(mut stdin)) => {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(ExecutorError::StdinFailed)?;
            stdin.shutdown().await.map_err(ExecutorError::StdinFailed)?;
        }
        (Some(_), None) => {
            return Err(ExecutorError::StdinFailed(std::io::Error::other(
                "stdin prompt supplied but child stdin is not piped",
            )));
        }
        _ => {}
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::SpawnFailed(std::io::Error::other("stdout not piped")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutorError::SpawnFailed(std::io::Error::other("stderr not piped")))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let drain = async {
        let (out, err) = futures::future::join(stdout_task, stderr_task).await;
        (out.unwrap_or_default(), err.unwrap_or_default())
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ExecutorError::Cancelled)
        }
        (out_buf, err_buf) = drain => {
            let status = child
                .wait()
                .await
                .map_err(ExecutorError::SpawnFailed)?;
            Ok(CmdOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out_buf).into_owned(),
                stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            })
        }
    }
}

/// Thin convenience wrapper binding a runner to the drain loop.
#[derive(Clone)]
pub struct Subprocess {
    runner: CmdRunner,
}

impl Subprocess {
    pub fn new(runner: CmdRunner) -> Self {
        Self { runner }
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        spec: CommandSpec,
    ) -> Result<CmdOutput, ExecutorError> {
        debug!(command = %spec.display(), "exec");
        let child = (self.runner)(&spec).map_err(ExecutorError::SpawnFailed)?;
        run_child(child, None, cancel).await
    }

    /// Run and fail on a non-zero exit, surfacing stderr.
    pub async fn run_checked(
        &self,
        cancel: &CancellationToken,
        spec: CommandSpec,
    ) -> Result<CmdOutput> {
        let display = spec.display();
        let output = self.run(cancel, spec).await?;
        if !output.success() {
            bail!(
                "{display} exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

/// Git operations on the session's repository clone.
#[derive(Clone)]
pub struct RepoClient {
    sub: Subprocess,
    workdir: PathBuf,
}

impl RepoClient {
    pub fn new(runner: CmdRunner, workdir: PathBuf) -> Self {
        Self {
            sub: Subprocess::new(runner),
            workdir,
        }
    }

    fn git_spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", args).with_cwd(self.workdir.clone())
    }

    /// Clone into the workspace, or fetch when a clone is already present.
    /// A failed clone over a populated workspace is recovered locally.
    pub async fn clone_or_update(
        &self,
        cancel: &CancellationToken,
        clone_url: &str,
    ) -> Result<()> {
        if self.workdir.join(".git").exists() {
            let fetch = self
                .sub
                .run(cancel, self.git_spec(&["fetch", "origin", "--prune"]))
                .await?;
            if !fetch.success() {
                debug!(stderr = %fetch.stderr.trim(), "git fetch failed, continuing with local state");
            }
            return Ok(());
        }
        let spec = CommandSpec::new(
            "git",
            &["clone", clone_url, &self.workdir.display().to_string()],
        );
        self.sub.run_checked(cancel, spec).await?;
        Ok(())
    }

    pub async fn current_branch(&self, cancel: &CancellationToken) -> Result<String> {
        let output = self
            .sub
            .run_checked(cancel, self.git_spec(&["rev-parse", "--abbrev-ref", "HEAD"]))
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// True when the branch has commits its upstream does not, or has no
    /// upstream at all.
    pub async fn has_unpushed_commits(
        &self,
        cancel: &CancellationToken,
        branch: &str,
    ) -> Result<bool> {
        let upstream = self
            .sub
            .run(
                cancel,
                self.git_spec(&[
                    "rev-parse",
                    "--abbrev-ref",
                    &format!("{branch}@{{upstream}}"),
                ]),
            )
            .await?;
        if !upstream.success() {
            return Ok(true);
        }
        let ahead = self
            .sub
            .run_checked(
                cancel,
                self.git_spec(&["rev-list", "--count", &format!("{branch}@{{upstream}}..{branch}")]),
            )
            .await?;
        Ok(ahead.stdout.trim().parse::<u64>().unwrap_or(0) > 0)
    }

    pub async fn push_upstream(&self, cancel: &CancellationToken, branch: &str) -> Result<()> {
        self.sub
            .run_checked(cancel, self.git_spec(&["push", "-u", "origin", branch]))
            .await?;
        Ok(())
    }
}

/// The issue number embedded in a work branch name, or empty when the branch
/// carries none (e.g. `main`).
pub fn extract_issue_number(branch: &str) -> String {
    ISSUE_BRANCH_REGEX
        .captures(branch)
        .map(|cap| cap[1].to_string())
        .unwrap_or_default()
}

/// Parse the PR number and URL from `gh pr create` output.
pub fn parse_pr_create_output(output: &str) -> Option<(u64, String)> {
    let cap = PR_URL_REGEX.captures(output)?;
    let number = cap[2].parse().ok()?;
    Some((number, cap[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    // ── parsers ───────────────────────────────────────────────────────────

    #[test]
    fn extract_issue_number_from_branch() {
        assert_eq!(extract_issue_number("feature/issue-123-foo"), "123");
        assert_eq!(extract_issue_number("bug/issue-7-fix-crash"), "7");
        assert_eq!(extract_issue_number("agentium/issue-42"), "42");
        assert_eq!(extract_issue_number("main"), "");
        assert_eq!(extract_issue_number("release-2024"), "");
    }

    #[test]
    fn parse_pr_create_output_extracts_number_and_url() {
        let (number, url) =
            parse_pr_create_output("https://github.com/o/r/pull/42\n").unwrap();
        assert_eq!(number, 42);
        assert_eq!(url, "https://github.com/o/r/pull/42");
    }

    #[test]
    fn parse_pr_create_output_with_preamble() {
        let text = "Creating draft pull request for o:branch into main in o/r\n\nhttps://github.com/o/r/pull/7\n";
        let (number, url) = parse_pr_create_output(text).unwrap();
        assert_eq!(number, 7);
        assert!(url.ends_with("/pull/7"));
    }

    #[test]
    fn parse_pr_create_output_rejects_garbage() {
        assert!(parse_pr_create_output("no url here").is_none());
    }

    // ── drain ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_child_captures_both_streams() {
        let spec = CommandSpec::new("sh", &["-c", "echo out; echo err >&2"]);
        let child = (system_runner())(&spec).unwrap();
        let output = run_child(child, None, &token()).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn run_child_delivers_stdin() {
        let spec = CommandSpec::new("sh", &["-c", "cat"]).with_stdin();
        let child = (system_runner())(&spec).unwrap();
        let output = run_child(child, Some("prompt text".into()), &token())
            .await
            .unwrap();
        assert_eq!(output.stdout, "prompt text");
    }

    #[tokio::test]
    async fn run_child_reports_exit_code() {
        let spec = CommandSpec::new("sh", &["-c", "exit 3"]);
        let child = (system_runner())(&spec).unwrap();
        let output = run_child(child, None, &token()).await.unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn run_child_cancellation_kills_child() {
        let cancel = token();
        let spec = CommandSpec::new("sh", &["-c", "sleep 30"]);
        let child = (system_runner())(&spec).unwrap();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let started = std::time::Instant::now();
        let err = run_child(child, None, &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn subprocess_run_checked_surfaces_stderr() {
        let sub = Subprocess::new(system_runner());
        let err = sub
            .run_checked(
                &token(),
                CommandSpec::new("sh", &["-c", "echo broken >&2; exit 1"]),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}

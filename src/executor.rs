//! Container executor.
//!
//! Runs the agent container once per call: provisions credentials, assembles
//! the `docker run` invocation, delivers the prompt on stdin, drains both
//! output streams concurrently, parses the result through the adapter, and
//! projects signals into the memory and handoff stores.
//!
//! The fallback wrapper retries exactly once with the configured fallback
//! adapter when the primary run looks like an adapter-startup failure rather
//! than a genuine task failure.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterRegistry, AgentAdapter, CredentialFile, TokenUsage};
use crate::audit::{AuditEvent, AuditLog};
use crate::cloud::{CloudLogSink, LogSeverity};
use crate::config::SessionConfig;
use crate::errors::ExecutorError;
use crate::handoff::{HandoffStore, parse_handoff_block};
use crate::memory::{MemoryStore, parse_memory_signals};
use crate::phases::TaskPhase;
use crate::repo::{CmdRunner, CommandSpec, run_child};
use crate::signals::{StatusSignal, parse_agent_status};

/// Stderr/stdout excerpt length for non-zero-exit log lines.
const LOG_EXCERPT_CHARS: usize = 500;

/// Runs shorter than this that fail are treated as adapter-startup failures.
const STARTUP_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Error-text fragments that identify an adapter/infrastructure failure
/// regardless of duration.
const INFRA_ERROR_PATTERNS: &[&str] = &[
    "is a directory",
    "no such file",
    "permission denied",
    "docker: error",
    "no such image",
    "connection refused",
    "auth file",
    "oci runtime",
];

/// Which task iteration a run belongs to; drives store writes and env.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub phase: TaskPhase,
    pub session_iteration: u32,
    pub phase_iteration: u32,
}

/// One container invocation request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub adapter_name: String,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub stdin_prompt: Option<String>,
    pub extra_env: Vec<(String, String)>,
    pub log_tag: String,
    /// Skip memory/handoff projection (reviewer, judge, and assessor runs
    /// observe but do not act on the workspace).
    pub skip_store_updates: bool,
}

impl ExecRequest {
    pub fn worker(adapter_name: &str, prompt: String, log_tag: &str) -> Self {
        Self {
            adapter_name: adapter_name.to_string(),
            model: None,
            reasoning: None,
            stdin_prompt: Some(prompt),
            extra_env: Vec::new(),
            log_tag: log_tag.to_string(),
            skip_store_updates: false,
        }
    }

    pub fn observer(adapter_name: &str, prompt: String, log_tag: &str) -> Self {
        Self {
            skip_store_updates: true,
            ..Self::worker(adapter_name, prompt, log_tag)
        }
    }

    pub fn with_route(mut self, decision: &crate::adapters::RouteDecision) -> Self {
        if let Some(adapter) = &decision.adapter {
            self.adapter_name = adapter.clone();
        }
        self.model = decision.model.clone();
        self.reasoning = decision.reasoning.clone();
        self
    }
}

/// Parsed, projected result of one container run.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub exit_code: i32,
    pub success: bool,
    pub text_content: String,
    pub stderr: String,
    pub events: Vec<AuditEvent>,
    pub status: Option<StatusSignal>,
    pub token_usage: Option<TokenUsage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stdin_prompt: Option<String>,
    pub adapter_used: String,
}

impl IterationResult {
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Classify a failed run. `error` is `None` for a clean exit (never a
/// fallback trigger). A match against the known infra patterns in the error
/// text or stderr triggers fallback regardless of duration; otherwise only
/// fast failures do.
pub fn is_adapter_execution_failure(
    error: Option<&str>,
    stderr: &str,
    duration: Duration,
) -> bool {
    let Some(error) = error else {
        return false;
    };
    let haystack = format!("{error}\n{stderr}").to_lowercase();
    if INFRA_ERROR_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return true;
    }
    duration < STARTUP_FAILURE_WINDOW
}

/// Executes agent containers for one session.
pub struct ContainerExecutor {
    runner: CmdRunner,
    registry: AdapterRegistry,
    config: Arc<SessionConfig>,
    workspace: PathBuf,
    github_token: String,
    memory: Arc<Mutex<MemoryStore>>,
    handoff: Arc<Mutex<HandoffStore>>,
    audit: Arc<AuditLog>,
    sink: Arc<dyn CloudLogSink>,
    registry_login_done: Mutex<bool>,
}

impl ContainerExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: CmdRunner,
        registry: AdapterRegistry,
        config: Arc<SessionConfig>,
        workspace: PathBuf,
        github_token: String,
        memory: Arc<Mutex<MemoryStore>>,
        handoff: Arc<Mutex<HandoffStore>>,
        audit: Arc<AuditLog>,
        sink: Arc<dyn CloudLogSink>,
    ) -> Self {
        Self {
            runner,
            registry,
            config,
            workspace,
            github_token,
            memory,
            handoff,
            audit,
            sink,
            registry_login_done: Mutex::new(false),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Run with the single-retry fallback policy applied.
    pub async fn run_with_fallback(
        &self,
        cancel: &CancellationToken,
        req: ExecRequest,
        ctx: &TaskContext,
    ) -> Result<IterationResult, ExecutorError> {
        let started = Instant::now();
        let first = self.run_once(cancel, req.clone(), ctx).await;
        let duration = started.elapsed();

        let mut failure: Option<(String, String)> = None;
        match &first {
            Ok(result) if result.success => {}
            Ok(result) => {
                failure = Some((
                    format!("exit code {}", result.exit_code),
                    result.stderr.clone(),
                ));
            }
            Err(ExecutorError::Cancelled) => {}
            Err(e) => failure = Some((e.classification_text(), String::new())),
        }
        let Some((error_text, stderr_text)) = failure else {
            return first;
        };

        if !self.can_fallback(&req.adapter_name, req.model.is_some()) {
            return first;
        }
        if !is_adapter_execution_failure(Some(&error_text), &stderr_text, duration) {
            return first;
        }

        let fallback_name = self.config.fallback.default_adapter.clone();
        warn!(
            primary = %req.adapter_name,
            fallback = %fallback_name,
            error = %error_text,
            "adapter execution failure, retrying once with fallback adapter"
        );

        // The fallback request drops any model override; a routed model for
        // the primary adapter is meaningless on the fallback runtime.
        let fallback_req = ExecRequest {
            adapter_name: fallback_name,
            model: None,
            reasoning: None,
            ..req
        };
        self.run_once(cancel, fallback_req, ctx).await
    }

    /// Fallback is possible when it is enabled, the fallback adapter is
    /// registered, and retrying would change something (different adapter, or
    /// the same adapter with a model override to strip).
    pub fn can_fallback(&self, current_adapter: &str, has_model_override: bool) -> bool {
        if !self.config.fallback.enabled {
            return false;
        }
        let fallback = &self.config.fallback.default_adapter;
        if !self.registry.contains(fallback) {
            return false;
        }
        if fallback == current_adapter && !has_model_override {
            return false;
        }
        true
    }

    /// Launch the container once and project its output.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
        req: ExecRequest,
        ctx: &TaskContext,
    ) -> Result<IterationResult, ExecutorError> {
        let adapter = self
            .registry
            .resolve(&req.adapter_name)
            .ok_or_else(|| ExecutorError::UnknownAdapter(req.adapter_name.clone()))?;

        self.ensure_registry_login(cancel, adapter.as_ref()).await;

        let mounts = self
            .provision_credentials(adapter.as_ref())
            .map_err(ExecutorError::Other)?;

        let env = self.build_container_env(adapter.as_ref(), &req, ctx);
        let argv = adapter.build_command(req.model.as_deref(), req.reasoning.as_deref());
        let stdin_prompt = if adapter.stdin_prompt() {
            req.stdin_prompt.clone()
        } else {
            None
        };

        let docker_args = build_docker_args(
            adapter.container_image(),
            &self.workspace,
            &mounts,
            &env,
            stdin_prompt.is_some(),
            &argv,
        );
        let mut spec = CommandSpec {
            program: "docker".to_string(),
            args: docker_args,
            cwd: None,
            env: Vec::new(),
            pipe_stdin: stdin_prompt.is_some(),
        };
        // The runner seam rewrites this spec in tests.
        spec.env.push(("AGENTIUM_LOG_TAG".to_string(), req.log_tag.clone()));

        let started_at = Utc::now();
        let started = Instant::now();
        debug!(tag = %req.log_tag, adapter = %adapter.name(), "launching agent container");

        let child = (self.runner)(&spec).map_err(ExecutorError::SpawnFailed)?;
        let output = run_child(child, stdin_prompt.clone(), cancel).await?;
        let ended_at = Utc::now();
        let duration = started.elapsed();

        if output.exit_code != 0 {
            warn!(
                tag = %req.log_tag,
                exit_code = output.exit_code,
                elapsed_secs = duration.as_secs_f64(),
                stderr = %truncate_for_log(&output.stderr),
                stdout = %truncate_for_log(&output.stdout),
                "agent container exited non-zero"
            );
        }

        let parsed = adapter.parse_output(output.exit_code, &output.stdout, &output.stderr);
        let status = parse_agent_status(&parsed.text_content);

        self.record_audit_events(&req.log_tag, &parsed.events).await;

        if !req.skip_store_updates {
            self.project_into_stores(ctx, &parsed.text_content, &output.stderr)
                .await;
        }

        Ok(IterationResult {
            exit_code: output.exit_code,
            success: output.exit_code == 0,
            text_content: parsed.text_content,
            stderr: output.stderr,
            events: parsed.events,
            status,
            token_usage: parsed.token_usage,
            started_at,
            ended_at,
            stdin_prompt,
            adapter_used: adapter.name().to_string(),
        })
    }

    /// One registry login per session, and only when the image needs one.
    async fn ensure_registry_login(&self, cancel: &CancellationToken, adapter: &dyn AgentAdapter) {
        if !adapter.container_image().starts_with("ghcr.io/") || self.github_token.is_empty() {
            return;
        }
        let mut done = self.registry_login_done.lock().await;
        if *done {
            return;
        }
        let spec = CommandSpec::new(
            "docker",
            &["login", "ghcr.io", "-u", "x-access-token", "--password-stdin"],
        )
        .with_stdin();
        match (self.runner)(&spec) {
            Ok(child) => match run_child(child, Some(self.github_token.clone()), cancel).await {
                Ok(output) if output.success() => {
                    info!("container registry login succeeded");
                    *done = true;
                }
                Ok(output) => {
                    warn!(stderr = %truncate_for_log(&output.stderr), "container registry login failed")
                }
                Err(e) => warn!(error = %e, "container registry login failed"),
            },
            Err(e) => warn!(error = %e, "could not spawn docker login"),
        }
    }

    /// Write the adapter's credential files under a `0700` directory with
    /// `0600` modes, chowned to the container runtime uid when running as
    /// root. Returns (host, container) mount pairs.
    fn provision_credentials(
        &self,
        adapter: &dyn AgentAdapter,
    ) -> Result<Vec<(PathBuf, String)>> {
        let files = adapter.credential_files(&self.config);
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let cred_dir = self.workspace.join(".agentium").join("credentials");
        std::fs::create_dir_all(&cred_dir)
            .with_context(|| format!("create {}", cred_dir.display()))?;
        set_unix_mode(&cred_dir, 0o700)?;

        let mut mounts = Vec::new();
        for CredentialFile {
            name,
            container_path,
            content_base64,
        } in files
        {
            let content = BASE64
                .decode(content_base64.as_bytes())
                .with_context(|| format!("decode credential {name}"))?;
            let host_path = cred_dir.join(&name);
            std::fs::write(&host_path, content)
                .with_context(|| format!("write {}", host_path.display()))?;
            set_unix_mode(&host_path, 0o600)?;
            chown_to_agent_uid(&host_path);
            mounts.push((host_path, container_path));
        }
        chown_to_agent_uid(&cred_dir);
        Ok(mounts)
    }

    fn build_container_env(
        &self,
        adapter: &dyn AgentAdapter,
        req: &ExecRequest,
        ctx: &TaskContext,
    ) -> Vec<(String, String)> {
        let mut env = adapter.build_env(&self.config);
        env.push((
            "AGENTIUM_ITERATION".to_string(),
            ctx.phase_iteration.to_string(),
        ));
        env.push((
            "AGENTIUM_CLONE_INSIDE".to_string(),
            if self.config.clone_inside_container {
                "1".to_string()
            } else {
                "0".to_string()
            },
        ));
        env.push((
            "AGENTIUM_REPOSITORY".to_string(),
            self.config.repo_slug(),
        ));
        env.push(("GITHUB_TOKEN".to_string(), self.github_token.clone()));
        env.extend(req.extra_env.iter().cloned());
        env
    }

    async fn record_audit_events(&self, tag: &str, events: &[AuditEvent]) {
        self.audit.append(tag, events);
        if !events.is_empty() {
            self.sink
                .write(
                    LogSeverity::Debug,
                    "agent_events",
                    Some(serde_json::json!({"tag": tag, "count": events.len(), "events": events})),
                )
                .await;
        }
    }

    /// Memory signals come from the agent text plus stderr; the handoff block
    /// only from the text. Malformed handoff JSON is skipped with a warning —
    /// memory parsing already happened by then.
    async fn project_into_stores(&self, ctx: &TaskContext, text: &str, stderr: &str) {
        let combined = format!("{text}\n{stderr}");
        let signals = parse_memory_signals(&combined);
        if !signals.is_empty() {
            let pruned = self.memory.lock().await.append(
                signals,
                ctx.session_iteration,
                ctx.phase_iteration,
                &ctx.task_id,
            );
            if pruned > 0 {
                debug!(pruned, "memory pruned during signal projection");
            }
        }

        match parse_handoff_block(text, ctx.phase) {
            Some(Ok(output)) => {
                let stored = self.handoff.lock().await.record(
                    &ctx.task_id,
                    ctx.phase,
                    ctx.phase_iteration,
                    output,
                );
                if !stored {
                    debug!(
                        task = %ctx.task_id,
                        phase = %ctx.phase,
                        iteration = ctx.phase_iteration,
                        "handoff for this iteration already recorded, keeping first write"
                    );
                }
            }
            Some(Err(e)) => {
                warn!(task = %ctx.task_id, phase = %ctx.phase, error = %e, "skipping malformed handoff block");
            }
            None => {}
        }
    }
}

/// Assemble the `docker run` argument list.
pub fn build_docker_args(
    image: &str,
    workspace: &std::path::Path,
    credential_mounts: &[(PathBuf, String)],
    env: &[(String, String)],
    interactive_stdin: bool,
    command: &[String],
) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];
    if interactive_stdin {
        args.push("-i".to_string());
    }
    args.push("-v".to_string());
    args.push(format!("{}:/workspace", workspace.display()));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    for (host, container) in credential_mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{container}:ro", host.display()));
    }
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(image.to_string());
    args.extend_from_slice(command);
    args
}

fn truncate_for_log(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= LOG_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(LOG_EXCERPT_CHARS).collect()
}

fn set_unix_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {:o} {}", mode, path.display()))?;
    }
    Ok(())
}

/// Container runtime uid for credential ownership when the controller runs
/// as root.
const AGENT_UID: u32 = 1000;

fn chown_to_agent_uid(path: &std::path::Path) {
    #[cfg(unix)]
    {
        // Only meaningful (and permitted) when running as root.
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        if let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
            unsafe {
                libc::chown(cpath.as_ptr(), AGENT_UID, AGENT_UID);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── fallback classification ───────────────────────────────────────────

    #[test]
    fn no_error_is_never_an_execution_failure() {
        assert!(!is_adapter_execution_failure(
            None,
            "anything",
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn infra_patterns_match_regardless_of_duration() {
        let long = Duration::from_secs(120);
        for pattern in [
            "Is a directory",
            "no such file or directory",
            "permission denied",
            "docker: Error response from daemon",
            "No such image: ghcr.io/x",
            "connection refused",
            "could not read auth file",
            "OCI runtime create failed",
        ] {
            assert!(
                is_adapter_execution_failure(Some(pattern), "", long),
                "pattern should classify as infra failure: {pattern}"
            );
        }
    }

    #[test]
    fn pattern_in_stderr_also_matches() {
        assert!(is_adapter_execution_failure(
            Some("exit code 1"),
            "docker: Error response from daemon: No such image",
            Duration::from_secs(300)
        ));
    }

    #[test]
    fn fast_failure_without_pattern_matches() {
        assert!(is_adapter_execution_failure(
            Some("exit code 1"),
            "tests failed",
            Duration::from_secs(2)
        ));
    }

    #[test]
    fn slow_failure_without_pattern_does_not_match() {
        assert!(!is_adapter_execution_failure(
            Some("exit code 1"),
            "tests failed",
            Duration::from_secs(30)
        ));
    }

    // ── docker argv ───────────────────────────────────────────────────────

    #[test]
    fn docker_args_shape() {
        let args = build_docker_args(
            "ghcr.io/agentium/claude-runner:latest",
            std::path::Path::new("/workspace"),
            &[(
                PathBuf::from("/workspace/.agentium/credentials/claude-auth.json"),
                "/home/agent/.claude/.credentials.json".to_string(),
            )],
            &[("GITHUB_TOKEN".to_string(), "ghs_x".to_string())],
            true,
            &["claude".to_string(), "--print".to_string()],
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm -i"));
        assert!(joined.contains("-v /workspace:/workspace"));
        assert!(joined.contains(":/home/agent/.claude/.credentials.json:ro"));
        assert!(joined.contains("-e GITHUB_TOKEN=ghs_x"));
        assert!(joined.ends_with("ghcr.io/agentium/claude-runner:latest claude --print"));
    }

    #[test]
    fn docker_args_without_stdin_omit_interactive() {
        let args = build_docker_args(
            "img",
            std::path::Path::new("/w"),
            &[],
            &[],
            false,
            &["cmd".to_string()],
        );
        assert!(!args.contains(&"-i".to_string()));
    }

    // ── truncation ────────────────────────────────────────────────────────

    #[test]
    fn truncate_for_log_bounds_output() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_for_log(&long).len(), LOG_EXCERPT_CHARS);
        assert_eq!(truncate_for_log("short"), "short");
    }
}

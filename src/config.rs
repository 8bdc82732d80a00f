//! Session configuration.
//!
//! A session is configured once at startup from, in order of preference:
//! 1. the `AGENTIUM_SESSION_CONFIG` environment variable (inline JSON),
//! 2. the file named by `AGENTIUM_CONFIG_PATH` (or `--config`),
//! 3. `/etc/agentium/session.json`.
//!
//! The configuration is immutable for the session's lifetime; the only
//! mutation is the sensitive-field scrub during cleanup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SessionError;

/// Default config file consulted when no env override is present.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agentium/session.json";

/// Default workspace mount point.
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identifier, used in log tags and audit artifacts.
    #[serde(default)]
    pub id: String,
    /// `owner/repo` slug or full GitHub URL.
    #[serde(default)]
    pub repository: String,
    /// Issue numbers to resolve, as strings.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// PR numbers to shepherd through review, as strings.
    #[serde(default)]
    pub prs: Vec<String>,
    /// Primary agent adapter name.
    #[serde(default)]
    pub agent: String,
    /// Cap on total session iterations across all tasks.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock cap, e.g. "45m" or "2h".
    #[serde(default)]
    pub max_duration: Option<String>,
    /// Optional freeform workflow prompt appended to every worker prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_context: PromptContextConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub claude_auth: ClaudeAuthConfig,
    #[serde(default)]
    pub codex_auth: CodexAuthConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub phase_loop: PhaseLoopConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub model_routing: HashMap<String, ModelRoute>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub clone_inside_container: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptContextConfig {
    #[serde(default)]
    pub issue_url: Option<String>,
    /// User parameters for `{{variable}}` substitution; these override the
    /// built-in variables on collision.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
    #[serde(default)]
    pub private_key_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    Oauth,
    ApiKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeAuthConfig {
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub auth_json_base64: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodexAuthConfig {
    #[serde(default)]
    pub auth_json_base64: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Remote system prompt URL; the embedded default is used when unset or
    /// when the fetch fails.
    #[serde(default)]
    pub system_md_url: Option<String>,
    /// Fetch timeout, e.g. "10s".
    #[serde(default)]
    pub fetch_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_max_entries")]
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_memory_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLoopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Byte budget for the phase output passed to the judge; the tail wins.
    #[serde(default = "default_judge_context_budget")]
    pub judge_context_budget: usize,
    /// Per-phase iteration budget overrides. Keys are `"<PHASE>"` or
    /// `"<PHASE>_<PATH>"` (e.g. `"PLAN"`, `"IMPLEMENT_SIMPLE"`); the most
    /// specific key wins.
    #[serde(default)]
    pub max_iterations_per_phase: HashMap<String, u32>,
}

impl Default for PhaseLoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            judge_context_budget: default_judge_context_budget(),
            max_iterations_per_phase: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStrategy {
    #[default]
    Sequential,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: DelegationStrategy,
    /// Per-phase sub-agent assignments, keyed by phase token (`"IMPLEMENT"`).
    #[serde(default)]
    pub sub_agents: HashMap<String, SubTaskConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubTaskConfig {
    /// Adapter to delegate to; empty means the session's primary agent.
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Extra instructions prefixed to the delegated prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fallback_adapter")]
    pub default_adapter: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_adapter: default_fallback_adapter(),
        }
    }
}

/// One entry in the model-routing table. Keys in the table are phase tokens
/// (`"IMPLEMENT"`), judge keys (`"PLAN_JUDGE"`, `"JUDGE"`), or `"default"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRoute {
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_memory_max_entries() -> usize {
    200
}

fn default_judge_context_budget() -> usize {
    16 * 1024
}

fn default_fallback_adapter() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    /// Resolve configuration through the env → file → default-path chain.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, SessionError> {
        if let Ok(inline) = std::env::var("AGENTIUM_SESSION_CONFIG")
            && !inline.trim().is_empty()
        {
            let config: Self =
                serde_json::from_str(&inline).map_err(SessionError::ConfigParse)?;
            return config.validated();
        }

        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("AGENTIUM_CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let content =
            std::fs::read_to_string(&path).map_err(|source| SessionError::ConfigRead {
                path: path.display().to_string(),
                source,
            })?;
        let config: Self = serde_json::from_str(&content).map_err(SessionError::ConfigParse)?;
        config.validated()
    }

    /// Parse a config from a JSON string (used by tests and the validate
    /// subcommand).
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self = serde_json::from_str(json).map_err(SessionError::ConfigParse)?;
        config.validated()
    }

    fn validated(self) -> Result<Self, SessionError> {
        if self.id.trim().is_empty() {
            return Err(SessionError::Config("id is required".into()));
        }
        if self.repository.trim().is_empty() {
            return Err(SessionError::Config("repository is required".into()));
        }
        if self.tasks.is_empty() && self.prs.is_empty() {
            return Err(SessionError::Config(
                "at least one of tasks or prs is required".into(),
            ));
        }
        if self.agent.trim().is_empty() {
            return Err(SessionError::Config("agent is required".into()));
        }
        Ok(self)
    }

    /// Workspace path: `AGENTIUM_WORKDIR` or `/workspace`.
    pub fn workdir() -> PathBuf {
        std::env::var("AGENTIUM_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKDIR))
    }

    /// `owner/repo` slug, accepting either a slug or a GitHub URL.
    pub fn repo_slug(&self) -> String {
        let trimmed = self
            .repository
            .trim_end_matches(".git")
            .trim_end_matches('/');
        match trimmed.split_once("github.com") {
            Some((_, rest)) => rest.trim_start_matches(['/', ':']).to_string(),
            None => trimmed.to_string(),
        }
    }

    /// Parsed wall-clock cap, if configured.
    pub fn max_duration(&self) -> Result<Option<Duration>> {
        match &self.max_duration {
            None => Ok(None),
            Some(raw) => {
                let parsed = humantime::parse_duration(raw)
                    .with_context(|| format!("invalid max_duration: {raw}"))?;
                Ok(Some(parsed))
            }
        }
    }

    /// Parsed system-prompt fetch timeout, defaulting to 10 seconds.
    pub fn prompt_fetch_timeout(&self) -> Duration {
        self.prompts
            .fetch_timeout
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
            .unwrap_or(Duration::from_secs(10))
    }

    /// Clear credential material and the workflow prompt. Called during
    /// cleanup before any best-effort teardown that could hang.
    pub fn scrub_sensitive(&mut self) {
        self.claude_auth.auth_json_base64 = None;
        self.codex_auth.auth_json_base64 = None;
        self.github.private_key_secret = None;
        self.prompt = None;
    }
}

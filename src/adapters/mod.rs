//! Agent adapters and model routing.
//!
//! An adapter describes one agent runtime: its container image, argv, env,
//! credential mounts, and output parser. Adapters are registered explicitly
//! at session construction — there is no registration by import side-effect —
//! so tests can assemble a registry of stubs.

pub mod claude;
pub mod codex;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::audit::AuditEvent;
use crate::config::{ModelRoute, SessionConfig};
use crate::phases::TaskPhase;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;

/// Token accounting reported by an agent run, when the runtime exposes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Adapter-parsed view of one container run.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    /// The agent's assembled text output; signals are scanned out of this
    /// plus stderr.
    pub text_content: String,
    pub events: Vec<AuditEvent>,
    pub token_usage: Option<TokenUsage>,
}

/// A credential file to place in the workspace and mount into the container.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    /// File name under the session credential directory.
    pub name: String,
    /// Mount target inside the container.
    pub container_path: String,
    /// Base64 content from the session config.
    pub content_base64: String,
}

/// Capability set describing one agent runtime.
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn container_image(&self) -> &str;

    /// Adapter-specific environment to merge into the container env.
    fn build_env(&self, config: &SessionConfig) -> Vec<(String, String)>;

    /// Argv executed inside the container.
    fn build_command(&self, model: Option<&str>, reasoning: Option<&str>) -> Vec<String>;

    /// Parse the container's exit status and both streams.
    fn parse_output(&self, exit_code: i32, stdout: &str, stderr: &str) -> ParsedOutput;

    /// Credential files to provision for this adapter.
    fn credential_files(&self, config: &SessionConfig) -> Vec<CredentialFile>;

    /// Whether the prompt is delivered on stdin (the alternative is argv).
    fn stdin_prompt(&self) -> bool {
        true
    }

    /// Whether the runtime can resume a prior conversation.
    fn continuation_capable(&self) -> bool {
        false
    }
}

/// Explicitly assembled adapter set with a default.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    default_name: String,
}

impl AdapterRegistry {
    pub fn new(default_name: &str) -> Self {
        Self {
            adapters: HashMap::new(),
            default_name: default_name.to_string(),
        }
    }

    /// The built-in adapter set used by the binary.
    pub fn builtin(default_name: &str) -> Self {
        let mut registry = Self::new(default_name);
        registry.register(Arc::new(ClaudeAdapter::new()));
        registry.register(Arc::new(CodexAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Resolve by name, falling back to the default adapter with a warning
    /// for unknown names.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn AgentAdapter>> {
        if let Some(adapter) = self.adapters.get(name) {
            return Some(Arc::clone(adapter));
        }
        warn!(requested = name, default = %self.default_name, "unknown adapter, using default");
        self.adapters.get(&self.default_name).map(Arc::clone)
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }
}

/// A routing decision for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDecision {
    pub adapter: Option<String>,
    pub model: Option<String>,
    pub reasoning: Option<String>,
}

impl RouteDecision {
    fn from_route(route: &ModelRoute) -> Self {
        Self {
            adapter: route.adapter.clone(),
            model: route.model.clone(),
            reasoning: route.reasoning.clone(),
        }
    }

    pub fn has_model_override(&self) -> bool {
        self.model.is_some()
    }
}

/// Phase-keyed model routing table.
#[derive(Debug, Clone, Default)]
pub struct ModelRouting {
    routes: HashMap<String, ModelRoute>,
}

impl ModelRouting {
    pub fn new(routes: HashMap<String, ModelRoute>) -> Self {
        Self { routes }
    }

    /// Worker runs look up the phase token, then `default`.
    pub fn worker_route(&self, phase: TaskPhase) -> RouteDecision {
        self.lookup(&[phase.token(), "default"])
    }

    /// Judge runs look up `<PHASE>_JUDGE`, then `JUDGE`, then `default`.
    pub fn judge_route(&self, phase: TaskPhase) -> RouteDecision {
        let phase_judge = format!("{}_JUDGE", phase.token());
        self.lookup(&[phase_judge.as_str(), "JUDGE", "default"])
    }

    fn lookup(&self, keys: &[&str]) -> RouteDecision {
        for key in keys {
            if let Some(route) = self.routes.get(*key) {
                return RouteDecision::from_route(route);
            }
        }
        RouteDecision::default()
    }
}

//! Codex CLI adapter.
//!
//! The runtime writes plain text to stdout; there is no event stream to
//! unpack, so the whole of stdout is the iteration's text content.

use super::{AgentAdapter, CredentialFile, ParsedOutput};
use crate::audit::AuditEvent;
use crate::config::SessionConfig;

const IMAGE: &str = "ghcr.io/agentium/codex-runner:latest";

pub struct CodexAdapter;

impl CodexAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn container_image(&self) -> &str {
        IMAGE
    }

    fn build_env(&self, _config: &SessionConfig) -> Vec<(String, String)> {
        vec![("CODEX_QUIET_MODE".to_string(), "1".to_string())]
    }

    fn build_command(&self, model: Option<&str>, reasoning: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "codex".to_string(),
            "exec".to_string(),
            "--full-auto".to_string(),
        ];
        if let Some(model) = model {
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
        if let Some(level) = reasoning {
            argv.push("--reasoning".to_string());
            argv.push(level.to_string());
        }
        argv
    }

    fn parse_output(&self, exit_code: i32, stdout: &str, _stderr: &str) -> ParsedOutput {
        ParsedOutput {
            text_content: stdout.to_string(),
            events: vec![AuditEvent::new(
                "codex_run",
                serde_json::json!({"exit_code": exit_code, "chars": stdout.len()}),
            )],
            token_usage: None,
        }
    }

    fn credential_files(&self, config: &SessionConfig) -> Vec<CredentialFile> {
        match &config.codex_auth.auth_json_base64 {
            Some(content) => vec![CredentialFile {
                name: "codex-auth.json".to_string(),
                container_path: "/home/agent/.codex/auth.json".to_string(),
                content_base64: content.clone(),
            }],
            None => Vec::new(),
        }
    }
}

//! Claude CLI adapter.
//!
//! The runtime emits stream-json: one JSON event per stdout line. Text blocks
//! are accumulated into the iteration's text content, tool calls become audit
//! events, and the final `result` record (when present) replaces the
//! accumulated text.

use serde::Deserialize;
use serde_json::Value;

use super::{AgentAdapter, CredentialFile, ParsedOutput, TokenUsage};
use crate::audit::AuditEvent;
use crate::config::{AuthMode, SessionConfig};

const IMAGE: &str = "ghcr.io/agentium/claude-runner:latest";

/// Events from the Claude CLI stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct ClaudeAdapter;

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn container_image(&self) -> &str {
        IMAGE
    }

    fn build_env(&self, config: &SessionConfig) -> Vec<(String, String)> {
        let mut env = vec![(
            "CLAUDE_CODE_DISABLE_AUTOUPDATE".to_string(),
            "1".to_string(),
        )];
        if config.claude_auth.auth_mode == AuthMode::ApiKey {
            env.push(("CLAUDE_AUTH_MODE".to_string(), "api-key".to_string()));
        }
        env
    }

    fn build_command(&self, model: Option<&str>, _reasoning: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "claude".to_string(),
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = model {
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
        argv
    }

    fn parse_output(&self, _exit_code: i32, stdout: &str, stderr: &str) -> ParsedOutput {
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut events = Vec::new();
        let mut token_usage = None;

        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(line) {
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            ContentBlock::ToolUse { name, input } => {
                                events.push(AuditEvent::new(
                                    "tool_use",
                                    serde_json::json!({"name": name, "input": input}),
                                ));
                            }
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error,
                    usage,
                }) => {
                    if let Some(usage) = usage {
                        token_usage = Some(TokenUsage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        });
                    }
                    events.push(AuditEvent::new(
                        "result",
                        serde_json::json!({"is_error": is_error}),
                    ));
                    final_result = result;
                }
                Ok(StreamEvent::User {}) | Ok(StreamEvent::System {}) => {}
                Err(_) => {
                    // Not stream-json; treat as plain agent text.
                    accumulated.push_str(line);
                    accumulated.push('\n');
                }
            }
        }

        let mut text_content = final_result.unwrap_or(accumulated);
        if text_content.is_empty() && !stderr.is_empty() {
            text_content = stderr.to_string();
        }

        ParsedOutput {
            text_content,
            events,
            token_usage,
        }
    }

    fn credential_files(&self, config: &SessionConfig) -> Vec<CredentialFile> {
        match &config.claude_auth.auth_json_base64 {
            Some(content) => vec![CredentialFile {
                name: "claude-auth.json".to_string(),
                container_path: "/home/agent/.claude/.credentials.json".to_string(),
                content_base64: content.clone(),
            }],
            None => Vec::new(),
        }
    }

    fn continuation_capable(&self) -> bool {
        true
    }
}

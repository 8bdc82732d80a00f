//! Shared test harness: a scripted command runner and a stub adapter.
//!
//! The scripted runner satisfies the `CmdRunner` seam by matching each
//! requested command against ordered rules and spawning a small shell script
//! that replays the canned stdout/stderr/exit code. Every call is recorded
//! for assertions.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;

use agentium::adapters::{AgentAdapter, CredentialFile, ParsedOutput};
use agentium::config::SessionConfig;
use agentium::repo::{CmdRunner, CommandSpec};

/// One canned process outcome.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl Response {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }
}

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;

struct Rule {
    name: String,
    matcher: Matcher,
    responses: Mutex<VecDeque<Response>>,
    sticky: Mutex<Option<Response>>,
}

/// A recorded command invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub tag: Option<String>,
    pub rule: Option<String>,
}

impl RecordedCall {
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Ordered rule set + call log backing a `CmdRunner`.
#[derive(Default)]
pub struct Script {
    rules: Vec<Rule>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// The log tag the executor attaches to container invocations.
pub fn tag_of(spec: &CommandSpec) -> Option<String> {
    spec.env
        .iter()
        .find(|(k, _)| k == "AGENTIUM_LOG_TAG")
        .map(|(_, v)| v.clone())
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rule(&mut self, name: &str, matcher: Matcher, responses: Vec<Response>) {
        self.rules.push(Rule {
            name: name.to_string(),
            matcher,
            responses: Mutex::new(responses.into_iter().collect()),
            sticky: Mutex::new(None),
        });
    }

    /// Match container runs by log-tag substring.
    pub fn on_tag(&mut self, fragment: &str, responses: Vec<Response>) {
        let fragment_owned = fragment.to_string();
        self.push_rule(
            &format!("tag:{fragment}"),
            Box::new(move |spec| {
                tag_of(spec).is_some_and(|tag| tag.contains(&fragment_owned))
            }),
            responses,
        );
    }

    /// Match plain commands whose `program args…` starts with `prefix`.
    pub fn on_cmd(&mut self, prefix: &str, responses: Vec<Response>) {
        let prefix_owned = prefix.to_string();
        self.push_rule(
            &format!("cmd:{prefix}"),
            Box::new(move |spec| {
                format!("{} {}", spec.program, spec.args.join(" ")).starts_with(&prefix_owned)
            }),
            responses,
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, f: impl Fn(&RecordedCall) -> bool) -> usize {
        self.calls().iter().filter(|c| f(c)).count()
    }

    fn respond(&self, spec: &CommandSpec) -> (Option<String>, Response) {
        for rule in &self.rules {
            if (rule.matcher)(spec) {
                let mut queue = rule.responses.lock().unwrap();
                let response = match queue.pop_front() {
                    Some(response) => {
                        *rule.sticky.lock().unwrap() = Some(response.clone());
                        response
                    }
                    None => rule.sticky.lock().unwrap().clone().unwrap_or_default(),
                };
                return (Some(rule.name.clone()), response);
            }
        }
        (None, Response::default())
    }

    /// Build the `CmdRunner` closure over this script.
    pub fn runner(self: &Arc<Self>) -> CmdRunner {
        let script = Arc::clone(self);
        Arc::new(move |spec: &CommandSpec| {
            let (rule, response) = script.respond(spec);
            script.calls.lock().unwrap().push(RecordedCall {
                program: spec.program.clone(),
                args: spec.args.clone(),
                tag: tag_of(spec),
                rule,
            });

            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(
                    r#"if [ "$AG_STDIN" = "1" ]; then cat >/dev/null; fi; printf %s "$AG_OUT"; printf %s "$AG_ERR" >&2; exit "$AG_CODE""#,
                )
                .env("AG_OUT", &response.stdout)
                .env("AG_ERR", &response.stderr)
                .env("AG_CODE", response.exit_code.to_string())
                .env("AG_STDIN", if spec.pipe_stdin { "1" } else { "0" })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .stdin(if spec.pipe_stdin {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .kill_on_drop(true);
            cmd.spawn()
        })
    }
}

/// Minimal adapter whose container output is taken verbatim.
pub struct StubAdapter {
    name: String,
}

impl StubAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl AgentAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn container_image(&self) -> &str {
        "test.local/agent:latest"
    }

    fn build_env(&self, _config: &SessionConfig) -> Vec<(String, String)> {
        Vec::new()
    }

    fn build_command(&self, model: Option<&str>, _reasoning: Option<&str>) -> Vec<String> {
        let mut argv = vec!["agent-cli".to_string()];
        if let Some(model) = model {
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
        argv
    }

    fn parse_output(&self, _exit_code: i32, stdout: &str, stderr: &str) -> ParsedOutput {
        let text_content = if stdout.is_empty() {
            stderr.to_string()
        } else {
            stdout.to_string()
        };
        ParsedOutput {
            text_content,
            events: Vec::new(),
            token_usage: None,
        }
    }

    fn credential_files(&self, _config: &SessionConfig) -> Vec<CredentialFile> {
        Vec::new()
    }
}

/// Canned `gh issue view` payload.
pub fn issue_json(number: u64, title: &str, label: &str) -> String {
    serde_json::json!({
        "number": number,
        "title": title,
        "body": "as reported",
        "url": format!("https://github.com/octo/widgets/issues/{number}"),
        "labels": [{"name": label}],
        "comments": [],
    })
    .to_string()
}


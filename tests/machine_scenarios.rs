//! Component-level scenarios driven through the phase machine, the executor,
//! and the PR manager with a scripted command runner.

mod common;

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use agentium::adapters::{AdapterRegistry, ModelRouting};
use agentium::audit::AuditLog;
use agentium::cloud::Capabilities;
use agentium::config::SessionConfig;
use agentium::delegation::DelegationRouter;
use agentium::executor::{ContainerExecutor, ExecRequest, TaskContext};
use agentium::github::GhClient;
use agentium::handoff::HandoffStore;
use agentium::machine::PhaseMachine;
use agentium::memory::{MemoryStore, SignalType};
use agentium::phases::{BudgetTable, TaskKind, TaskPhase, WorkflowPath};
use agentium::pr::PrManager;
use agentium::prompt::PromptComposer;
use agentium::repo::RepoClient;
use agentium::review::ReviewJudgePipeline;
use agentium::state::{TaskState, TaskStateStore};

use common::{Response, Script, StubAdapter, issue_json};

struct Fixture {
    machine: PhaseMachine,
    memory: Arc<Mutex<MemoryStore>>,
    cancel: CancellationToken,
    _tmp: TempDir,
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new("stub");
    registry.register(Arc::new(StubAdapter::new("stub")));
    registry.register(Arc::new(StubAdapter::new("stub2")));
    registry
}

fn fixture(config_json: &str, script: Arc<Script>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(SessionConfig::from_json(config_json).unwrap());
    let runner = script.runner();

    let budgets = BudgetTable::new(config.phase_loop.max_iterations_per_phase.clone());
    let state = TaskStateStore::new(&config.tasks, &config.prs, &budgets);
    let memory = Arc::new(Mutex::new(MemoryStore::new(config.memory.max_entries)));
    let handoff = Arc::new(Mutex::new(HandoffStore::new()));
    let audit = Arc::new(AuditLog::new(tmp.path()));
    let capabilities = Capabilities::local();

    let executor = Arc::new(ContainerExecutor::new(
        runner.clone(),
        registry(),
        config.clone(),
        tmp.path().to_path_buf(),
        "test-token".into(),
        memory.clone(),
        handoff.clone(),
        audit,
        capabilities.log_sink,
    ));
    let routing = ModelRouting::new(config.model_routing.clone());
    let pipeline = ReviewJudgePipeline::new(
        executor.clone(),
        routing.clone(),
        memory.clone(),
        &config.agent,
        config.phase_loop.judge_context_budget,
    );
    let composer = PromptComposer::new(
        &config.repo_slug(),
        None,
        None,
        std::collections::HashMap::new(),
    );
    let repo = RepoClient::new(runner.clone(), tmp.path().to_path_buf());
    let gh = GhClient::new(runner.clone(), tmp.path().to_path_buf(), &config.repo_slug());
    let pr = PrManager::new(repo, gh.clone());
    let delegation =
        DelegationRouter::new(config.delegation.clone(), executor.clone(), &config.agent);

    let machine = PhaseMachine::new(
        config.clone(),
        budgets,
        state,
        memory.clone(),
        handoff,
        executor,
        pipeline,
        routing,
        composer,
        pr,
        gh,
        delegation,
        "SYSTEM PROMPT".into(),
    );

    Fixture {
        machine,
        memory,
        cancel: CancellationToken::new(),
        _tmp: tmp,
    }
}

// ── scenario: ITERATE loop then forced advance ───────────────────────────────

#[tokio::test]
async fn iterate_three_times_then_forced_advance_with_override() {
    let mut script = Script::new();
    script.on_cmd("gh issue view", vec![Response::ok(&issue_json(42, "Widget crash", "bug"))]);
    script.on_cmd("gh pr list", vec![Response::ok("[]")]);
    script.on_cmd("gh issue comment", vec![Response::ok("")]);
    script.on_tag("-assessor", vec![Response::ok("AGENTIUM_COMPLEXITY: COMPLEX")]);
    script.on_tag("-review-", vec![Response::ok("the testing section is thin")]);
    script.on_tag(
        "-judge-",
        vec![Response::ok("AGENTIUM_EVAL: ITERATE expand the testing section")],
    );
    script.on_tag("issue:42-PLAN", vec![Response::ok("here is my plan")]);
    let script = Arc::new(script);

    let mut fx = fixture(
        r#"{"id":"s","repository":"octo/widgets","tasks":["42"],"agent":"stub",
            "phase_loop":{"max_iterations_per_phase":{"PLAN":3}}}"#,
        script.clone(),
    );

    for session_iteration in 1..=3 {
        fx.machine
            .run_task_iteration(&fx.cancel, "issue:42", session_iteration)
            .await
            .unwrap();
    }

    let task = fx.machine.state().get("issue:42").unwrap();
    assert_eq!(task.phase, TaskPhase::Implement, "forced advance must move past PLAN");
    assert_eq!(task.phase_iteration, 1, "iteration counter resets on transition");
    assert!(task.controller_overrode, "NOMERGE flag must be set");
    assert_eq!(task.workflow_path, WorkflowPath::Complex);

    // Three judge directives, one per phase iteration, in order.
    let memory = fx.memory.lock().await;
    let directives: Vec<u32> = memory
        .entries_for_task("issue:42")
        .iter()
        .filter(|e| e.signal == SignalType::JudgeDirective)
        .map(|e| e.phase_iteration)
        .collect();
    assert_eq!(directives, vec![1, 2, 3]);
    // Forced advance cleared the reviewer feedback.
    let eval_feedback = memory
        .entries_for_task("issue:42")
        .iter()
        .filter(|e| e.signal == SignalType::EvalFeedback)
        .count();
    assert_eq!(eval_feedback, 0);
    drop(memory);

    // The assessor ran exactly once, and the forced-advance comment was posted.
    assert_eq!(
        script.count_calls(|c| c.tag.as_deref().is_some_and(|t| t.contains("-assessor"))),
        1
    );
    let comment_posted = script.calls().iter().any(|c| {
        c.display().starts_with("gh issue comment")
            && c.args.iter().any(|a| a.contains("Forced advance"))
    });
    assert!(comment_posted, "forced advance must post a phase comment");
}

// ── scenario: adapter fallback on EISDIR ─────────────────────────────────────

#[tokio::test]
async fn adapter_fallback_retries_once_without_model_override() {
    let mut script = Script::new();
    script.on_tag(
        "fallback-check",
        vec![
            Response::fail(126, "docker: Error response from daemon: workdir is a directory"),
            Response::ok("recovered output"),
        ],
    );
    let script = Arc::new(script);

    let config = SessionConfig::from_json(
        r#"{"id":"s","repository":"octo/widgets","tasks":["42"],"agent":"stub",
            "fallback":{"enabled":true,"default_adapter":"stub2"}}"#,
    )
    .unwrap();
    let tmp = TempDir::new().unwrap();
    let memory = Arc::new(Mutex::new(MemoryStore::new(100)));
    let handoff = Arc::new(Mutex::new(HandoffStore::new()));
    let executor = ContainerExecutor::new(
        script.runner(),
        registry(),
        Arc::new(config),
        tmp.path().to_path_buf(),
        String::new(),
        memory,
        handoff,
        Arc::new(AuditLog::new(tmp.path())),
        Capabilities::local().log_sink,
    );

    let mut req = ExecRequest::worker("stub", "prompt".into(), "fallback-check");
    req.model = Some("fancy-model".into());
    let ctx = TaskContext {
        task_id: "issue:42".into(),
        phase: TaskPhase::Implement,
        session_iteration: 1,
        phase_iteration: 1,
    };
    let cancel = CancellationToken::new();
    let result = executor.run_with_fallback(&cancel, req, &ctx).await.unwrap();

    assert!(result.success);
    assert_eq!(result.adapter_used, "stub2", "result must come from the fallback adapter");
    assert_eq!(result.text_content, "recovered output");

    let docker_calls: Vec<_> = script
        .calls()
        .into_iter()
        .filter(|c| c.program == "docker")
        .collect();
    assert_eq!(docker_calls.len(), 2, "exactly primary + one fallback invocation");
    assert!(
        docker_calls[0].args.iter().any(|a| a == "fancy-model"),
        "primary run carries the model override"
    );
    assert!(
        !docker_calls[1].args.iter().any(|a| a == "fancy-model"),
        "fallback run must strip the model override"
    );
}

// ── scenario: branch contamination refusal ───────────────────────────────────

#[tokio::test]
async fn contaminated_branch_never_becomes_a_draft_pr() {
    let mut script = Script::new();
    script.on_cmd(
        "git rev-parse --abbrev-ref HEAD",
        vec![Response::ok("enhancement/issue-334-speedup\n")],
    );
    let script = Arc::new(script);

    let tmp = TempDir::new().unwrap();
    let repo = RepoClient::new(script.runner(), tmp.path().to_path_buf());
    let gh = GhClient::new(script.runner(), tmp.path().to_path_buf(), "octo/widgets");
    let manager = PrManager::new(repo, gh);

    let task = TaskState::new("363", TaskKind::Issue, &BudgetTable::default());
    let cancel = CancellationToken::new();
    let created = manager
        .maybe_create_draft_pr(&cancel, &task, Some("Speed up widgets"))
        .await
        .unwrap();

    assert!(created.is_none(), "contaminated branch must be refused");
    assert_eq!(
        script.count_calls(|c| c.display().starts_with("gh pr create")),
        0,
        "gh pr create must never run for a contaminated branch"
    );
    assert_eq!(
        script.count_calls(|c| c.display().starts_with("git push")),
        0
    );
}

// ── draft PR happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn draft_pr_created_once_for_matching_branch() {
    let mut script = Script::new();
    script.on_cmd(
        "git rev-parse --abbrev-ref HEAD",
        vec![Response::ok("feature/issue-42-crash-fix\n")],
    );
    // No upstream configured: rev-parse of the upstream ref fails.
    script.on_cmd(
        "git rev-parse --abbrev-ref feature/issue-42-crash-fix@{upstream}",
        vec![Response::fail(128, "fatal: no upstream configured")],
    );
    script.on_cmd("git push -u origin", vec![Response::ok("")]);
    script.on_cmd(
        "gh pr create",
        vec![Response::ok("https://github.com/octo/widgets/pull/55\n")],
    );
    let script = Arc::new(script);

    let tmp = TempDir::new().unwrap();
    let repo = RepoClient::new(script.runner(), tmp.path().to_path_buf());
    let gh = GhClient::new(script.runner(), tmp.path().to_path_buf(), "octo/widgets");
    let manager = PrManager::new(repo, gh);

    let mut task = TaskState::new("42", TaskKind::Issue, &BudgetTable::default());
    let cancel = CancellationToken::new();
    let created = manager
        .maybe_create_draft_pr(&cancel, &task, Some("Crash fix"))
        .await
        .unwrap()
        .expect("draft PR must be created");
    assert_eq!(created.number, 55);
    assert_eq!(created.url, "https://github.com/octo/widgets/pull/55");

    // Second call with the flag set is a no-op.
    task.draft_pr_created = true;
    task.pr_number = Some(55);
    let again = manager
        .maybe_create_draft_pr(&cancel, &task, None)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(
        script.count_calls(|c| c.display().starts_with("gh pr create")),
        1,
        "draft PR is created at most once per task"
    );
}

// ── scenario: judge overrides the reviewer ───────────────────────────────────

#[tokio::test]
async fn judge_advance_over_request_changes_sets_nomerge_and_skips_finalization() {
    let implement_handoff = concat!(
        "branch pushed\n",
        "AGENTIUM_HANDOFF\n",
        "```json\n",
        r#"{"branch_name":"feature/issue-42-risky","commits":["abc123 risky change"],"draft_pr_number":77,"draft_pr_url":"https://github.com/octo/widgets/pull/77"}"#,
        "\n```\n",
    );

    let mut script = Script::new();
    script.on_cmd("gh issue view", vec![Response::ok(&issue_json(42, "Risky", "bug"))]);
    script.on_cmd("gh pr list", vec![Response::ok("[]")]);
    script.on_cmd("git rev-parse --abbrev-ref HEAD", vec![Response::ok("main\n")]);
    script.on_tag("-assessor", vec![Response::ok("AGENTIUM_COMPLEXITY: COMPLEX")]);
    script.on_tag(
        "-review-",
        vec![Response::ok(
            "coverage is thin\nAGENTIUM_REVIEW: REQUEST_CHANGES needs more tests",
        )],
    );
    script.on_tag("-judge-", vec![Response::ok("AGENTIUM_EVAL: ADVANCE accepting the risk")]);
    script.on_tag("issue:42-IMPLEMENT", vec![Response::ok(implement_handoff)]);
    script.on_tag("issue:42-", vec![Response::ok("work output")]);
    let script = Arc::new(script);

    let mut fx = fixture(
        r#"{"id":"s","repository":"octo/widgets","tasks":["42"],"agent":"stub"}"#,
        script.clone(),
    );

    // PLAN -> IMPLEMENT -> DOCS -> VERIFY -> COMPLETE, one ADVANCE each.
    for session_iteration in 1..=4 {
        fx.machine
            .run_task_iteration(&fx.cancel, "issue:42", session_iteration)
            .await
            .unwrap();
    }

    let task = fx.machine.state().get("issue:42").unwrap();
    assert_eq!(task.phase, TaskPhase::Complete);
    assert!(task.judge_overrode_reviewer, "override must be recorded as NOMERGE");
    assert!(!task.controller_overrode);
    assert_eq!(task.pr_number, Some(77));
    assert!(!task.pr_merged);

    // NOMERGE completion: no auto-merge attempt, no ready-for-review flip.
    assert_eq!(
        script.count_calls(|c| c.display().starts_with("gh pr merge")),
        0,
        "auto-merge must be skipped under a judge override"
    );
    assert_eq!(
        script.count_calls(|c| c.display().starts_with("gh pr ready")),
        0,
        "the PR must stay a draft for human review"
    );
}

// ── status-driven transitions ────────────────────────────────────────────────

#[tokio::test]
async fn three_test_failures_block_the_task() {
    let mut script = Script::new();
    script.on_cmd("gh issue view", vec![Response::ok(&issue_json(42, "Flaky", "bug"))]);
    script.on_cmd("gh pr list", vec![Response::ok("[]")]);
    script.on_cmd("git rev-parse --abbrev-ref HEAD", vec![Response::ok("main\n")]);
    script.on_tag("-assessor", vec![Response::ok("AGENTIUM_COMPLEXITY: COMPLEX")]);
    script.on_tag("-review-", vec![Response::ok("tests are failing")]);
    script.on_tag(
        "-judge-",
        vec![Response::ok("AGENTIUM_EVAL: ITERATE make the tests pass")],
    );
    script.on_tag(
        "issue:42-",
        vec![Response::ok("AGENTIUM_STATUS: TESTS_FAILED assertion in frob_test")],
    );
    let script = Arc::new(script);

    let mut fx = fixture(
        r#"{"id":"s","repository":"octo/widgets","tasks":["42"],"agent":"stub",
            "phase_loop":{"max_iterations_per_phase":{"PLAN":9,"IMPLEMENT":9}}}"#,
        script,
    );

    for session_iteration in 1..=3 {
        fx.machine
            .run_task_iteration(&fx.cancel, "issue:42", session_iteration)
            .await
            .unwrap();
    }

    let task = fx.machine.state().get("issue:42").unwrap();
    assert_eq!(task.phase, TaskPhase::Blocked, "third strike must block the task");
    assert_eq!(task.test_retries, 3);
}

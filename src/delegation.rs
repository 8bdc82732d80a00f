//! Sub-agent delegation router.
//!
//! A session may assign specific phases to sub-agents (a different adapter or
//! model, with extra instructions). The router owns no back-reference into
//! the controller; it drives delegated iterations through an injected
//! `IterationCapability`, which keeps the ownership graph acyclic and lets
//! tests substitute a recording stub.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{DelegationConfig, DelegationStrategy, SubTaskConfig};
use crate::errors::ExecutorError;
use crate::executor::{ContainerExecutor, ExecRequest, IterationResult, TaskContext};
use crate::phases::TaskPhase;

/// Capability to run one delegated iteration. Implemented by the container
/// executor in production and by stubs in tests.
#[async_trait]
pub trait IterationCapability: Send + Sync {
    async fn run_sub_iteration(
        &self,
        cancel: &CancellationToken,
        req: ExecRequest,
        ctx: &TaskContext,
    ) -> Result<IterationResult, ExecutorError>;
}

#[async_trait]
impl IterationCapability for ContainerExecutor {
    async fn run_sub_iteration(
        &self,
        cancel: &CancellationToken,
        req: ExecRequest,
        ctx: &TaskContext,
    ) -> Result<IterationResult, ExecutorError> {
        self.run_with_fallback(cancel, req, ctx).await
    }
}

/// Routes phases to configured sub-agents.
pub struct DelegationRouter {
    config: DelegationConfig,
    capability: Arc<dyn IterationCapability>,
    primary_agent: String,
}

impl DelegationRouter {
    pub fn new(
        config: DelegationConfig,
        capability: Arc<dyn IterationCapability>,
        primary_agent: &str,
    ) -> Self {
        Self {
            config,
            capability,
            primary_agent: primary_agent.to_string(),
        }
    }

    /// The sub-agent assignment for a phase, when delegation applies.
    pub fn route(&self, phase: TaskPhase) -> Option<&SubTaskConfig> {
        if !self.config.enabled {
            return None;
        }
        self.config.sub_agents.get(phase.token())
    }

    /// Run the phase iteration through the assigned sub-agent, or return
    /// `None` when the phase is not delegated. The only supported strategy is
    /// sequential: one delegated run replaces the worker run.
    pub async fn delegate(
        &self,
        cancel: &CancellationToken,
        ctx: &TaskContext,
        worker_prompt: &str,
    ) -> Option<Result<IterationResult, ExecutorError>> {
        let sub = self.route(ctx.phase)?;
        debug_assert_eq!(self.config.strategy, DelegationStrategy::Sequential);

        let adapter = if sub.agent.is_empty() {
            self.primary_agent.clone()
        } else {
            sub.agent.clone()
        };
        let prompt = match &sub.instructions {
            Some(instructions) => format!("{instructions}\n\n{worker_prompt}"),
            None => worker_prompt.to_string(),
        };
        info!(
            phase = %ctx.phase,
            adapter = %adapter,
            "delegating phase iteration to sub-agent"
        );

        let mut req = ExecRequest::worker(
            &adapter,
            prompt,
            &format!("{}-delegate-{}", ctx.task_id, ctx.phase_iteration),
        );
        req.model = sub.model.clone();
        Some(self.capability.run_sub_iteration(cancel, req, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct RecordingCapability {
        calls: Mutex<Vec<ExecRequest>>,
    }

    #[async_trait]
    impl IterationCapability for RecordingCapability {
        async fn run_sub_iteration(
            &self,
            _cancel: &CancellationToken,
            req: ExecRequest,
            _ctx: &TaskContext,
        ) -> Result<IterationResult, ExecutorError> {
            let adapter = req.adapter_name.clone();
            self.calls.lock().unwrap().push(req);
            Ok(IterationResult {
                exit_code: 0,
                success: true,
                text_content: "delegated".into(),
                stderr: String::new(),
                events: Vec::new(),
                status: None,
                token_usage: None,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                stdin_prompt: None,
                adapter_used: adapter,
            })
        }
    }

    fn router(enabled: bool) -> (DelegationRouter, Arc<RecordingCapability>) {
        let capability = Arc::new(RecordingCapability {
            calls: Mutex::new(Vec::new()),
        });
        let mut sub_agents = HashMap::new();
        sub_agents.insert(
            "DOCS".to_string(),
            SubTaskConfig {
                agent: "codex".to_string(),
                model: Some("gpt-docs".to_string()),
                instructions: Some("Write terse docs.".to_string()),
            },
        );
        let config = DelegationConfig {
            enabled,
            strategy: DelegationStrategy::Sequential,
            sub_agents,
        };
        (
            DelegationRouter::new(config, capability.clone(), "claude"),
            capability,
        )
    }

    fn ctx(phase: TaskPhase) -> TaskContext {
        TaskContext {
            task_id: "issue:42".into(),
            phase,
            session_iteration: 1,
            phase_iteration: 1,
        }
    }

    #[tokio::test]
    async fn delegates_configured_phase_with_overrides() {
        let (router, capability) = router(true);
        let cancel = CancellationToken::new();
        let result = router
            .delegate(&cancel, &ctx(TaskPhase::Docs), "base prompt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.adapter_used, "codex");

        let calls = capability.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model.as_deref(), Some("gpt-docs"));
        let prompt = calls[0].stdin_prompt.as_deref().unwrap();
        assert!(prompt.starts_with("Write terse docs."));
        assert!(prompt.contains("base prompt"));
    }

    #[tokio::test]
    async fn undelegated_phase_returns_none() {
        let (router, _) = router(true);
        let cancel = CancellationToken::new();
        assert!(router
            .delegate(&cancel, &ctx(TaskPhase::Plan), "p")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn disabled_delegation_routes_nothing() {
        let (router, _) = router(false);
        assert!(router.route(TaskPhase::Docs).is_none());
        let cancel = CancellationToken::new();
        assert!(router
            .delegate(&cancel, &ctx(TaskPhase::Docs), "p")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn empty_agent_falls_back_to_primary() {
        let capability = Arc::new(RecordingCapability {
            calls: Mutex::new(Vec::new()),
        });
        let mut sub_agents = HashMap::new();
        sub_agents.insert("DOCS".to_string(), SubTaskConfig::default());
        let config = DelegationConfig {
            enabled: true,
            strategy: DelegationStrategy::Sequential,
            sub_agents,
        };
        let router = DelegationRouter::new(config, capability.clone(), "claude");
        let cancel = CancellationToken::new();
        router
            .delegate(&cancel, &ctx(TaskPhase::Docs), "p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(capability.calls.lock().unwrap()[0].adapter_name, "claude");
    }
}

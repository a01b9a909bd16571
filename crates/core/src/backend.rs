//! Backend trait: one execution capability per agent kind

use agentflow_common::types::{AgentKind, TaskInstanceId, TaskOutcome, TaskParams};
use async_trait::async_trait;

/// Identifies one task invocation within a dispatched group, for logging
/// and workspace naming.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub group_id: String,
    pub task_instance_id: TaskInstanceId,
}

impl ExecutionContext {
    pub fn new(group_id: impl Into<String>, task_instance_id: TaskInstanceId) -> Self {
        Self {
            group_id: group_id.into(),
            task_instance_id,
        }
    }

    /// Log prefix shared by all backends: `[group/task/KIND]`
    pub fn log_prefix(&self, kind: AgentKind) -> String {
        format!("[{}/{}/{}]", self.group_id, self.task_instance_id, kind)
    }
}

/// Execution capability for one agent kind.
///
/// `execute` is infallible by contract: every failure mode (trap, timeout,
/// missing file, bad output) is reported as `TaskOutcome::Failure` so the
/// group executor can persist it and keep the rest of the group running.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        source_reference: &str,
        params: &TaskParams,
    ) -> TaskOutcome;
}

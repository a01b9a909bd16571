//! Storage trait: the transactional row CRUD the core consumes
//!
//! The relational store itself is an external collaborator; this trait
//! captures exactly the reads and writes the scheduler and executor
//! perform. Implementations live in `agentflow-store`.

use agentflow_common::{
    error::Result,
    types::{
        AgentId, AgentRecord, DagTemplate, NewTaskInstance, NewWorkflowInstance, TaskInstance,
        TaskInstanceId, TaskOutcome, TemplateId, WorkflowId, WorkflowInstance, WorkflowStatus,
    },
};
use async_trait::async_trait;
use serde_json::Value;

/// Row CRUD consumed by the scheduler and the task-group executor.
///
/// Status-transition methods are compare-and-swap style: they apply the
/// transition only from admissible source states and report whether a row
/// changed. Terminal workflow states are absorbing by construction.
#[async_trait]
pub trait Store: Send + Sync {
    // -- agent / template rows (written by the API role, read by the core) --

    async fn create_agent(
        &self,
        kind: agentflow_common::types::AgentKind,
        source_reference: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<AgentRecord>;

    async fn agent(&self, id: AgentId) -> Result<Option<AgentRecord>>;

    async fn create_template(
        &self,
        dag_definition: &agentflow_common::types::DagDefinition,
    ) -> Result<DagTemplate>;

    async fn template(&self, id: TemplateId) -> Result<Option<DagTemplate>>;

    // -- workflow instances --

    async fn create_workflow(&self, new: NewWorkflowInstance) -> Result<WorkflowInstance>;

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>>;

    /// CAS QUEUED -> RUNNING, stamping `started_at`. Returns whether the
    /// transition applied; a replayed START_WORKFLOW observes `false`.
    async fn mark_workflow_running(&self, id: WorkflowId) -> Result<bool>;

    /// CAS {QUEUED, RUNNING} -> terminal, stamping `completed_at`. Returns
    /// whether the transition applied; events racing a terminal state
    /// observe `false`.
    async fn finish_workflow(&self, id: WorkflowId, status: WorkflowStatus) -> Result<bool>;

    // -- task instances --

    /// Insert a PENDING task row. `(workflow_instance_id, node_id)` is
    /// unique; a violation surfaces as `Error::Conflict`, which callers
    /// treat as "already materialized".
    async fn insert_task(&self, new: NewTaskInstance) -> Result<TaskInstance>;

    async fn task(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>>;

    async fn task_for_node(
        &self,
        workflow_id: WorkflowId,
        node_id: &str,
    ) -> Result<Option<TaskInstance>>;

    /// Flip the given tasks to QUEUED at group-enqueue time.
    async fn mark_tasks_queued(&self, ids: &[TaskInstanceId]) -> Result<()>;

    /// Bulk flip to RUNNING, stamping `started_at`.
    async fn mark_tasks_running(&self, ids: &[TaskInstanceId]) -> Result<()>;

    /// Persist one task's terminal outcome: status, outputs, logs (error
    /// text), `completed_at`.
    async fn record_task_outcome(
        &self,
        id: TaskInstanceId,
        outcome: &TaskOutcome,
    ) -> Result<()>;

    /// Bulk force-fail with a shared error message (catastrophic group
    /// error or group timeout).
    async fn fail_tasks(&self, ids: &[TaskInstanceId], error: &str) -> Result<()>;

    /// COMPLETED task count for a workflow.
    async fn count_completed(&self, workflow_id: WorkflowId) -> Result<u64>;

    /// COMPLETED task count for a workflow restricted to the given nodes.
    async fn count_completed_in(
        &self,
        workflow_id: WorkflowId,
        node_ids: &[String],
    ) -> Result<u64>;

    async fn tasks_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<TaskInstance>>;
}

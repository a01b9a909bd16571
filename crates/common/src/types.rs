//! Data model and wire types shared across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Agent row id
pub type AgentId = i64;

/// DAG template row id
pub type TemplateId = i64;

/// Workflow instance row id
pub type WorkflowId = i64;

/// Task instance row id
pub type TaskInstanceId = i64;

/// Node identifier within a DAG definition
pub type NodeId = String;

/// Queue drained by scheduler workers
pub const SCHEDULER_QUEUE: &str = "scheduler_queue";

/// Queue drained by compute workers
pub const COMPUTE_QUEUE: &str = "compute_queue";

/// Execution backend kinds an agent can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    Wasm,
    Docker,
    PythonFunction,
    /// Fallback for unrecognized wire values; fails per-task, not per-payload
    #[serde(other)]
    Unknown,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wasm => "WASM",
            Self::Docker => "DOCKER",
            Self::PythonFunction => "PYTHON_FUNCTION",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WASM" => Ok(Self::Wasm),
            "DOCKER" => Ok(Self::Docker),
            "PYTHON_FUNCTION" => Ok(Self::PythonFunction),
            _ => Ok(Self::Unknown),
        }
    }
}

/// Registered executable unit (read-only to the core)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub kind: AgentKind,
    /// Filesystem path for WASM, image ref for Docker, endpoint hint for functions
    pub source_reference: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

/// Workflow instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states are absorbing: no transition leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(crate::error::Error::Internal(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Task instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    /// Transient: observable between materialization and group dispatch
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(crate::error::Error::Internal(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Per-node retry declaration from the template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_seconds: u64,
}

/// Node payload: which agent runs and with what parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default = "empty_object")]
    pub input_params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// One node of a DAG definition; ids are unique within a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: NodeId,
    pub data: NodeData,
}

/// Directed data-dependency edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: NodeId,
    pub to: NodeId,
}

/// A reusable directed graph of agent invocations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl DagDefinition {
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Stored template row (read-only to the core)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagTemplate {
    pub id: TemplateId,
    pub dag_definition: DagDefinition,
}

/// One concrete run of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub template_id: Option<TemplateId>,
    /// Denormalized snapshot taken at submission time
    pub dag_definition: DagDefinition,
    pub status: WorkflowStatus,
    pub priority: i32,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields the API supplies when submitting a workflow
#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub template_id: Option<TemplateId>,
    pub dag_definition: DagDefinition,
    pub priority: i32,
    pub inputs: Option<Value>,
}

/// One node of a workflow instance: one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowId,
    pub node_id: NodeId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub input_params: Value,
    pub outputs: Option<Value>,
    pub logs: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields the scheduler supplies when materializing a node
#[derive(Debug, Clone)]
pub struct NewTaskInstance {
    pub workflow_instance_id: WorkflowId,
    pub node_id: NodeId,
    pub agent_id: AgentId,
    pub input_params: Value,
}

/// Event driving DAG progress, delivered on `scheduler_queue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum SchedulerEvent {
    #[serde(rename = "START_WORKFLOW")]
    StartWorkflow { instance_id: WorkflowId },
    #[serde(rename = "TASK_COMPLETED")]
    TaskCompleted { task_instance_id: TaskInstanceId },
    #[serde(rename = "TASK_FAILED")]
    TaskFailed {
        task_instance_id: TaskInstanceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SchedulerEvent {
    /// Short tag used in logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartWorkflow { .. } => "START_WORKFLOW",
            Self::TaskCompleted { .. } => "TASK_COMPLETED",
            Self::TaskFailed { .. } => "TASK_FAILED",
        }
    }
}

/// Parameters handed to a backend for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default = "empty_object")]
    pub input_params: Value,
}

/// One task within a dispatched group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTask {
    pub task_instance_id: TaskInstanceId,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub source_reference: String,
    pub params: TaskParams,
}

/// Set of tasks that became ready at the same scheduler step,
/// delivered on `compute_queue` under one tracing id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPayload {
    pub group_id: String,
    pub tasks: Vec<GroupTask>,
}

/// Uniform backend result record; task-level failures are data, not errors
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success { output: Value },
    Failure { error: String },
}

impl TaskOutcome {
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scheduler_event_wire_format() {
        let event = SchedulerEvent::StartWorkflow { instance_id: 42 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event_type": "START_WORKFLOW", "instance_id": 42})
        );

        let event: SchedulerEvent =
            serde_json::from_value(json!({"event_type": "TASK_COMPLETED", "task_instance_id": 7}))
                .unwrap();
        assert_eq!(
            event,
            SchedulerEvent::TaskCompleted {
                task_instance_id: 7
            }
        );

        let event: SchedulerEvent = serde_json::from_value(
            json!({"event_type": "TASK_FAILED", "task_instance_id": 7, "error": "boom"}),
        )
        .unwrap();
        assert_eq!(
            event,
            SchedulerEvent::TaskFailed {
                task_instance_id: 7,
                error: Some("boom".to_string())
            }
        );
    }

    #[test]
    fn task_failed_error_is_optional() {
        let event: SchedulerEvent =
            serde_json::from_value(json!({"event_type": "TASK_FAILED", "task_instance_id": 1}))
                .unwrap();
        assert_eq!(
            event,
            SchedulerEvent::TaskFailed {
                task_instance_id: 1,
                error: None
            }
        );
        let text = serde_json::to_string(&event).unwrap();
        assert!(!text.contains("error"));
    }

    #[test]
    fn group_payload_wire_format() {
        let payload: GroupPayload = serde_json::from_value(json!({
            "group_id": "aB3dE6fG9hJ1",
            "tasks": [{
                "task_instance_id": 11,
                "type": "WASM",
                "source_reference": "/modules/adder.wasm",
                "params": {"input_params": {"x": 1}}
            }]
        }))
        .unwrap();
        assert_eq!(payload.tasks.len(), 1);
        assert_eq!(payload.tasks[0].kind, AgentKind::Wasm);
        assert_eq!(payload.tasks[0].params.input_params, json!({"x": 1}));
    }

    #[test]
    fn unknown_agent_kind_deserializes_as_fallback() {
        let task: GroupTask = serde_json::from_value(json!({
            "task_instance_id": 1,
            "type": "COBOL",
            "source_reference": "ref",
            "params": {"input_params": {}}
        }))
        .unwrap();
        assert_eq!(task.kind, AgentKind::Unknown);
    }

    #[test]
    fn statuses_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_value(WorkflowStatus::Running).unwrap(),
            json!("RUNNING")
        );
        assert_eq!(
            serde_json::to_value(TaskStatus::Pending).unwrap(),
            json!("PENDING")
        );
        assert_eq!(
            serde_json::to_value(AgentKind::PythonFunction).unwrap(),
            json!("PYTHON_FUNCTION")
        );
        assert_eq!(
            "RUNNING".parse::<WorkflowStatus>().unwrap(),
            WorkflowStatus::Running
        );
        assert_eq!("FAILED".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn node_input_params_default_to_empty_object() {
        let node: NodeDef =
            serde_json::from_value(json!({"id": "a", "data": {"agent_id": 3}})).unwrap();
        assert_eq!(node.data.input_params, json!({}));
        assert!(node.data.retry_policy.is_none());
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }
}

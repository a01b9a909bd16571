//! In-memory store for tests and embedded runs

use agentflow_common::{
    error::{Error, Result},
    types::{
        AgentId, AgentKind, AgentRecord, DagDefinition, DagTemplate, NewTaskInstance,
        NewWorkflowInstance, TaskInstance, TaskInstanceId, TaskOutcome, TaskStatus, TemplateId,
        WorkflowId, WorkflowInstance, WorkflowStatus,
    },
};
use agentflow_core::Store;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, AgentRecord>,
    templates: HashMap<TemplateId, DagTemplate>,
    workflows: HashMap<WorkflowId, WorkflowInstance>,
    tasks: HashMap<TaskInstanceId, TaskInstance>,
    /// Unique index backing the `(workflow_instance_id, node_id)` constraint
    task_index: HashMap<(WorkflowId, String), TaskInstanceId>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// `Store` implementation holding all rows in process memory.
///
/// Mirrors the relational semantics the core relies on: the task unique
/// index and compare-and-swap status transitions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_agent(
        &self,
        kind: AgentKind,
        source_reference: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<AgentRecord> {
        let mut tables = self.inner.lock();
        let id = tables.next_id();
        let agent = AgentRecord {
            id,
            kind,
            source_reference: source_reference.to_string(),
            input_schema,
            output_schema,
        };
        tables.agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn agent(&self, id: AgentId) -> Result<Option<AgentRecord>> {
        Ok(self.inner.lock().agents.get(&id).cloned())
    }

    async fn create_template(&self, dag_definition: &DagDefinition) -> Result<DagTemplate> {
        let mut tables = self.inner.lock();
        let id = tables.next_id();
        let template = DagTemplate {
            id,
            dag_definition: dag_definition.clone(),
        };
        tables.templates.insert(id, template.clone());
        Ok(template)
    }

    async fn template(&self, id: TemplateId) -> Result<Option<DagTemplate>> {
        Ok(self.inner.lock().templates.get(&id).cloned())
    }

    async fn create_workflow(&self, new: NewWorkflowInstance) -> Result<WorkflowInstance> {
        let mut tables = self.inner.lock();
        let id = tables.next_id();
        let workflow = WorkflowInstance {
            id,
            template_id: new.template_id,
            dag_definition: new.dag_definition,
            status: WorkflowStatus::Queued,
            priority: new.priority,
            inputs: new.inputs,
            outputs: None,
            started_at: None,
            completed_at: None,
        };
        tables.workflows.insert(id, workflow.clone());
        Ok(workflow)
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>> {
        Ok(self.inner.lock().workflows.get(&id).cloned())
    }

    async fn mark_workflow_running(&self, id: WorkflowId) -> Result<bool> {
        let mut tables = self.inner.lock();
        match tables.workflows.get_mut(&id) {
            Some(workflow) if workflow.status == WorkflowStatus::Queued => {
                workflow.status = WorkflowStatus::Running;
                workflow.started_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("workflow instance {id}"))),
        }
    }

    async fn finish_workflow(&self, id: WorkflowId, status: WorkflowStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "finish_workflow called with non-terminal status {status}"
            )));
        }
        let mut tables = self.inner.lock();
        match tables.workflows.get_mut(&id) {
            Some(workflow) if !workflow.status.is_terminal() => {
                workflow.status = status;
                workflow.completed_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("workflow instance {id}"))),
        }
    }

    async fn insert_task(&self, new: NewTaskInstance) -> Result<TaskInstance> {
        let mut tables = self.inner.lock();
        let key = (new.workflow_instance_id, new.node_id.clone());
        if tables.task_index.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "task for workflow {} node '{}' already exists",
                new.workflow_instance_id, new.node_id
            )));
        }
        let id = tables.next_id();
        let task = TaskInstance {
            id,
            workflow_instance_id: new.workflow_instance_id,
            node_id: new.node_id,
            agent_id: new.agent_id,
            status: TaskStatus::Pending,
            input_params: new.input_params,
            outputs: None,
            logs: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        };
        tables.task_index.insert(key, id);
        tables.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn task(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn task_for_node(
        &self,
        workflow_id: WorkflowId,
        node_id: &str,
    ) -> Result<Option<TaskInstance>> {
        let tables = self.inner.lock();
        Ok(tables
            .task_index
            .get(&(workflow_id, node_id.to_string()))
            .and_then(|id| tables.tasks.get(id))
            .cloned())
    }

    async fn mark_tasks_queued(&self, ids: &[TaskInstanceId]) -> Result<()> {
        let mut tables = self.inner.lock();
        for id in ids {
            if let Some(task) = tables.tasks.get_mut(id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Queued;
                }
            }
        }
        Ok(())
    }

    async fn mark_tasks_running(&self, ids: &[TaskInstanceId]) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.inner.lock();
        for id in ids {
            if let Some(task) = tables.tasks.get_mut(id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn record_task_outcome(
        &self,
        id: TaskInstanceId,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        let mut tables = self.inner.lock();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task instance {id}")))?;
        match outcome {
            TaskOutcome::Success { output } => {
                task.status = TaskStatus::Completed;
                task.outputs = Some(output.clone());
                task.logs = None;
            }
            TaskOutcome::Failure { error } => {
                task.status = TaskStatus::Failed;
                task.outputs = None;
                task.logs = Some(error.clone());
            }
        }
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_tasks(&self, ids: &[TaskInstanceId], error: &str) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.inner.lock();
        for id in ids {
            if let Some(task) = tables.tasks.get_mut(id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Failed;
                    task.logs = Some(error.to_string());
                    task.completed_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn count_completed(&self, workflow_id: WorkflowId) -> Result<u64> {
        let tables = self.inner.lock();
        Ok(tables
            .tasks
            .values()
            .filter(|t| {
                t.workflow_instance_id == workflow_id && t.status == TaskStatus::Completed
            })
            .count() as u64)
    }

    async fn count_completed_in(
        &self,
        workflow_id: WorkflowId,
        node_ids: &[String],
    ) -> Result<u64> {
        let tables = self.inner.lock();
        Ok(tables
            .tasks
            .values()
            .filter(|t| {
                t.workflow_instance_id == workflow_id
                    && t.status == TaskStatus::Completed
                    && node_ids.contains(&t.node_id)
            })
            .count() as u64)
    }

    async fn tasks_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<TaskInstance>> {
        let tables = self.inner.lock();
        let mut tasks: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.workflow_instance_id == workflow_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}

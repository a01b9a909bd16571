//! Event-driven DAG advancement
//!
//! Handles the three lifecycle events from `scheduler_queue`. State lives
//! in the store only; handlers are idempotent up to the task unique
//! constraint and the absorbing terminal states, so at-least-once delivery
//! is safe.

use crate::dag;
use agentflow_common::{
    error::{Error, Result},
    metrics,
    types::{
        GroupPayload, GroupTask, NewTaskInstance, NodeDef, SchedulerEvent, TaskInstanceId,
        TaskParams, WorkflowId, WorkflowInstance, WorkflowStatus,
    },
    COMPUTE_QUEUE,
};
use agentflow_core::{publish_json, EventBus, QueueConsumer, Store};
use async_trait::async_trait;
use nanoid::nanoid;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Scheduler over a store and a bus.
///
/// Per-workflow serialization relies on a single scheduler consumer; the
/// task unique constraint and the status CAS in the store remain as
/// defense in depth against concurrent consumers.
pub struct Scheduler {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Handle one lifecycle event.
    #[instrument(skip(self, event), fields(event_type = event.kind()))]
    pub async fn handle(&self, event: SchedulerEvent) -> Result<()> {
        metrics::record_scheduler_event(event.kind());
        debug!(?event, "handling scheduler event");

        match event {
            SchedulerEvent::StartWorkflow { instance_id } => {
                self.start_workflow(instance_id).await
            }
            SchedulerEvent::TaskCompleted { task_instance_id } => {
                self.task_completed(task_instance_id).await
            }
            SchedulerEvent::TaskFailed {
                task_instance_id,
                error,
            } => self.task_failed(task_instance_id, error).await,
        }
    }

    async fn start_workflow(&self, instance_id: WorkflowId) -> Result<()> {
        let Some(workflow) = self.store.workflow(instance_id).await? else {
            warn!(instance_id, "workflow instance not found, ignoring");
            return Ok(());
        };

        let dag_def = &workflow.dag_definition;

        if dag::is_cyclic(dag_def) {
            error!(instance_id, "cycle detected in workflow definition");
            self.fail_workflow(instance_id).await?;
            return Ok(());
        }

        let start_nodes = dag::start_nodes(dag_def);
        if start_nodes.is_empty() {
            error!(instance_id, "workflow has no start nodes");
            self.fail_workflow(instance_id).await?;
            return Ok(());
        }

        if !self.store.mark_workflow_running(instance_id).await? {
            // re-delivered START_WORKFLOW or an already-terminal instance
            info!(instance_id, "workflow is not QUEUED, ignoring");
            return Ok(());
        }
        metrics::record_workflow_transition("RUNNING");
        info!(instance_id, starts = start_nodes.len(), "workflow started");

        let nodes: Vec<NodeDef> = start_nodes.into_iter().cloned().collect();
        self.dispatch_task_group(&workflow, &nodes).await
    }

    async fn task_completed(&self, task_instance_id: TaskInstanceId) -> Result<()> {
        let Some(task) = self.store.task(task_instance_id).await? else {
            warn!(task_instance_id, "task instance not found, ignoring");
            return Ok(());
        };
        let Some(workflow) = self.store.workflow(task.workflow_instance_id).await? else {
            warn!(
                workflow_id = task.workflow_instance_id,
                "workflow instance not found, ignoring"
            );
            return Ok(());
        };
        if workflow.status.is_terminal() {
            debug!(
                workflow_id = workflow.id,
                status = %workflow.status,
                "ignoring task event for terminal workflow"
            );
            return Ok(());
        }

        let dag_def = workflow.dag_definition.clone();

        // materialize downstream nodes whose dependencies are now satisfied;
        // the existence check plus the unique constraint stop sibling
        // completions from dispatching the same node twice
        let mut ready: Vec<NodeDef> = Vec::new();
        for node_id in dag::downstream(&dag_def, &task.node_id) {
            if self
                .store
                .task_for_node(workflow.id, node_id)
                .await?
                .is_some()
            {
                continue;
            }
            if !dag::dependencies_met(self.store.as_ref(), workflow.id, node_id, &dag_def).await? {
                continue;
            }
            if let Some(node) = dag_def.node(node_id) {
                ready.push(node.clone());
            }
        }

        if !ready.is_empty() {
            self.dispatch_task_group(&workflow, &ready).await?;
        }

        let completed = self.store.count_completed(workflow.id).await?;
        if completed == dag_def.nodes.len() as u64
            && self
                .store
                .finish_workflow(workflow.id, WorkflowStatus::Completed)
                .await?
        {
            metrics::record_workflow_transition("COMPLETED");
            info!(workflow_id = workflow.id, "workflow completed");
        }

        Ok(())
    }

    async fn task_failed(
        &self,
        task_instance_id: TaskInstanceId,
        error: Option<String>,
    ) -> Result<()> {
        let Some(task) = self.store.task(task_instance_id).await? else {
            warn!(task_instance_id, "task instance not found, ignoring");
            return Ok(());
        };
        let Some(workflow) = self.store.workflow(task.workflow_instance_id).await? else {
            return Ok(());
        };
        if workflow.status.is_terminal() {
            return Ok(());
        }

        // declared retry_policy is stored but not consulted: a task failure
        // terminates the workflow; in-flight sibling tasks finish on their
        // own and their late events are absorbed above
        if self
            .store
            .finish_workflow(workflow.id, WorkflowStatus::Failed)
            .await?
        {
            metrics::record_workflow_transition("FAILED");
            error!(
                workflow_id = workflow.id,
                task_instance_id,
                error = error.as_deref().unwrap_or("unknown"),
                "task failed, workflow marked FAILED"
            );
        }

        Ok(())
    }

    async fn fail_workflow(&self, id: WorkflowId) -> Result<()> {
        if self
            .store
            .finish_workflow(id, WorkflowStatus::Failed)
            .await?
        {
            metrics::record_workflow_transition("FAILED");
        }
        Ok(())
    }

    /// Materialize the given nodes as task instances and enqueue them as
    /// one group on `compute_queue`, preserving definition order.
    pub async fn dispatch_task_group(
        &self,
        workflow: &WorkflowInstance,
        nodes: &[NodeDef],
    ) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        let group_id = nanoid!(12);
        info!(
            workflow_id = workflow.id,
            group_id,
            nodes = nodes.len(),
            "creating task group"
        );

        let mut task_ids: Vec<TaskInstanceId> = Vec::new();
        let mut group_tasks: Vec<GroupTask> = Vec::new();

        for node in nodes {
            let Some(agent_id) = node.data.agent_id else {
                error!(
                    workflow_id = workflow.id,
                    node_id = %node.id,
                    "node does not define an agent_id, failing workflow"
                );
                self.fail_workflow(workflow.id).await?;
                return Ok(());
            };

            let Some(agent) = self.store.agent(agent_id).await? else {
                error!(
                    workflow_id = workflow.id,
                    node_id = %node.id,
                    agent_id,
                    "agent not found, failing workflow"
                );
                self.fail_workflow(workflow.id).await?;
                return Ok(());
            };

            let task = match self
                .store
                .insert_task(NewTaskInstance {
                    workflow_instance_id: workflow.id,
                    node_id: node.id.clone(),
                    agent_id,
                    input_params: node.data.input_params.clone(),
                })
                .await
            {
                Ok(task) => task,
                Err(Error::Conflict(_)) => {
                    debug!(
                        workflow_id = workflow.id,
                        node_id = %node.id,
                        "node already materialized, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            task_ids.push(task.id);
            group_tasks.push(GroupTask {
                task_instance_id: task.id,
                kind: agent.kind,
                source_reference: agent.source_reference,
                params: TaskParams {
                    input_params: task.input_params,
                },
            });
        }

        if group_tasks.is_empty() {
            metrics::record_group_dispatch("empty");
            return Ok(());
        }

        self.store.mark_tasks_queued(&task_ids).await?;
        publish_json(
            self.bus.as_ref(),
            COMPUTE_QUEUE,
            &GroupPayload {
                group_id: group_id.clone(),
                tasks: group_tasks,
            },
        )
        .await?;
        metrics::record_group_dispatch("dispatched");
        info!(
            group_id,
            tasks = task_ids.len(),
            "task group dispatched to compute_queue"
        );

        Ok(())
    }
}

/// `scheduler_queue` consumer wrapping the scheduler.
pub struct SchedulerConsumer {
    scheduler: Arc<Scheduler>,
}

impl SchedulerConsumer {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl QueueConsumer for SchedulerConsumer {
    async fn handle(&self, payload: Value) -> Result<()> {
        let event: SchedulerEvent = serde_json::from_value(payload)?;
        self.scheduler.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_bus::InProcessBus;
    use agentflow_common::types::{
        AgentKind, NewWorkflowInstance, TaskOutcome, TaskStatus,
    };
    use agentflow_store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: Arc<InProcessBus>,
        scheduler: Scheduler,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let bus = Arc::new(InProcessBus::default());
            let scheduler = Scheduler::new(store.clone(), bus.clone());
            Self {
                store,
                bus,
                scheduler,
            }
        }

        async fn register_agent(&self) -> i64 {
            self.store
                .create_agent(AgentKind::Docker, "example/image:latest", None, None)
                .await
                .unwrap()
                .id
        }

        async fn submit(&self, dag: serde_json::Value) -> WorkflowId {
            self.store
                .create_workflow(NewWorkflowInstance {
                    template_id: None,
                    dag_definition: serde_json::from_value(dag).unwrap(),
                    priority: 0,
                    inputs: None,
                })
                .await
                .unwrap()
                .id
        }

        fn pop_group(&self) -> Option<GroupPayload> {
            self.bus
                .try_pop(COMPUTE_QUEUE)
                .map(|v| serde_json::from_value(v).unwrap())
        }

        /// Persist a success for the node's task and feed the completion
        /// event back, as the executor would.
        async fn complete_node(&self, workflow_id: WorkflowId, node_id: &str) {
            let task = self
                .store
                .task_for_node(workflow_id, node_id)
                .await
                .unwrap()
                .unwrap();
            self.store
                .record_task_outcome(task.id, &TaskOutcome::success(json!({})))
                .await
                .unwrap();
            self.scheduler
                .handle(SchedulerEvent::TaskCompleted {
                    task_instance_id: task.id,
                })
                .await
                .unwrap();
        }
    }

    fn linear_dag(agent_id: i64) -> serde_json::Value {
        json!({
            "nodes": [
                {"id": "a", "data": {"agent_id": agent_id}},
                {"id": "b", "data": {"agent_id": agent_id}}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })
    }

    #[tokio::test]
    async fn cyclic_workflow_fails_without_dispatch() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx
            .submit(json!({
                "nodes": [
                    {"id": "a", "data": {"agent_id": agent}},
                    {"id": "b", "data": {"agent_id": agent}}
                ],
                "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
            }))
            .await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();

        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(fx.pop_group().is_none());
        assert!(fx
            .store
            .tasks_for_workflow(workflow_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn empty_definition_fails() {
        let fx = Fixture::new();
        let workflow_id = fx.submit(json!({"nodes": [], "edges": []})).await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();

        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn start_dispatches_root_nodes_as_one_group() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx.submit(linear_dag(agent)).await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();

        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
        assert!(workflow.started_at.is_some());

        let payload = fx.pop_group().unwrap();
        assert_eq!(payload.group_id.len(), 12);
        assert_eq!(payload.tasks.len(), 1);
        assert_eq!(payload.tasks[0].kind, AgentKind::Docker);
        assert_eq!(payload.tasks[0].source_reference, "example/image:latest");

        let task = fx
            .store
            .task_for_node(workflow_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        // "b" is not ready yet
        assert!(fx
            .store
            .task_for_node(workflow_id, "b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_start_event_does_not_redispatch() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx.submit(linear_dag(agent)).await;

        for _ in 0..2 {
            fx.scheduler
                .handle(SchedulerEvent::StartWorkflow {
                    instance_id: workflow_id,
                })
                .await
                .unwrap();
        }

        assert!(fx.pop_group().is_some());
        assert!(fx.pop_group().is_none());
        assert_eq!(
            fx.store.tasks_for_workflow(workflow_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn completion_advances_and_finishes_the_workflow() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx.submit(linear_dag(agent)).await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();
        fx.pop_group().unwrap();

        fx.complete_node(workflow_id, "a").await;
        let payload = fx.pop_group().unwrap();
        assert_eq!(payload.tasks.len(), 1);

        fx.complete_node(workflow_id, "b").await;
        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.completed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_completion_does_not_redispatch_downstream() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx.submit(linear_dag(agent)).await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();
        fx.pop_group().unwrap();

        let task = fx
            .store
            .task_for_node(workflow_id, "a")
            .await
            .unwrap()
            .unwrap();
        fx.store
            .record_task_outcome(task.id, &TaskOutcome::success(json!({})))
            .await
            .unwrap();

        for _ in 0..2 {
            fx.scheduler
                .handle(SchedulerEvent::TaskCompleted {
                    task_instance_id: task.id,
                })
                .await
                .unwrap();
        }

        assert!(fx.pop_group().is_some());
        assert!(fx.pop_group().is_none());
        assert_eq!(
            fx.store.tasks_for_workflow(workflow_id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn missing_agent_fails_the_workflow() {
        let fx = Fixture::new();
        let workflow_id = fx
            .submit(json!({
                "nodes": [{"id": "a", "data": {"agent_id": 999}}],
                "edges": []
            }))
            .await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();

        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(fx.pop_group().is_none());
    }

    #[tokio::test]
    async fn missing_agent_id_fails_the_workflow() {
        let fx = Fixture::new();
        let workflow_id = fx
            .submit(json!({
                "nodes": [{"id": "a", "data": {}}],
                "edges": []
            }))
            .await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();

        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn task_failure_terminates_and_absorbs_later_events() {
        let fx = Fixture::new();
        let agent = fx.register_agent().await;
        let workflow_id = fx.submit(linear_dag(agent)).await;

        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow {
                instance_id: workflow_id,
            })
            .await
            .unwrap();
        fx.pop_group().unwrap();

        let task = fx
            .store
            .task_for_node(workflow_id, "a")
            .await
            .unwrap()
            .unwrap();
        fx.store
            .record_task_outcome(task.id, &TaskOutcome::failure("boom"))
            .await
            .unwrap();

        fx.scheduler
            .handle(SchedulerEvent::TaskFailed {
                task_instance_id: task.id,
                error: Some("boom".to_string()),
            })
            .await
            .unwrap();
        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);

        // a late completion for the same workflow is ignored, not an error
        fx.scheduler
            .handle(SchedulerEvent::TaskCompleted {
                task_instance_id: task.id,
            })
            .await
            .unwrap();
        let workflow = fx.store.workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(fx.pop_group().is_none());
    }

    #[tokio::test]
    async fn events_for_missing_rows_are_ignored() {
        let fx = Fixture::new();
        fx.scheduler
            .handle(SchedulerEvent::StartWorkflow { instance_id: 404 })
            .await
            .unwrap();
        fx.scheduler
            .handle(SchedulerEvent::TaskCompleted {
                task_instance_id: 404,
            })
            .await
            .unwrap();
        fx.scheduler
            .handle(SchedulerEvent::TaskFailed {
                task_instance_id: 404,
                error: None,
            })
            .await
            .unwrap();
    }
}

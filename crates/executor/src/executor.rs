//! Task-group executor
//!
//! Consumes a dispatched group payload: flips the whole group to RUNNING,
//! runs every task concurrently on its backend, persists each outcome,
//! and emits one scheduler event per task. The group never short-circuits
//! on a task failure; each task's outcome is independent.

use crate::backends::BackendRegistry;
use agentflow_common::{
    error::Result,
    metrics,
    types::{GroupPayload, GroupTask, SchedulerEvent, TaskInstanceId, TaskOutcome},
    SCHEDULER_QUEUE,
};
use agentflow_core::{publish_json, EventBus, ExecutionContext, QueueConsumer, Store};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Concurrent executor for one task group at a time.
pub struct GroupExecutor {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    backends: BackendRegistry,
    soft_timeout: Duration,
}

impl GroupExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        backends: BackendRegistry,
        soft_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            backends,
            soft_timeout,
        }
    }

    /// Entry point for one group payload.
    ///
    /// On a soft timeout every task is force-failed and signalled, and the
    /// call returns `Ok` so the broker does not retry. On a catastrophic
    /// error the same force-fail runs, then the error propagates so the
    /// broker's retry policy can act.
    #[instrument(skip(self, payload), fields(group_id = %payload.group_id))]
    pub async fn execute_group(&self, payload: GroupPayload) -> Result<()> {
        if payload.tasks.is_empty() {
            warn!("received empty task group");
            return Ok(());
        }

        info!(tasks = payload.tasks.len(), "executing task group");
        let start = Instant::now();

        match tokio::time::timeout(self.soft_timeout, self.run_group(&payload)).await {
            Ok(Ok(())) => {
                metrics::record_group_duration("completed", start.elapsed().as_secs_f64());
                info!("task group finished");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "task group failed catastrophically");
                self.abort_group(&payload, &format!("Task group execution failed: {e}"))
                    .await;
                metrics::record_group_duration("failed", start.elapsed().as_secs_f64());
                Err(e)
            }
            Err(_) => {
                error!(
                    timeout_secs = self.soft_timeout.as_secs(),
                    "task group timed out"
                );
                self.abort_group(&payload, "Task group timed out.").await;
                metrics::record_group_duration("timeout", start.elapsed().as_secs_f64());
                Ok(())
            }
        }
    }

    async fn run_group(&self, payload: &GroupPayload) -> Result<()> {
        let ids: Vec<TaskInstanceId> = payload
            .tasks
            .iter()
            .map(|t| t.task_instance_id)
            .collect();

        self.store.mark_tasks_running(&ids).await?;

        metrics::TASKS_IN_FLIGHT.add(payload.tasks.len() as f64);
        let outcomes = futures::future::join_all(
            payload
                .tasks
                .iter()
                .map(|task| self.run_task(&payload.group_id, task)),
        )
        .await;
        metrics::TASKS_IN_FLIGHT.sub(payload.tasks.len() as f64);

        // persist every outcome before any completion event goes out
        for (task, outcome) in payload.tasks.iter().zip(&outcomes) {
            self.store
                .record_task_outcome(task.task_instance_id, outcome)
                .await?;
            let status = if outcome.is_success() {
                "COMPLETED"
            } else {
                "FAILED"
            };
            metrics::record_task_outcome(task.kind.as_str(), status);
        }

        for (task, outcome) in payload.tasks.iter().zip(&outcomes) {
            let event = match outcome {
                TaskOutcome::Success { .. } => SchedulerEvent::TaskCompleted {
                    task_instance_id: task.task_instance_id,
                },
                TaskOutcome::Failure { error } => SchedulerEvent::TaskFailed {
                    task_instance_id: task.task_instance_id,
                    error: Some(error.clone()),
                },
            };
            publish_json(self.bus.as_ref(), SCHEDULER_QUEUE, &event).await?;
        }

        Ok(())
    }

    async fn run_task(&self, group_id: &str, task: &GroupTask) -> TaskOutcome {
        let ctx = ExecutionContext::new(group_id, task.task_instance_id);
        match self.backends.get(task.kind) {
            Some(backend) => {
                backend
                    .execute(&ctx, &task.source_reference, &task.params)
                    .await
            }
            None => {
                warn!(
                    "{} no backend registered",
                    ctx.log_prefix(task.kind)
                );
                TaskOutcome::failure(format!("Unsupported agent type: {}", task.kind))
            }
        }
    }

    /// Force-fail every task in the group and signal the scheduler.
    /// Best-effort: persistence or publish failures are logged, not raised,
    /// so the remaining tasks still get signalled.
    async fn abort_group(&self, payload: &GroupPayload, message: &str) {
        let ids: Vec<TaskInstanceId> = payload
            .tasks
            .iter()
            .map(|t| t.task_instance_id)
            .collect();

        if let Err(e) = self.store.fail_tasks(&ids, message).await {
            error!(error = %e, "failed to bulk-fail task group");
        }

        for id in ids {
            let event = SchedulerEvent::TaskFailed {
                task_instance_id: id,
                error: Some(message.to_string()),
            };
            if let Err(e) = publish_json(self.bus.as_ref(), SCHEDULER_QUEUE, &event).await {
                error!(task_instance_id = id, error = %e, "failed to emit TASK_FAILED");
            }
        }
    }
}

/// `compute_queue` consumer wrapping the executor.
pub struct GroupConsumer {
    executor: Arc<GroupExecutor>,
}

impl GroupConsumer {
    pub fn new(executor: Arc<GroupExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl QueueConsumer for GroupConsumer {
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: GroupPayload = serde_json::from_value(payload)?;
        self.executor.execute_group(payload).await
    }
}

//! Metrics collection and reporting

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Gauge,
    HistogramVec, Registry,
};

/// Global metrics registry
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Scheduler events handled, by event type
pub static SCHEDULER_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "agentflow_scheduler_events_total",
        "Scheduler events handled",
        &["event_type"]
    )
    .unwrap()
});

/// Workflow terminal transitions, by resulting status
pub static WORKFLOW_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "agentflow_workflow_transitions_total",
        "Workflow status transitions applied",
        &["status"]
    )
    .unwrap()
});

/// Task outcomes persisted by the executor, by backend and status
pub static TASK_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "agentflow_task_outcomes_total",
        "Task outcomes persisted",
        &["backend", "status"]
    )
    .unwrap()
});

/// Task groups dispatched to the compute queue
pub static GROUPS_DISPATCHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "agentflow_groups_dispatched_total",
        "Task groups dispatched",
        &["outcome"]
    )
    .unwrap()
});

/// Wall-clock duration of task-group execution
pub static GROUP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "agentflow_group_duration_seconds",
        "Task group execution duration in seconds",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 300.0, 3600.0]
    )
    .unwrap()
});

/// Tasks currently executing in this worker process
pub static TASKS_IN_FLIGHT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "agentflow_tasks_in_flight",
        "Tasks currently executing in this worker"
    )
    .unwrap()
});

/// Initialize all metrics
pub fn init_metrics() -> prometheus::Result<()> {
    METRICS_REGISTRY.register(Box::new(SCHEDULER_EVENTS.clone()))?;
    METRICS_REGISTRY.register(Box::new(WORKFLOW_TRANSITIONS.clone()))?;
    METRICS_REGISTRY.register(Box::new(TASK_OUTCOMES.clone()))?;
    METRICS_REGISTRY.register(Box::new(GROUPS_DISPATCHED.clone()))?;
    METRICS_REGISTRY.register(Box::new(GROUP_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(TASKS_IN_FLIGHT.clone()))?;

    Ok(())
}

/// Record a handled scheduler event
pub fn record_scheduler_event(event_type: &str) {
    SCHEDULER_EVENTS.with_label_values(&[event_type]).inc();
}

/// Record an applied workflow status transition
pub fn record_workflow_transition(status: &str) {
    WORKFLOW_TRANSITIONS.with_label_values(&[status]).inc();
}

/// Record a persisted task outcome
pub fn record_task_outcome(backend: &str, status: &str) {
    TASK_OUTCOMES.with_label_values(&[backend, status]).inc();
}

/// Record a dispatched (or empty-skipped) task group
pub fn record_group_dispatch(outcome: &str) {
    GROUPS_DISPATCHED.with_label_values(&[outcome]).inc();
}

/// Record task-group execution duration
pub fn record_group_duration(outcome: &str, duration_secs: f64) {
    GROUP_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

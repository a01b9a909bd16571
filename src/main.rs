//! AgentFlow engine daemon
//!
//! Single-process deployment: wires the store, the in-process bus, the
//! scheduler consumer, and the compute consumer, then runs until ctrl-c.
//! Multi-node deployments swap the bus for the production broker and run
//! scheduler and compute workers separately.

use agentflow_bus::{InProcessBus, RetryPolicy};
use agentflow_common::{metrics, telemetry, Config, COMPUTE_QUEUE, SCHEDULER_QUEUE};
use agentflow_core::EventBus;
use agentflow_executor::{BackendRegistry, GroupConsumer, GroupExecutor};
use agentflow_sandbox::WasmSandbox;
use agentflow_scheduler::{Scheduler, SchedulerConsumer};
use agentflow_store::SqliteStore;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("config error: {error}");
        }
        std::process::exit(1);
    }

    telemetry::init(&config.observability);
    if config.observability.metrics_enabled {
        metrics::init_metrics()?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting agentflow engine");

    let store = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    let bus = Arc::new(InProcessBus::new(RetryPolicy::from_config(&config.broker)));

    let sandbox = Arc::new(WasmSandbox::new(config.sandbox)?);
    let backends = BackendRegistry::standard(sandbox, config.executor.wasm_workspace_root());
    let executor = Arc::new(GroupExecutor::new(
        store.clone(),
        bus.clone(),
        backends,
        config.executor.group_soft_timeout(),
    ));
    let scheduler = Arc::new(Scheduler::new(store.clone(), bus.clone()));

    let scheduler_loop = bus.subscribe(
        SCHEDULER_QUEUE,
        Arc::new(SchedulerConsumer::new(scheduler)),
    );
    let compute_loop = bus.subscribe(COMPUTE_QUEUE, Arc::new(GroupConsumer::new(executor)));

    info!("engine ready; consuming scheduler_queue and compute_queue");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler_loop.abort();
    compute_loop.abort();

    Ok(())
}

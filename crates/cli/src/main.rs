//! AgentFlow operator CLI
//!
//! Registers agents, creates templates, validates DAG definitions, runs
//! workflows end-to-end with an in-process bus, and inspects instances.

use agentflow_bus::{InProcessBus, RetryPolicy};
use agentflow_common::{
    types::{
        AgentKind, DagDefinition, NewWorkflowInstance, SchedulerEvent, COMPUTE_QUEUE,
        SCHEDULER_QUEUE,
    },
    Config,
};
use agentflow_core::{publish_json, EventBus, Store};
use agentflow_executor::{BackendRegistry, GroupConsumer, GroupExecutor};
use agentflow_sandbox::WasmSandbox;
use agentflow_scheduler::{dag, Scheduler, SchedulerConsumer};
use agentflow_store::SqliteStore;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let app = Command::new("agentflow-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("AgentFlow workflow engine CLI")
        .subcommand(
            Command::new("agent")
                .about("Agent management")
                .subcommand(
                    Command::new("register")
                        .about("Register an executable agent")
                        .arg(
                            Arg::new("type")
                                .long("type")
                                .required(true)
                                .help("Agent kind: WASM, DOCKER, or PYTHON_FUNCTION"),
                        )
                        .arg(
                            Arg::new("source")
                                .long("source")
                                .required(true)
                                .help("Module path, image ref, or endpoint hint"),
                        ),
                ),
        )
        .subcommand(
            Command::new("template")
                .about("Template management")
                .subcommand(
                    Command::new("create")
                        .about("Create a DAG template from a JSON file")
                        .arg(Arg::new("file").required(true).help("DAG definition file")),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Check a DAG definition for cycles and start nodes")
                .arg(Arg::new("file").required(true).help("DAG definition file")),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a workflow to completion in-process")
                .arg(
                    Arg::new("template-id")
                        .long("template-id")
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    Arg::new("inputs")
                        .long("inputs")
                        .default_value("{}")
                        .help("Workflow inputs as a JSON object"),
                )
                .arg(
                    Arg::new("priority")
                        .long("priority")
                        .default_value("0")
                        .value_parser(clap::value_parser!(i32)),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show a workflow instance and its tasks")
                .arg(
                    Arg::new("id")
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        );

    let matches = app.get_matches();

    let config = Config::load().map_err(|e| anyhow!("failed to load config: {e}"))?;
    agentflow_common::telemetry::try_init(&config.observability);

    match matches.subcommand() {
        Some(("agent", sub)) => match sub.subcommand() {
            Some(("register", args)) => register_agent(&config, args).await,
            _ => {
                println!("Use 'agent register --type <KIND> --source <REF>'");
                Ok(())
            }
        },
        Some(("template", sub)) => match sub.subcommand() {
            Some(("create", args)) => create_template(&config, args).await,
            _ => {
                println!("Use 'template create <file>'");
                Ok(())
            }
        },
        Some(("validate", args)) => validate(args),
        Some(("run", args)) => run(&config, args).await,
        Some(("status", args)) => status(&config, args).await,
        _ => {
            println!("AgentFlow CLI; use --help for usage information");
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open store at {}", config.database.url))?;
    Ok(Arc::new(store))
}

fn load_dag(path: &str) -> Result<DagDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("{path} is not a DAG definition"))
}

/// Cycle / start-node verdict plus warnings for dangling edge endpoints.
fn check_dag(dag: &DagDefinition) -> Vec<String> {
    let mut problems = Vec::new();
    let known: HashSet<&str> = dag.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &dag.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !known.contains(endpoint.as_str()) {
                problems.push(format!(
                    "warning: edge {} -> {} references undefined node '{endpoint}' (edge is ignored)",
                    edge.from, edge.to
                ));
            }
        }
    }
    for node in &dag.nodes {
        if node.data.agent_id.is_none() {
            problems.push(format!("warning: node '{}' does not define an agent_id", node.id));
        }
    }
    problems
}

async fn register_agent(config: &Config, args: &ArgMatches) -> Result<()> {
    let kind: AgentKind = args
        .get_one::<String>("type")
        .unwrap()
        .parse()
        .map_err(|_| anyhow!("invalid agent type"))?;
    if kind == AgentKind::Unknown {
        bail!("agent type must be WASM, DOCKER, or PYTHON_FUNCTION");
    }
    let source = args.get_one::<String>("source").unwrap();

    let store = open_store(config).await?;
    let agent = store.create_agent(kind, source, None, None).await?;
    println!("registered agent {} ({} -> {})", agent.id, agent.kind, agent.source_reference);
    Ok(())
}

async fn create_template(config: &Config, args: &ArgMatches) -> Result<()> {
    let dag = load_dag(args.get_one::<String>("file").unwrap())?;
    for problem in check_dag(&dag) {
        println!("{problem}");
    }
    if dag::is_cyclic(&dag) {
        println!("warning: definition contains a cycle; instances will fail at start");
    }

    let store = open_store(config).await?;
    let template = store.create_template(&dag).await?;
    println!(
        "created template {} ({} nodes, {} edges)",
        template.id,
        template.dag_definition.nodes.len(),
        template.dag_definition.edges.len()
    );
    Ok(())
}

fn validate(args: &ArgMatches) -> Result<()> {
    let dag = load_dag(args.get_one::<String>("file").unwrap())?;
    for problem in check_dag(&dag) {
        println!("{problem}");
    }

    if dag::is_cyclic(&dag) {
        bail!("definition contains a cycle");
    }
    let starts = dag::start_nodes(&dag);
    if starts.is_empty() {
        bail!("definition has no start nodes");
    }
    println!(
        "ok: {} nodes, {} start node(s): {}",
        dag.nodes.len(),
        starts.len(),
        starts
            .iter()
            .map(|n| n.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn run(config: &Config, args: &ArgMatches) -> Result<()> {
    let template_id = *args.get_one::<i64>("template-id").unwrap();
    let priority = *args.get_one::<i32>("priority").unwrap();
    let inputs: serde_json::Value = serde_json::from_str(args.get_one::<String>("inputs").unwrap())
        .context("--inputs must be valid JSON")?;

    let store = open_store(config).await?;
    let template = store
        .template(template_id)
        .await?
        .ok_or_else(|| anyhow!("template {template_id} not found"))?;

    // full engine wired over an in-process bus
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

    let workflow = store
        .create_workflow(NewWorkflowInstance {
            template_id: Some(template_id),
            dag_definition: template.dag_definition,
            priority,
            inputs: Some(inputs),
        })
        .await?;
    println!("submitted workflow instance {}", workflow.id);

    publish_json(
        bus.as_ref() as &dyn EventBus,
        SCHEDULER_QUEUE,
        &SchedulerEvent::StartWorkflow {
            instance_id: workflow.id,
        },
    )
    .await?;

    let deadline = std::time::Instant::now() + config.executor.group_hard_timeout();
    let terminal = loop {
        let current = store
            .workflow(workflow.id)
            .await?
            .ok_or_else(|| anyhow!("workflow instance disappeared"))?;
        if current.status.is_terminal() {
            break current;
        }
        if std::time::Instant::now() > deadline {
            bail!("workflow {} did not finish in time", workflow.id);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    scheduler_loop.abort();
    compute_loop.abort();

    println!("workflow {} finished: {}", terminal.id, terminal.status);
    print_tasks(store.as_ref(), terminal.id).await?;
    Ok(())
}

async fn status(config: &Config, args: &ArgMatches) -> Result<()> {
    let id = *args.get_one::<i64>("id").unwrap();
    let store = open_store(config).await?;
    let workflow = store
        .workflow(id)
        .await?
        .ok_or_else(|| anyhow!("workflow instance {id} not found"))?;

    println!("workflow {} [{}] priority {}", workflow.id, workflow.status, workflow.priority);
    if let Some(started) = workflow.started_at {
        println!("  started:   {started}");
    }
    if let Some(completed) = workflow.completed_at {
        println!("  completed: {completed}");
    }
    print_tasks(store.as_ref(), id).await?;
    Ok(())
}

async fn print_tasks(store: &dyn Store, workflow_id: i64) -> Result<()> {
    let tasks = store.tasks_for_workflow(workflow_id).await?;
    if tasks.is_empty() {
        println!("  (no task instances)");
        return Ok(());
    }
    for task in tasks {
        println!(
            "  task {:>4}  node {:<12} {:<9}  outputs: {}  logs: {}",
            task.id,
            task.node_id,
            task.status.to_string(),
            task.outputs
                .map(|o| o.to_string())
                .unwrap_or_else(|| "-".to_string()),
            task.logs.unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

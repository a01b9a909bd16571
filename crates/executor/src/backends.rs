//! Execution backends, one per agent kind
//!
//! The WASM backend is the engineered path: it owns the per-task workspace
//! directory and delegates to the sandbox. Container and hosted-function
//! backends are stubs that simulate latency and a successful result.

use agentflow_common::types::{AgentKind, TaskOutcome, TaskParams};
use agentflow_core::{Backend, ExecutionContext};
use agentflow_sandbox::WasmSandbox;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Removes the task workspace on drop, so cleanup runs on every exit path.
struct WorkspaceGuard {
    path: PathBuf,
}

impl WorkspaceGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to clean up workspace");
            }
        }
    }
}

/// Sandboxed WASM execution with an isolated per-task workspace.
pub struct WasmBackend {
    sandbox: Arc<WasmSandbox>,
    workspace_root: PathBuf,
}

impl WasmBackend {
    /// `workspace_root` is `<SHARED_FS_ROOT>/wasm_workspaces`.
    pub fn new(sandbox: Arc<WasmSandbox>, workspace_root: PathBuf) -> Self {
        Self {
            sandbox,
            workspace_root,
        }
    }
}

#[async_trait]
impl Backend for WasmBackend {
    fn kind(&self) -> AgentKind {
        AgentKind::Wasm
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        source_reference: &str,
        params: &TaskParams,
    ) -> TaskOutcome {
        let workspace = self
            .workspace_root
            .join(&ctx.group_id)
            .join(ctx.task_instance_id.to_string());

        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return TaskOutcome::failure(format!(
                "failed to create workspace {}: {e}",
                workspace.display()
            ));
        }
        let _guard = WorkspaceGuard::new(workspace.clone());

        debug!(
            "{} executing module {source_reference}",
            ctx.log_prefix(AgentKind::Wasm)
        );
        self.sandbox
            .execute(
                &ctx.group_id,
                ctx.task_instance_id,
                Path::new(source_reference),
                &params.input_params,
                &workspace,
            )
            .await
    }
}

/// Container execution stub; runs are simulated.
pub struct DockerBackend {
    simulated_latency: Duration,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(500))
    }

    pub fn with_latency(simulated_latency: Duration) -> Self {
        Self { simulated_latency }
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> AgentKind {
        AgentKind::Docker
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        source_reference: &str,
        _params: &TaskParams,
    ) -> TaskOutcome {
        info!(
            "{} simulating container run of image {source_reference}",
            ctx.log_prefix(AgentKind::Docker)
        );
        tokio::time::sleep(self.simulated_latency).await;
        TaskOutcome::success(json!({
            "container_id": format!("sim-{}", ctx.task_instance_id),
            "logs": "Container ran successfully.",
        }))
    }
}

/// Hosted-function execution stub; simulates an HTTP-style call.
pub struct FunctionBackend {
    simulated_latency: Duration,
}

impl FunctionBackend {
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(100))
    }

    pub fn with_latency(simulated_latency: Duration) -> Self {
        Self { simulated_latency }
    }
}

impl Default for FunctionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for FunctionBackend {
    fn kind(&self) -> AgentKind {
        AgentKind::PythonFunction
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        _source_reference: &str,
        params: &TaskParams,
    ) -> TaskOutcome {
        info!(
            "{} simulating function invocation",
            ctx.log_prefix(AgentKind::PythonFunction)
        );
        tokio::time::sleep(self.simulated_latency).await;
        let message = params
            .input_params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("default message");
        TaskOutcome::success(json!({
            "response": format!("Processed: {message}"),
        }))
    }
}

/// Backend lookup by agent kind.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<AgentKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All production backends: WASM against the given sandbox plus the
    /// container and function stubs.
    pub fn standard(sandbox: Arc<WasmSandbox>, workspace_root: PathBuf) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WasmBackend::new(sandbox, workspace_root)));
        registry.register(Arc::new(DockerBackend::new()));
        registry.register(Arc::new(FunctionBackend::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: AgentKind) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&kind)
    }
}

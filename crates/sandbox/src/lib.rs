#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Sandboxed WASM execution for agent tasks
//!
//! Wraps the wasmtime runtime behind one asynchronous `execute` call.
//! Each invocation runs in a fresh store with fuel metering, a wall-clock
//! limit, and a WASI context whose only visible host resource is the
//! caller-provided workspace directory, mapped as guest `/`.
//!
//! Compiled modules are cached per path for the process lifetime; the
//! sandbox is created once per worker process and shared.

use agentflow_common::{
    config::SandboxConfig,
    error::{Error, Result},
    types::{TaskInstanceId, TaskOutcome},
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

/// Fuel consumed between cooperative yields back to the host executor.
/// Keeps the wall-clock timeout responsive during pure-compute loops.
const FUEL_YIELD_INTERVAL: u64 = 10_000;

/// Process-local WASM execution service.
pub struct WasmSandbox {
    engine: Engine,
    limits: SandboxConfig,
    modules: RwLock<HashMap<PathBuf, Module>>,
}

impl WasmSandbox {
    /// Build the engine with fuel metering and async support enabled.
    pub fn new(limits: SandboxConfig) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);

        let engine = Engine::new(&config)
            .map_err(|e| Error::Sandbox(format!("failed to create engine: {e}")))?;

        info!(
            fuel = limits.fuel,
            wall_clock_secs = limits.wall_clock_secs,
            "wasm sandbox initialized"
        );

        Ok(Self {
            engine,
            limits,
            modules: RwLock::new(HashMap::new()),
        })
    }

    /// Number of modules currently held in the compilation cache.
    pub fn cached_modules(&self) -> usize {
        self.modules.read().len()
    }

    /// Fetch a compiled module from the cache, compiling on first use.
    ///
    /// Compilation happens outside the lock; two callers racing on the same
    /// path may both compile, and the second insert wins with an equal
    /// module. Failures are returned without touching the cache.
    async fn module(&self, path: &Path) -> std::result::Result<Module, String> {
        if let Some(module) = self.modules.read().get(path) {
            return Ok(module.clone());
        }

        debug!(path = %path.display(), "compiling wasm module");
        let engine = self.engine.clone();
        let owned = path.to_path_buf();
        let module = tokio::task::spawn_blocking(move || Module::from_file(&engine, &owned))
            .await
            .map_err(|e| format!("module compilation task failed: {e}"))?
            .map_err(|e| format!("failed to load module {}: {e}", path.display()))?;

        self.modules
            .write()
            .insert(path.to_path_buf(), module.clone());
        Ok(module)
    }

    /// Execute one agent invocation.
    ///
    /// Never returns an error to the caller: traps, timeouts, missing
    /// exports, and host I/O failures all surface as
    /// `TaskOutcome::Failure` with a descriptive message.
    #[instrument(skip(self, input_data))]
    pub async fn execute(
        &self,
        group_id: &str,
        task_instance_id: TaskInstanceId,
        module_path: &Path,
        input_data: &Value,
        workspace_dir: &Path,
    ) -> TaskOutcome {
        let module = match self.module(module_path).await {
            Ok(module) => module,
            Err(error) => {
                warn!(group_id, task_instance_id, %error, "module load failed");
                return TaskOutcome::failure(error);
            }
        };

        let wall_clock = self.limits.wall_clock();
        let result = tokio::time::timeout(
            wall_clock,
            self.run_instance(&module, input_data, workspace_dir),
        )
        .await;

        match result {
            Ok(Ok(output)) => TaskOutcome::success(output),
            Ok(Err(error)) => {
                warn!(group_id, task_instance_id, %error, "wasm execution failed");
                TaskOutcome::failure(error)
            }
            Err(_) => {
                let error = format!(
                    "wall clock limit of {}s exceeded",
                    wall_clock.as_secs()
                );
                warn!(group_id, task_instance_id, %error, "wasm execution timed out");
                TaskOutcome::failure(error)
            }
        }
    }

    /// Instantiate the module in a fresh sandboxed store and drive the
    /// memory ABI: allocate, write input, run, read output, free.
    async fn run_instance(
        &self,
        module: &Module,
        input_data: &Value,
        workspace_dir: &Path,
    ) -> std::result::Result<Value, String> {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_stderr();
        builder
            .preopened_dir(workspace_dir, "/", DirPerms::all(), FilePerms::all())
            .map_err(|e| {
                format!(
                    "failed to preopen workspace {}: {e}",
                    workspace_dir.display()
                )
            })?;
        let wasi = builder.build_p1();

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |ctx| ctx)
            .map_err(|e| format!("failed to link wasi: {e}"))?;

        let mut store = Store::new(&self.engine, wasi);
        store
            .set_fuel(self.limits.fuel)
            .map_err(|e| format!("failed to set fuel: {e}"))?;
        store
            .fuel_async_yield_interval(Some(FUEL_YIELD_INTERVAL))
            .map_err(|e| format!("failed to set fuel yield interval: {e}"))?;

        let instance = linker
            .instantiate_async(&mut store, module)
            .await
            .map_err(|e| format!("instantiation failed: {e}"))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| "module must export a 'memory'".to_string())?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate_memory")
            .map_err(|e| format!("module must export 'allocate_memory(i32) -> i32': {e}"))?;
        let free = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "free_memory")
            .map_err(|e| format!("module must export 'free_memory(i32, i32)': {e}"))?;
        let run = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "run")
            .map_err(|e| format!("module must export 'run(i32, i32) -> i64': {e}"))?;

        let input_bytes = serde_json::to_vec(input_data)
            .map_err(|e| format!("failed to encode input: {e}"))?;
        let input_size = i32::try_from(input_bytes.len())
            .map_err(|_| format!("input of {} bytes exceeds guest limits", input_bytes.len()))?;

        let input_ptr = allocate
            .call_async(&mut store, input_size)
            .await
            .map_err(|e| format!("allocate_memory trapped: {e}"))?;

        if let Err(e) = memory.write(&mut store, input_ptr as usize, &input_bytes) {
            let _ = free.call_async(&mut store, (input_ptr, input_size)).await;
            return Err(format!("failed to write input buffer: {e}"));
        }

        let packed = match run.call_async(&mut store, (input_ptr, input_size)).await {
            Ok(packed) => packed as u64,
            Err(e) => {
                let _ = free.call_async(&mut store, (input_ptr, input_size)).await;
                return Err(format!("execution trapped: {e}"));
            }
        };

        // high 32 bits: output pointer, low 32 bits: output size
        let output_ptr = (packed >> 32) as i32;
        let output_size = (packed & 0xFFFF_FFFF) as i32;

        let output_text = if output_size == 0 {
            // no output is valid; default to the empty object
            "{}".to_string()
        } else {
            let mut buffer = vec![0u8; output_size as usize];
            if let Err(e) = memory.read(&store, output_ptr as usize, &mut buffer) {
                let _ = free.call_async(&mut store, (input_ptr, input_size)).await;
                let _ = free.call_async(&mut store, (output_ptr, output_size)).await;
                return Err(format!("failed to read output buffer: {e}"));
            }
            while buffer.last() == Some(&0) {
                buffer.pop();
            }
            match String::from_utf8(buffer) {
                Ok(text) => text,
                Err(e) => {
                    let _ = free.call_async(&mut store, (input_ptr, input_size)).await;
                    let _ = free.call_async(&mut store, (output_ptr, output_size)).await;
                    return Err(format!("output is not valid UTF-8: {e}"));
                }
            }
        };

        // release both guest buffers before handing the result back
        free.call_async(&mut store, (input_ptr, input_size))
            .await
            .map_err(|e| format!("free_memory trapped on input buffer: {e}"))?;
        if output_size > 0 {
            free.call_async(&mut store, (output_ptr, output_size))
                .await
                .map_err(|e| format!("free_memory trapped on output buffer: {e}"))?;
        }

        serde_json::from_str(&output_text)
            .map_err(|e| format!("output is not valid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Echoes its input: `run` returns the input pointer and size packed.
    const IDENTITY_WAT: &str = r#"
        (module
          (memory (export "memory") 4)
          (global $next (mut i32) (i32.const 1024))
          (func (export "allocate_memory") (param $size i32) (result i32)
            (local $ptr i32)
            global.get $next
            local.set $ptr
            global.get $next
            local.get $size
            i32.add
            global.set $next
            local.get $ptr)
          (func (export "free_memory") (param i32) (param i32))
          (func (export "run") (param $ptr i32) (param $size i32) (result i64)
            local.get $ptr
            i64.extend_i32_u
            i64.const 32
            i64.shl
            local.get $size
            i64.extend_i32_u
            i64.or))
    "#;

    /// Burns fuel forever; `run` never returns on its own.
    const LOOPER_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "allocate_memory") (param i32) (result i32)
            i32.const 1024)
          (func (export "free_memory") (param i32) (param i32))
          (func (export "run") (param i32) (param i32) (result i64)
            (loop $spin br $spin)
            i64.const 0))
    "#;

    /// Produces nothing: `run` returns a packed zero.
    const SILENT_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "allocate_memory") (param i32) (result i32)
            i32.const 1024)
          (func (export "free_memory") (param i32) (param i32))
          (func (export "run") (param i32) (param i32) (result i64)
            i64.const 0))
    "#;

    /// Exports nothing the ABI requires.
    const BARE_WAT: &str = r#"
        (module
          (func (export "start")))
    "#;

    fn write_module(dir: &TempDir, name: &str, wat: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, wat).unwrap();
        path
    }

    fn sandbox() -> WasmSandbox {
        WasmSandbox::new(SandboxConfig {
            fuel: 100_000_000,
            wall_clock_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn identity_round_trips_json() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "identity.wat", IDENTITY_WAT);
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        for input in [
            json!({}),
            json!({"x": 1}),
            json!({"nested": {"list": [1, 2, 3], "text": "héllo"}}),
        ] {
            let outcome = sandbox
                .execute("group1", 1, &module, &input, workspace.path())
                .await;
            assert_eq!(outcome, TaskOutcome::success(input));
        }
    }

    #[tokio::test]
    async fn fuel_exhaustion_fails_with_trap_message() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "looper.wat", LOOPER_WAT);
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        let outcome = sandbox
            .execute("group1", 2, &module, &json!({}), workspace.path())
            .await;
        match outcome {
            TaskOutcome::Failure { error } => {
                assert!(error.contains("fuel"), "unexpected error: {error}");
            }
            TaskOutcome::Success { .. } => panic!("looper must not succeed"),
        }
    }

    #[tokio::test]
    async fn wall_clock_limit_is_enforced() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "looper.wat", LOOPER_WAT);
        let workspace = TempDir::new().unwrap();
        // effectively unlimited fuel so only the clock can stop it
        let sandbox = WasmSandbox::new(SandboxConfig {
            fuel: u64::MAX,
            wall_clock_secs: 1,
        })
        .unwrap();

        let start = std::time::Instant::now();
        let outcome = sandbox
            .execute("group1", 3, &module, &json!({}), workspace.path())
            .await;
        match outcome {
            TaskOutcome::Failure { error } => {
                assert!(error.contains("wall clock"), "unexpected error: {error}");
            }
            TaskOutcome::Success { .. } => panic!("looper must not succeed"),
        }
        assert!(start.elapsed() < std::time::Duration::from_secs(4));
    }

    #[tokio::test]
    async fn empty_output_defaults_to_empty_object() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "silent.wat", SILENT_WAT);
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        let outcome = sandbox
            .execute("group1", 4, &module, &json!({"ignored": true}), workspace.path())
            .await;
        assert_eq!(outcome, TaskOutcome::success(json!({})));
    }

    #[tokio::test]
    async fn missing_exports_fail_with_clear_error() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "bare.wat", BARE_WAT);
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        let outcome = sandbox
            .execute("group1", 5, &module, &json!({}), workspace.path())
            .await;
        match outcome {
            TaskOutcome::Failure { error } => {
                assert!(error.contains("must export"), "unexpected error: {error}");
            }
            TaskOutcome::Success { .. } => panic!("bare module must not succeed"),
        }
    }

    #[tokio::test]
    async fn missing_module_file_fails_without_poisoning_cache() {
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        let outcome = sandbox
            .execute(
                "group1",
                6,
                Path::new("/nonexistent/agent.wasm"),
                &json!({}),
                workspace.path(),
            )
            .await;
        assert!(matches!(outcome, TaskOutcome::Failure { .. }));
        assert_eq!(sandbox.cached_modules(), 0);
    }

    #[tokio::test]
    async fn modules_are_compiled_once() {
        let dir = TempDir::new().unwrap();
        let module = write_module(&dir, "identity.wat", IDENTITY_WAT);
        let workspace = TempDir::new().unwrap();
        let sandbox = sandbox();

        for _ in 0..3 {
            let outcome = sandbox
                .execute("group1", 7, &module, &json!({"n": 1}), workspace.path())
                .await;
            assert!(outcome.is_success());
        }
        assert_eq!(sandbox.cached_modules(), 1);
    }
}

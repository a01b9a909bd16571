#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Task-group execution for the AgentFlow workflow engine
//!
//! Receives dispatched group payloads from `compute_queue`, runs each task
//! concurrently on the backend matching its agent kind, persists outcomes,
//! and emits per-task completion events back to the scheduler.

pub mod backends;
pub mod executor;

pub use backends::{BackendRegistry, DockerBackend, FunctionBackend, WasmBackend};
pub use executor::{GroupConsumer, GroupExecutor};

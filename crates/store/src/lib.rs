#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Store implementations for the AgentFlow workflow engine
//!
//! Two implementations of `agentflow_core::Store`: an in-memory store for
//! tests and embedded runs, and a SQLite store for single-node deployments.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Core trait seams for the AgentFlow workflow engine
//!
//! This crate defines the interfaces between the scheduler/executor core
//! and its external collaborators: the relational store, the message
//! broker, and the per-agent-kind execution backends.

pub mod backend;
pub mod bus;
pub mod store;

pub use backend::{Backend, ExecutionContext};
pub use bus::{publish_json, EventBus, QueueConsumer};
pub use store::Store;

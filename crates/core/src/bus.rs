//! Event bus trait: the queue contract the core consumes
//!
//! The production broker is an external collaborator. The contract is
//! at-least-once delivery with per-producer ordering; handlers must be
//! idempotent. Failed handling is re-delivered after exponential backoff
//! with jitter up to a configured attempt cap.

use agentflow_common::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Handler attached to one named queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Process one delivered message. An `Err` triggers re-delivery.
    async fn handle(&self, payload: Value) -> Result<()>;
}

/// Thin abstraction over the broker with named queues.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Enqueue a JSON payload on a named queue.
    async fn publish(&self, queue: &str, payload: Value) -> Result<()>;

    /// Attach a consumer to a named queue. The returned handle drives the
    /// delivery loop for the consumer's lifetime; aborting it detaches the
    /// consumer.
    fn subscribe(
        &self,
        queue: &str,
        consumer: Arc<dyn QueueConsumer>,
    ) -> tokio::task::JoinHandle<()>;
}

/// Publish a serializable message, encoding it to JSON first.
pub async fn publish_json<T: serde::Serialize + Sync>(
    bus: &dyn EventBus,
    queue: &str,
    message: &T,
) -> Result<()> {
    bus.publish(queue, serde_json::to_value(message)?).await
}

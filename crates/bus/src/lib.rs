#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! In-process event bus for the AgentFlow workflow engine
//!
//! Implements the queue contract (`agentflow-core::bus`) for single-process
//! deployments, the CLI runner, and tests: named FIFO queues, competing
//! consumers, at-least-once delivery, and re-delivery with exponential
//! backoff plus jitter up to an attempt cap. Messages that exhaust their
//! attempts are dropped with an error log (dead-letter).
//!
//! A production broker replaces this crate behind the same trait.

use agentflow_common::{config::BrokerConfig, error::Result};
use agentflow_core::{EventBus, QueueConsumer};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Re-delivery policy applied to failed handling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Exponential backoff capped at `max_delay`, with up to 50% added
    /// jitter to spread synchronized retries.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = if exp.as_millis() == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2)
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

struct Envelope {
    payload: Value,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl QueueState {
    fn push(&self, envelope: Envelope) {
        self.messages.lock().push_back(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.messages.lock().pop_front()
    }
}

/// In-process broker with named queues.
pub struct InProcessBus {
    queues: DashMap<String, Arc<QueueState>>,
    retry: RetryPolicy,
}

impl InProcessBus {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            queues: DashMap::new(),
            retry,
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::default()))
            .clone()
    }

    /// Basic-get: pop the next message without a delivery loop. Used by
    /// polling consumers and deterministic test pumps.
    pub fn try_pop(&self, queue: &str) -> Option<Value> {
        self.queue(queue).pop().map(|envelope| envelope.payload)
    }

    /// Number of messages currently waiting on a queue.
    pub fn depth(&self, queue: &str) -> usize {
        self.queue(queue).messages.lock().len()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, queue: &str, payload: Value) -> Result<()> {
        debug!(queue, "publishing message");
        self.queue(queue).push(Envelope {
            payload,
            attempt: 0,
        });
        Ok(())
    }

    fn subscribe(
        &self,
        queue: &str,
        consumer: Arc<dyn QueueConsumer>,
    ) -> tokio::task::JoinHandle<()> {
        let state = self.queue(queue);
        let retry = self.retry;
        let queue = queue.to_string();

        tokio::spawn(async move {
            loop {
                let Some(envelope) = state.pop() else {
                    state.notify.notified().await;
                    continue;
                };

                match consumer.handle(envelope.payload.clone()).await {
                    Ok(()) => {}
                    Err(e) if envelope.attempt + 1 >= retry.max_attempts => {
                        error!(
                            queue,
                            attempts = envelope.attempt + 1,
                            error = %e,
                            "message exhausted delivery attempts, dropping"
                        );
                    }
                    Err(e) => {
                        let delay = retry.delay_for(envelope.attempt);
                        warn!(
                            queue,
                            attempt = envelope.attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "handler failed, scheduling re-delivery"
                        );
                        let state = Arc::clone(&state);
                        let payload = envelope.payload;
                        let attempt = envelope.attempt + 1;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            state.push(Envelope { payload, attempt });
                        });
                    }
                }
            }
        })
    }
}

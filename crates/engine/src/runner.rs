//! Single-node execution with per-attempt timeout and fixed-delay retry.
//!
//! `NodeRunner` holds no shared mutable state; the coordinator builds one per
//! run from the run's settings and calls [`NodeRunner::run`] from spawned
//! tasks.

use std::time::Duration;

use nodes::{NodeExecutionContext, NodeHandler};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::ExecutionError;
use crate::models::ExecutionSettings;

/// Final outcome of a node after all attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    /// 1-based attempt that produced `result`.
    pub attempt: u32,
    pub result: Result<Value, ExecutionError>,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeRunner {
    attempt_timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl NodeRunner {
    pub fn new(attempt_timeout: Duration, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            attempt_timeout,
            retry_attempts,
            retry_delay,
        }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.attempt_timeout_ms()),
            settings.retry_attempts,
            Duration::from_millis(settings.retry_delay_ms),
        )
    }

    /// Run `handler` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Up to `retry_attempts` extra attempts follow a retryable failure or a
    /// timeout, each after the same fixed delay. Cancellation of the context's
    /// token abandons the current attempt (or delay) immediately.
    #[instrument(skip_all, fields(node_id = %ctx.node_id, execution_id = %ctx.execution_id))]
    pub async fn run(&self, ctx: &NodeExecutionContext, handler: &dyn NodeHandler) -> NodeOutcome {
        let max_attempts = self.retry_attempts.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, max_attempts, "starting attempt");

            let error = match self.attempt(ctx, handler).await {
                Ok(output) => {
                    return NodeOutcome {
                        attempt,
                        result: Ok(output),
                    }
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return NodeOutcome {
                    attempt,
                    result: Err(error),
                };
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = self.retry_delay.as_millis() as u64,
                error = %error,
                "node attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => {
                    return NodeOutcome { attempt, result: Err(ExecutionError::Cancelled) };
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &NodeExecutionContext,
        handler: &dyn NodeHandler,
    ) -> Result<Value, ExecutionError> {
        let node_id = ctx.node_id.clone();

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(ExecutionError::Cancelled),
            res = tokio::time::timeout(self.attempt_timeout, handler.execute(ctx)) => match res {
                Err(_elapsed) => Err(ExecutionError::NodeTimeout {
                    node_id,
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
                Ok(Err(e)) => Err(ExecutionError::NodeExecution {
                    node_id,
                    message: e.message().to_owned(),
                    retryable: e.is_retryable(),
                }),
                Ok(Ok(output)) => match handler.validate_output(&output) {
                    Ok(()) => Ok(output),
                    Err(e) => Err(ExecutionError::NodeExecution {
                        node_id,
                        message: e.message().to_owned(),
                        retryable: false,
                    }),
                },
            },
        }
    }
}

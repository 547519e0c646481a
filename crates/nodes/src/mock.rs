//! `MockNode`: a test double for `NodeHandler`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{NodeError, NodeExecutionContext, NodeHandler};

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `times` calls, then return `value`.
    FailTimes { times: u32, value: Value },
    /// Return a value the node's declared output shape rejects.
    InvalidOutput,
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Optional latency applied before the behaviour.
    pub delay: Option<Duration>,
    /// All inputs seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    failures: AtomicU32,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: AtomicU32::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `times` times before succeeding with `value`.
    pub fn flaky(name: impl Into<String>, times: u32, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailTimes { times, value })
    }

    /// Create a mock whose output never passes `validate_output`.
    pub fn invalid_output(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::InvalidOutput)
    }

    /// Sleep for `delay` before every call resolves.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.recorded().len()
    }

    /// Inputs seen so far, in call order.
    pub fn inputs(&self) -> Vec<Value> {
        self.recorded().clone()
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<Value>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tagged(&self, v: &Value) -> Value {
        // Merge the node's own output with its name so tests can trace the
        // data flowing through the graph.
        let mut out = json!({ "node": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl NodeHandler for MockNode {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        self.recorded().push(ctx.input_data.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.tagged(v)),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::FailTimes { times, value } => {
                let failed = self.failures.fetch_add(1, Ordering::SeqCst);
                if failed < *times {
                    Err(NodeError::Retryable(format!(
                        "{} failing on call {}",
                        self.name,
                        failed + 1
                    )))
                } else {
                    Ok(self.tagged(value))
                }
            }
            MockBehaviour::InvalidOutput => Ok(json!({ "invalid": true })),
        }
    }

    fn validate_output(&self, output: &Value) -> Result<(), NodeError> {
        if output.get("invalid").is_some() {
            return Err(NodeError::Fatal(format!(
                "{} produced an output without the declared shape",
                self.name
            )));
        }
        Ok(())
    }
}

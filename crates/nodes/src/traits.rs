//! The `NodeHandler` trait: the contract every node type must fulfil.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::NodeError;

/// Input handed to a node handler for a single invocation.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency. A fresh
/// context is built for every invocation and dropped once it returns.
#[derive(Debug, Clone)]
pub struct NodeExecutionContext {
    /// ID of the node being executed.
    pub node_id: String,
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// User on whose behalf the run was submitted, if known.
    pub user_id: Option<String>,
    /// Merged output of every upstream dependency (or the run input for roots).
    pub input_data: Value,
    /// The node's own configuration from the workflow graph.
    pub node_config: Value,
    cancellation: CancellationToken,
}

impl NodeExecutionContext {
    pub fn new(
        node_id: impl Into<String>,
        workflow_id: Uuid,
        execution_id: Uuid,
        user_id: Option<String>,
        input_data: Value,
        node_config: Value,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            workflow_id,
            execution_id,
            user_id,
            input_data,
            node_config,
            cancellation,
        }
    }

    /// Signal that fires when the run is cancelled or times out.
    ///
    /// Long-running handlers should `select!` on `cancellation().cancelled()`
    /// and return early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Tagged outcome of one node, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub ok: bool,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success(value: Value) -> Self {
        Self { ok: true, value, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { ok: false, value: Value::Null, error: Some(error.into()) }
    }
}

/// The core handler trait.
///
/// Handlers are shared between runs, so implementations must be `Send + Sync`
/// and keep any per-invocation state inside `execute`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Execute the node and return its JSON output.
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError>;

    /// Check the output against the shape this node type declares.
    ///
    /// Called by the engine after every successful `execute`; a rejected
    /// output fails the node without further retries.
    fn validate_output(&self, _output: &Value) -> Result<(), NodeError> {
        Ok(())
    }
}

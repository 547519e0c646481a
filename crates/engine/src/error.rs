//! Engine-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::{NodeStatus, RunStatus};

/// A malformed graph or settings block. Raised before scheduling begins;
/// no run state is ever created for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    DependencyUnresolved {
        node_id: String,
        side: &'static str,
    },

    /// Depth-first walk hit a back-edge. `cycle` starts and ends at the
    /// revisited node, e.g. `["a", "b", "a"]`.
    #[error("workflow graph contains a cycle: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// Settings no run could honour (zero concurrency, zero timeout).
    #[error("invalid execution settings: {0}")]
    InvalidSettings(String),
}

/// Failure recorded as data in node and run state.
///
/// These never cross the coordinator boundary as `Err`; they are stored in
/// `NodeExecutionState::error` and `RunState::error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionError {
    /// The handler returned a failure.
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution {
        node_id: String,
        message: String,
        retryable: bool,
    },

    /// An attempt exceeded the per-attempt timeout.
    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    /// No handler registered for the node's type.
    #[error("no handler registered for node type '{node_type}' (node '{node_id}')")]
    HandlerNotFound { node_id: String, node_type: String },

    /// The whole run exceeded its deadline.
    #[error("run exceeded its timeout of {timeout_ms}ms")]
    RunTimeout { timeout_ms: u64 },

    /// The run was cancelled explicitly.
    #[error("execution was cancelled")]
    Cancelled,

    /// Summary under `continue`/`retry`: every node that ended in `error`.
    #[error("nodes failed: {}", .node_ids.join(", "))]
    NodesFailed { node_ids: Vec<String> },
}

impl ExecutionError {
    /// Stable machine-readable code, matching the serialised `code` tag.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeExecution { .. } => "node_execution",
            Self::NodeTimeout { .. } => "node_timeout",
            Self::HandlerNotFound { .. } => "handler_not_found",
            Self::RunTimeout { .. } => "run_timeout",
            Self::Cancelled => "cancelled",
            Self::NodesFailed { .. } => "nodes_failed",
        }
    }

    /// Whether the node runner should spend another attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NodeExecution { retryable, .. } => *retryable,
            Self::NodeTimeout { .. } => true,
            _ => false,
        }
    }
}

/// A state-machine transition the run or node record does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{node_id}' cannot move from {from} to {to}")]
    InvalidNodeTransition {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("run cannot move from {from} to {to}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },
}

/// Errors from the run persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode run record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors surfaced by the submission API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(Uuid),

    /// Retry requested for a run that has not reached a terminal status.
    #[error("execution '{0}' is still running")]
    ExecutionActive(Uuid),

    #[error("node '{node_id}' is not part of execution '{execution_id}'")]
    UnknownNode { execution_id: Uuid, node_id: String },

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
}

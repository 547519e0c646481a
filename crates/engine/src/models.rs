//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and its run
//! settings look like in memory. They (de)serialise with camelCase keys so
//! the same documents the API layer stores can be fed straight in.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to a registered `NodeHandler` implementation.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Arbitrary configuration passed to the node at execution time.
    #[serde(default)]
    pub config: Value,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed dependency: `target` cannot start before `source` is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// A complete workflow definition: ordered nodes plus dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeSpec>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes,
            edges,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionSettings
// ---------------------------------------------------------------------------

/// How a node failure (after its retries) affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Halt: cancel in-flight nodes, skip everything not yet started.
    #[default]
    Stop,
    /// Skip only the failed node's dependents; independent branches keep going.
    Continue,
    /// Per-node retries, then behaves like `Continue`.
    Retry,
}

impl std::fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Continue => write!(f, "continue"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for ErrorHandling {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown error handling mode: {other}")),
        }
    }
}

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Per-run tuning knobs, fixed at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    pub error_handling: ErrorHandling,
    /// Whole-run deadline, and the per-attempt timeout unless `node_timeout_ms` is set.
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<u64>,
    /// Additional attempts after the first failure.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
    pub max_concurrent: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            error_handling: ErrorHandling::Stop,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            node_timeout_ms: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ExecutionSettings {
    /// Build settings from environment variables, falling back to defaults.
    ///
    /// Reads:
    /// - `FLOW_ERROR_HANDLING` (`stop` | `continue` | `retry`)
    /// - `FLOW_TIMEOUT_MS`
    /// - `FLOW_NODE_TIMEOUT_MS`
    /// - `FLOW_RETRY_ATTEMPTS`
    /// - `FLOW_RETRY_DELAY_MS`
    /// - `FLOW_MAX_CONCURRENT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        }

        let defaults = Self::default();
        Self {
            error_handling: parsed(&lookup, "FLOW_ERROR_HANDLING").unwrap_or(defaults.error_handling),
            timeout_ms: parsed(&lookup, "FLOW_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            node_timeout_ms: parsed(&lookup, "FLOW_NODE_TIMEOUT_MS"),
            retry_attempts: parsed(&lookup, "FLOW_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_delay_ms: parsed(&lookup, "FLOW_RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
            max_concurrent: parsed(&lookup, "FLOW_MAX_CONCURRENT").unwrap_or(defaults.max_concurrent),
        }
    }

    pub fn with_error_handling(mut self, mode: ErrorHandling) -> Self {
        self.error_handling = mode;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_node_timeout_ms(mut self, ms: u64) -> Self {
        self.node_timeout_ms = Some(ms);
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Per-attempt timeout applied by the node runner.
    pub fn attempt_timeout_ms(&self) -> u64 {
        self.node_timeout_ms.unwrap_or(self.timeout_ms)
    }

    /// Reject settings no run could honour.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrent == 0 {
            return Err(ValidationError::InvalidSettings(
                "maxConcurrent must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ValidationError::InvalidSettings("timeoutMs must be positive".into()));
        }
        if self.node_timeout_ms == Some(0) {
            return Err(ValidationError::InvalidSettings(
                "nodeTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

//! Built-in node handlers (passthrough, set, delay, fail).
//!
//! These cover the plumbing every workflow needs and give the CLI something
//! to run without plugins.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{NodeError, NodeExecutionContext, NodeHandler};

pub const PASSTHROUGH: &str = "passthrough";
pub const SET: &str = "set";
pub const DELAY: &str = "delay";
pub const FAIL: &str = "fail";

/// Returns its input unchanged.
pub struct PassthroughNode;

#[async_trait]
impl NodeHandler for PassthroughNode {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        Ok(ctx.input_data.clone())
    }
}

/// Overlays `config.values` onto its (object) input.
///
/// ```json
/// { "id": "tag", "type": "set", "config": { "values": { "env": "prod" } } }
/// ```
pub struct SetNode;

#[async_trait]
impl NodeHandler for SetNode {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        let values = ctx
            .node_config
            .get("values")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::Fatal("set: `config.values` must be an object".into()))?;

        let mut out = match &ctx.input_data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other.clone());
                map
            }
        };
        for (k, v) in values {
            out.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(out))
    }

    fn validate_output(&self, output: &Value) -> Result<(), NodeError> {
        if output.is_object() {
            Ok(())
        } else {
            Err(NodeError::Fatal("set: output must be an object".into()))
        }
    }
}

/// Sleeps for `config.ms` milliseconds, then forwards its input.
///
/// Observes run cancellation and gives up early.
pub struct DelayNode;

#[async_trait]
impl NodeHandler for DelayNode {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        let ms = ctx.node_config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        debug!(node_id = %ctx.node_id, ms, "delay node sleeping");

        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                Err(NodeError::Fatal("delay: cancelled".into()))
            }
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ctx.input_data.clone()),
        }
    }
}

/// Always fails. `config.message` sets the error text and
/// `config.retryable` (default `true`) picks the error kind.
pub struct FailNode;

#[async_trait]
impl NodeHandler for FailNode {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        let message = ctx
            .node_config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("node configured to fail")
            .to_owned();
        let retryable = ctx
            .node_config
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if retryable {
            Err(NodeError::Retryable(message))
        } else {
            Err(NodeError::Fatal(message))
        }
    }
}

//! Run and node state records.
//!
//! A [`RunState`] is created at submission with every node `pending`, is
//! mutated only by the run's coordinator, and is frozen once terminal. Every
//! other component reads cloned snapshots.
//!
//! Node transitions are one-directional:
//! `pending → running → {success | error}` or `pending → skipped`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nodes::NodeResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExecutionError, StateError};

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }

    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Error)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based attempt that produced the final outcome; 0 until dispatched.
    pub attempt: u32,
    pub result: Option<NodeResult>,
    pub error: Option<ExecutionError>,
}

impl Default for NodeExecutionState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: 0,
            result: None,
            error: None,
        }
    }
}

impl NodeExecutionState {
    /// The handler output, if the node succeeded.
    pub fn output(&self) -> Option<&Value> {
        self.result.as_ref().filter(|r| r.ok).map(|r| &r.value)
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Node counts by status, for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub running_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Exactly one entry per graph node.
    pub per_node: BTreeMap<String, NodeExecutionState>,
    pub error: Option<ExecutionError>,
    /// The execution this run retries, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
}

impl RunState {
    /// A fresh `pending` run with every node `pending`.
    pub fn new<'a>(id: Uuid, workflow_id: Uuid, node_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            id,
            workflow_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            per_node: node_ids
                .into_iter()
                .map(|id| (id.to_owned(), NodeExecutionState::default()))
                .collect(),
            error: None,
            retry_of: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeExecutionState> {
        self.per_node.get(id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.per_node.get(id).map(|n| n.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// IDs of nodes with the given status, lexicographically.
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.per_node
            .iter()
            .filter(|(_, n)| n.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn progress(&self) -> ExecutionProgress {
        let mut progress = ExecutionProgress {
            total_nodes: self.per_node.len(),
            ..Default::default()
        };
        for node in self.per_node.values() {
            match node.status {
                NodeStatus::Success => progress.completed_nodes += 1,
                NodeStatus::Error => progress.failed_nodes += 1,
                NodeStatus::Skipped => progress.skipped_nodes += 1,
                NodeStatus::Running => progress.running_nodes += 1,
                NodeStatus::Pending => {}
            }
        }
        progress
    }

    // -----------------------------------------------------------------------
    // Transitions (coordinator only)
    // -----------------------------------------------------------------------

    /// `pending → running` for the run itself.
    pub fn mark_running(&mut self) -> Result<(), StateError> {
        self.transition_run(RunStatus::Running)?;
        self.started_at = Utc::now();
        Ok(())
    }

    /// Move the run to a terminal status. The run is frozen afterwards.
    pub fn finish(
        &mut self,
        status: RunStatus,
        error: Option<ExecutionError>,
    ) -> Result<(), StateError> {
        if !status.is_terminal() {
            return Err(StateError::InvalidRunTransition { from: self.status, to: status });
        }
        self.transition_run(status)?;
        self.completed_at = Some(Utc::now());
        self.error = error;
        Ok(())
    }

    pub fn start_node(&mut self, id: &str) -> Result<(), StateError> {
        let node = self.transition_node(id, NodeStatus::Running)?;
        node.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete_node(&mut self, id: &str, attempt: u32, output: Value) -> Result<(), StateError> {
        let node = self.transition_node(id, NodeStatus::Success)?;
        node.completed_at = Some(Utc::now());
        node.attempt = attempt;
        node.result = Some(NodeResult::success(output));
        Ok(())
    }

    pub fn fail_node(
        &mut self,
        id: &str,
        attempt: u32,
        error: ExecutionError,
    ) -> Result<(), StateError> {
        let node = self.transition_node(id, NodeStatus::Error)?;
        node.completed_at = Some(Utc::now());
        node.attempt = attempt;
        node.result = Some(NodeResult::failure(error.to_string()));
        node.error = Some(error);
        Ok(())
    }

    /// Carry a successful node over from an earlier run of the same graph.
    /// Only a `pending` node can take over a `success` record.
    pub fn restore_node(&mut self, id: &str, previous: &NodeExecutionState) -> Result<(), StateError> {
        let node = self
            .per_node
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownNode(id.to_owned()))?;
        if node.status != NodeStatus::Pending || previous.status != NodeStatus::Success {
            return Err(StateError::InvalidNodeTransition {
                node_id: id.to_owned(),
                from: node.status,
                to: previous.status,
            });
        }
        *node = previous.clone();
        Ok(())
    }

    pub fn skip_node(&mut self, id: &str) -> Result<(), StateError> {
        let node = self.transition_node(id, NodeStatus::Skipped)?;
        node.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition_run(&mut self, to: RunStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidRunTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    fn transition_node(
        &mut self,
        id: &str,
        to: NodeStatus,
    ) -> Result<&mut NodeExecutionState, StateError> {
        let node = self
            .per_node
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownNode(id.to_owned()))?;
        if !node.status.can_transition_to(to) {
            return Err(StateError::InvalidNodeTransition {
                node_id: id.to_owned(),
                from: node.status,
                to,
            });
        }
        node.status = to;
        Ok(node)
    }
}

//! Failure policy: how a terminal node outcome affects the rest of the run.
//!
//! | mode       | node failure (retries exhausted)                              |
//! |------------|---------------------------------------------------------------|
//! | `stop`     | halt: abandon in-flight nodes, skip everything not started    |
//! | `continue` | skip the node's transitive dependents, keep other branches    |
//! | `retry`    | same as `continue` once the node's own retries are exhausted  |
//!
//! A dependency counts as satisfied only when it ended `success`; a node with
//! an `error` or `skipped` dependency can never run and is skipped itself.

use crate::error::ExecutionError;
use crate::models::ErrorHandling;
use crate::state::{NodeStatus, RunState, RunStatus};

/// What the coordinator does after a node ends in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Stop dispatching, abandon in-flight nodes, skip the rest.
    Halt,
    /// Skip the failed node's dependents only.
    IsolateDependents,
}

/// Readiness of a pending node given its dependencies' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// A dependency ended without success; the node must be skipped.
    Blocked,
}

#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    mode: ErrorHandling,
}

impl FailurePolicy {
    pub fn new(mode: ErrorHandling) -> Self {
        Self { mode }
    }

    pub fn on_node_failure(&self) -> FailureAction {
        match self.mode {
            ErrorHandling::Stop => FailureAction::Halt,
            ErrorHandling::Continue | ErrorHandling::Retry => FailureAction::IsolateDependents,
        }
    }

    pub fn is_satisfied(&self, status: NodeStatus) -> bool {
        status == NodeStatus::Success
    }

    pub fn readiness(&self, dependency_statuses: impl IntoIterator<Item = NodeStatus>) -> Readiness {
        let mut readiness = Readiness::Ready;
        for status in dependency_statuses {
            if self.is_satisfied(status) {
                continue;
            }
            if status.is_terminal() {
                return Readiness::Blocked;
            }
            readiness = Readiness::Waiting;
        }
        readiness
    }

    /// Terminal run status and summary error once no node is pending or running.
    ///
    /// `interrupted` (cancel or run timeout) wins over everything else; then a
    /// `stop` halt cause; otherwise the run fails if any node ended `error`.
    pub fn outcome(
        &self,
        state: &RunState,
        halt_cause: Option<&ExecutionError>,
        interrupted: Option<&ExecutionError>,
    ) -> (RunStatus, Option<ExecutionError>) {
        if let Some(reason) = interrupted {
            return (RunStatus::Cancelled, Some(reason.clone()));
        }
        if let Some(cause) = halt_cause {
            return (RunStatus::Error, Some(cause.clone()));
        }

        let failed = state.nodes_with_status(NodeStatus::Error);
        if failed.is_empty() {
            (RunStatus::Success, None)
        } else {
            (RunStatus::Error, Some(ExecutionError::NodesFailed { node_ids: failed }))
        }
    }
}

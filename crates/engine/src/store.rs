//! Run persistence collaborator.
//!
//! The engine saves a run exactly twice: when it is created and when it
//! reaches a terminal status. The submission (graph, settings, input) is
//! saved once alongside the first snapshot so a finished run can be retried.
//! Anything durable (a database, object storage) implements [`RunStore`];
//! [`InMemoryRunStore`] backs tests and the CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ExecutionSettings, WorkflowGraph};
use crate::scheduler::ExecutionRequest;
use crate::state::RunState;

/// Everything needed to start a run again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSubmission {
    pub execution_id: Uuid,
    pub graph: WorkflowGraph,
    pub settings: ExecutionSettings,
    pub request: ExecutionRequest,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, state: &RunState) -> Result<(), StoreError>;

    async fn load(&self, execution_id: Uuid) -> Result<Option<RunState>, StoreError>;

    async fn save_submission(&self, submission: &RunSubmission) -> Result<(), StoreError>;

    async fn load_submission(&self, execution_id: Uuid)
        -> Result<Option<RunSubmission>, StoreError>;
}

/// Keeps serialised snapshots in memory.
///
/// Snapshots are stored as JSON so a save behaves like a real write: later
/// mutation of the caller's state is never visible through `load`.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, serde_json::Value>>,
    submissions: RwLock<HashMap<Uuid, serde_json::Value>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let doc = serde_json::to_value(state)?;
        self.runs.write().await.insert(state.id, doc);
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Option<RunState>, StoreError> {
        let runs = self.runs.read().await;
        match runs.get(&execution_id) {
            Some(doc) => Ok(Some(serde_json::from_value(doc.clone())?)),
            None => Ok(None),
        }
    }

    async fn save_submission(&self, submission: &RunSubmission) -> Result<(), StoreError> {
        let doc = serde_json::to_value(submission)?;
        self.submissions.write().await.insert(submission.execution_id, doc);
        Ok(())
    }

    async fn load_submission(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<RunSubmission>, StoreError> {
        let submissions = self.submissions.read().await;
        match submissions.get(&execution_id) {
            Some(doc) => Ok(Some(serde_json::from_value(doc.clone())?)),
            None => Ok(None),
        }
    }
}

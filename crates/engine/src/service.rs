//! Submission API: start, inspect, await, cancel and retry runs.
//!
//! `ExecutionEngine` is an explicit instance. Share it by reference or `Arc`
//! and submit as many runs as needed; each run gets its own coordinator task
//! and runs never share mutable state.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use nodes::HandlerRegistry;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::dag::{GraphResolver, ResolvedGraph};
use crate::error::EngineError;
use crate::events::{EventSink, ExecutionEvent, NoopEventSink};
use crate::models::{ExecutionSettings, WorkflowGraph};
use crate::scheduler::{ExecutionRequest, ExecutionScheduler, RunServices};
use crate::state::{NodeStatus, RunState};
use crate::store::{InMemoryRunStore, RunStore, RunSubmission};

/// Engine-side view of a run executing in this process.
pub(crate) struct RunHandle {
    snapshots: watch::Receiver<RunState>,
    cancel: CancellationToken,
    events: broadcast::Sender<ExecutionEvent>,
}

pub struct ExecutionEngine {
    resolver: GraphResolver,
    services: RunServices,
    /// Runs still executing. A run leaves this table once its terminal state
    /// has been saved; from then on the store answers for it.
    pub(crate) runs: Arc<DashMap<Uuid, RunHandle>>,
}

impl ExecutionEngine {
    /// An engine with an in-memory run store and no event sink.
    pub fn new(registry: Arc<dyn HandlerRegistry>) -> Self {
        Self::with_services(RunServices {
            registry,
            sink: Arc::new(NoopEventSink),
            store: Arc::new(InMemoryRunStore::new()),
        })
    }

    pub fn with_services(services: RunServices) -> Self {
        Self {
            resolver: GraphResolver::new(),
            services,
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.services.sink = sink;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.services.store = store;
        self
    }

    /// Validate `graph`, persist a fresh run, and start executing it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - [`EngineError::Validation`] for a malformed graph or settings; no run is created.
    /// - [`EngineError::Store`] if the initial save fails; the run is not started.
    #[instrument(skip_all, fields(workflow_id = %graph.id, node_count = graph.nodes.len()))]
    pub async fn start_execution(
        &self,
        graph: WorkflowGraph,
        settings: ExecutionSettings,
        request: impl Into<ExecutionRequest>,
    ) -> Result<Uuid, EngineError> {
        settings.validate()?;
        let resolved = self.resolver.resolve(&graph)?;
        self.launch(graph, resolved, settings, request.into(), None).await
    }

    /// Start a new run of a finished execution's graph, settings and input.
    ///
    /// Without `from_node`, nodes that ended `error` or `skipped` run again
    /// and successful nodes keep their earlier results. With `from_node`,
    /// that node and everything downstream of it run again as well.
    ///
    /// # Errors
    /// - [`EngineError::ExecutionNotFound`] if the execution or its submission is unknown.
    /// - [`EngineError::ExecutionActive`] if the execution has not finished.
    /// - [`EngineError::UnknownNode`] if `from_node` is not in the graph.
    #[instrument(skip(self))]
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        from_node: Option<&str>,
    ) -> Result<Uuid, EngineError> {
        let previous = self.get_status(execution_id).await?;
        if !previous.is_terminal() {
            return Err(EngineError::ExecutionActive(execution_id));
        }
        let submission = self
            .services
            .store
            .load_submission(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let resolved = self.resolver.resolve(&submission.graph)?;

        let mut rerun: BTreeSet<String> = previous
            .per_node
            .iter()
            .filter(|(_, node)| node.status != NodeStatus::Success)
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(from) = from_node {
            if resolved.node(from).is_none() {
                return Err(EngineError::UnknownNode {
                    execution_id,
                    node_id: from.to_owned(),
                });
            }
            rerun.insert(from.to_owned());
            rerun.extend(resolved.transitive_dependents(from).into_iter().map(str::to_owned));
        }
        info!(rerun = rerun.len(), total = resolved.len(), "retrying execution");

        self.launch(
            submission.graph,
            resolved,
            submission.settings,
            submission.request,
            Some((previous, rerun)),
        )
        .await
    }

    async fn launch(
        &self,
        graph: WorkflowGraph,
        resolved: ResolvedGraph,
        settings: ExecutionSettings,
        request: ExecutionRequest,
        previous: Option<(RunState, BTreeSet<String>)>,
    ) -> Result<Uuid, EngineError> {
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let mut scheduler = ExecutionScheduler::new(
            execution_id,
            graph.id,
            Arc::new(resolved),
            settings.clone(),
            request.clone(),
            self.services.clone(),
            cancel.clone(),
        );
        if let Some((earlier, rerun)) = previous {
            scheduler = scheduler.resume_from(&earlier, &rerun);
        }

        self.services
            .store
            .save_submission(&RunSubmission { execution_id, graph, settings, request })
            .await?;
        self.services.store.save(&scheduler.snapshot()).await?;

        self.runs.insert(
            execution_id,
            RunHandle {
                snapshots: scheduler.subscribe_snapshots(),
                cancel,
                events: scheduler.event_sender(),
            },
        );

        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let final_state = scheduler.run().await;
            // The terminal state is saved by now; dropping the handle also
            // closes subscriber channels.
            runs.remove(&final_state.id);
            debug!(execution_id = %final_state.id, "coordinator exited");
        });

        info!(execution_id = %execution_id, "execution submitted");
        Ok(execution_id)
    }

    /// Latest snapshot of a run, falling back to the store for runs that
    /// have finished.
    pub async fn get_status(&self, execution_id: Uuid) -> Result<RunState, EngineError> {
        let live = self
            .runs
            .get(&execution_id)
            .map(|handle| handle.snapshots.borrow().clone());
        if let Some(state) = live {
            return Ok(state);
        }
        self.services
            .store
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Request cancellation. A no-op once the run is terminal.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let token = self.runs.get(&execution_id).and_then(|handle| {
            let finished = handle.snapshots.borrow().is_terminal();
            (!finished).then(|| handle.cancel.clone())
        });

        match token {
            Some(token) => {
                info!(execution_id = %execution_id, "cancellation requested");
                token.cancel();
            }
            None => {
                // Unknown ids are an error; finished ones are left alone.
                self.get_status(execution_id).await?;
                debug!(execution_id = %execution_id, "cancel ignored: run already finished");
            }
        }
        Ok(())
    }

    /// Resolve once the run is terminal.
    pub async fn wait(&self, execution_id: Uuid) -> Result<RunState, EngineError> {
        let rx = self.runs.get(&execution_id).map(|h| h.snapshots.clone());
        let Some(mut rx) = rx else {
            return self.get_status(execution_id).await;
        };

        let finished = rx.wait_for(|s| s.is_terminal()).await.map(|s| (*s).clone()).ok();
        Ok(finished.unwrap_or_else(|| rx.borrow().clone()))
    }

    /// Receive this run's events from now on. The channel closes when the
    /// run becomes terminal; for a finished run it is closed already.
    pub async fn subscribe(
        &self,
        execution_id: Uuid,
    ) -> Result<broadcast::Receiver<ExecutionEvent>, EngineError> {
        let live = self.runs.get(&execution_id).map(|h| h.events.subscribe());
        if let Some(rx) = live {
            return Ok(rx);
        }
        self.get_status(execution_id).await?;
        Ok(broadcast::channel(1).1)
    }

    /// IDs of runs that have not reached a terminal status.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.runs
            .iter()
            .filter(|entry| !entry.snapshots.borrow().is_terminal())
            .map(|entry| *entry.key())
            .collect()
    }
}

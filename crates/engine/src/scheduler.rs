//! Per-run coordinator.
//!
//! `ExecutionScheduler` drives one run from `pending` to a terminal status:
//! 1. Seeds a ready queue with every pending node whose dependencies are met
//!    (the roots, or more for a retry that carries earlier results over).
//! 2. Dispatches ready nodes, lexicographically, while fewer than
//!    `max_concurrent` are in flight; each runs on its own task via `NodeRunner`.
//! 3. Waits for the next completion, cancellation, or the run deadline.
//! 4. Records the outcome, applies the failure policy, unlocks or skips
//!    dependents, and repeats until nothing is pending or running.
//!
//! The coordinator is the only writer of `RunState`. Readers get immutable
//! snapshots through a `watch` channel; lifecycle events go to the shared
//! `EventSink` and to a per-run broadcast channel that closes with the run.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use nodes::{HandlerRegistry, NodeExecutionContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::dag::ResolvedGraph;
use crate::error::ExecutionError;
use crate::events::{EventSink, EventType, ExecutionEvent};
use crate::models::ExecutionSettings;
use crate::policy::{FailureAction, FailurePolicy, Readiness};
use crate::runner::{NodeOutcome, NodeRunner};
use crate::state::{NodeStatus, RunState, RunStatus};
use crate::store::RunStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the caller submits alongside the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Input handed to every root node.
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(input: Value) -> Self {
        Self { input, user_id: None }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<Value> for ExecutionRequest {
    fn from(input: Value) -> Self {
        Self::new(input)
    }
}

/// Shared, thread-safe collaborators injected into every run.
#[derive(Clone)]
pub struct RunServices {
    pub registry: Arc<dyn HandlerRegistry>,
    pub sink: Arc<dyn EventSink>,
    pub store: Arc<dyn RunStore>,
}

pub struct ExecutionScheduler {
    graph: Arc<ResolvedGraph>,
    settings: ExecutionSettings,
    policy: FailurePolicy,
    runner: NodeRunner,
    request: ExecutionRequest,
    services: RunServices,
    state: RunState,
    snapshots: watch::Sender<RunState>,
    events: broadcast::Sender<ExecutionEvent>,
    /// External cancel signal for the whole run.
    cancel: CancellationToken,
    /// Parent of every in-flight node's token; fired on halt, cancel, or timeout.
    abandon: CancellationToken,
    ready: BTreeSet<String>,
    in_flight: JoinSet<(String, NodeOutcome)>,
    halt_cause: Option<ExecutionError>,
    interrupted: Option<ExecutionError>,
}

impl ExecutionScheduler {
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        graph: Arc<ResolvedGraph>,
        settings: ExecutionSettings,
        request: ExecutionRequest,
        services: RunServices,
        cancel: CancellationToken,
    ) -> Self {
        let state = RunState::new(execution_id, workflow_id, graph.node_ids());
        let (snapshots, _) = watch::channel(state.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            policy: FailurePolicy::new(settings.error_handling),
            runner: NodeRunner::from_settings(&settings),
            graph,
            settings,
            request,
            services,
            state,
            snapshots,
            events,
            cancel,
            abandon: CancellationToken::new(),
            ready: BTreeSet::new(),
            in_flight: JoinSet::new(),
            halt_cause: None,
            interrupted: None,
        }
    }

    /// Start from an earlier run of the same graph: every node outside
    /// `rerun` that succeeded there keeps its result and is not executed again.
    pub fn resume_from(mut self, previous: &RunState, rerun: &BTreeSet<String>) -> Self {
        self.state.retry_of = Some(previous.id);
        for (node_id, earlier) in &previous.per_node {
            if rerun.contains(node_id) || earlier.status != NodeStatus::Success {
                continue;
            }
            if let Err(e) = self.state.restore_node(node_id, earlier) {
                warn!(node_id = %node_id, error = %e, "could not carry node over");
            }
        }
        self.snapshots.send_replace(self.state.clone());
        self
    }

    /// Current state, as last published.
    pub fn snapshot(&self) -> RunState {
        self.state.clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<RunState> {
        self.snapshots.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ExecutionEvent> {
        self.events.clone()
    }

    /// Drive the run to a terminal status and return the final state.
    #[instrument(
        skip(self),
        fields(
            execution_id = %self.state.id,
            workflow_id = %self.state.workflow_id,
            node_count = self.graph.len(),
            max_concurrent = self.settings.max_concurrent,
            error_handling = %self.settings.error_handling,
        )
    )]
    pub async fn run(mut self) -> RunState {
        if let Err(e) = self.state.mark_running() {
            warn!(error = %e, "run was not pending at start");
        }
        info!("run started");
        self.publish(ExecutionEvent::run(
            EventType::Started,
            self.state.id,
            json!({ "workflowId": self.state.workflow_id, "totalNodes": self.graph.len() }),
        ));

        let deadline = Instant::now() + Duration::from_millis(self.settings.timeout_ms);
        let run_timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(run_timeout);

        self.ready = self.initially_ready();

        loop {
            if self.interrupted.is_none() {
                if self.cancel.is_cancelled() {
                    self.interrupt(ExecutionError::Cancelled);
                } else if Instant::now() >= deadline {
                    self.interrupt(ExecutionError::RunTimeout { timeout_ms: self.settings.timeout_ms });
                }
            }

            if !self.is_halting() {
                self.dispatch_ready();
            }
            self.publish_snapshot();

            if self.in_flight.is_empty() {
                break;
            }

            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if self.interrupted.is_none() => {
                    self.interrupt(ExecutionError::Cancelled);
                }
                _ = &mut run_timeout, if self.interrupted.is_none() => {
                    self.interrupt(ExecutionError::RunTimeout { timeout_ms: self.settings.timeout_ms });
                }
                joined = self.in_flight.join_next() => match joined {
                    Some(Ok((node_id, outcome))) => self.on_node_finished(node_id, outcome),
                    Some(Err(join_err)) => error!(error = %join_err, "node worker task failed"),
                    None => break,
                },
            }
        }

        self.finalize().await
    }

    fn initially_ready(&self) -> BTreeSet<String> {
        self.state
            .nodes_with_status(NodeStatus::Pending)
            .into_iter()
            .filter(|node_id| {
                let statuses = self
                    .graph
                    .dependencies_of(node_id)
                    .filter_map(|dep| self.state.node_status(dep));
                self.policy.readiness(statuses) == Readiness::Ready
            })
            .collect()
    }

    fn is_halting(&self) -> bool {
        self.halt_cause.is_some() || self.interrupted.is_some()
    }

    /// Cancel or run timeout: abandon in-flight nodes, skip everything else.
    fn interrupt(&mut self, reason: ExecutionError) {
        warn!(reason = %reason, in_flight = self.in_flight.len(), "run interrupted");
        self.interrupted = Some(reason);
        self.abandon.cancel();
        self.skip_pending();
    }

    fn skip_pending(&mut self) {
        self.ready.clear();
        for node_id in self.state.nodes_with_status(NodeStatus::Pending) {
            if let Err(e) = self.state.skip_node(&node_id) {
                warn!(node_id = %node_id, error = %e, "could not skip node");
            }
        }
    }

    fn dispatch_ready(&mut self) {
        while self.in_flight.len() < self.settings.max_concurrent {
            let Some(node_id) = self.ready.pop_first() else {
                break;
            };
            self.dispatch(node_id);
        }
    }

    fn dispatch(&mut self, node_id: String) {
        let Some(spec) = self.graph.node(&node_id).cloned() else {
            warn!(node_id = %node_id, "ready node missing from graph");
            return;
        };
        let input = self.input_for(&node_id);

        if let Err(e) = self.state.start_node(&node_id) {
            warn!(node_id = %node_id, error = %e, "could not start node");
            return;
        }

        let Some(handler) = self.services.registry.resolve(&spec.node_type) else {
            let error = ExecutionError::HandlerNotFound {
                node_id: node_id.clone(),
                node_type: spec.node_type,
            };
            self.on_node_finished(node_id, NodeOutcome { attempt: 1, result: Err(error) });
            return;
        };

        debug!(node_id = %node_id, node_type = %spec.node_type, "dispatching node");

        let ctx = NodeExecutionContext::new(
            node_id.clone(),
            self.state.workflow_id,
            self.state.id,
            self.request.user_id.clone(),
            input,
            spec.config,
            self.abandon.child_token(),
        );
        let runner = self.runner;

        self.in_flight.spawn(async move {
            // The inner task isolates handler panics so they become node errors.
            let worker = tokio::spawn(async move { runner.run(&ctx, handler.as_ref()).await });
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join_err) => NodeOutcome {
                    attempt: 1,
                    result: Err(ExecutionError::NodeExecution {
                        node_id: node_id.clone(),
                        message: format!("handler task failed: {join_err}"),
                        retryable: false,
                    }),
                },
            };
            (node_id, outcome)
        });
    }

    /// Run input for roots; otherwise the merged outputs of every dependency.
    fn input_for(&self, node_id: &str) -> Value {
        let mut deps = self.graph.dependencies_of(node_id).peekable();
        if deps.peek().is_none() {
            return self.request.input.clone();
        }

        let mut merged = Map::new();
        for dep in deps {
            match self.state.node(dep).and_then(|n| n.output()) {
                Some(Value::Object(fields)) => {
                    for (k, v) in fields {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                Some(other) => {
                    merged.insert(dep.to_owned(), other.clone());
                }
                None => {}
            }
        }
        Value::Object(merged)
    }

    fn on_node_finished(&mut self, node_id: String, outcome: NodeOutcome) {
        let attempt = outcome.attempt;
        match outcome.result {
            Ok(output) => {
                if let Err(e) = self.state.complete_node(&node_id, attempt, output.clone()) {
                    warn!(node_id = %node_id, error = %e, "could not record success");
                    return;
                }
                info!(node_id = %node_id, attempt, "node succeeded");
                self.publish(ExecutionEvent::node(
                    EventType::NodeCompleted,
                    self.state.id,
                    node_id.as_str(),
                    json!({ "attempt": attempt, "output": output }),
                ));
                self.release_dependents(&node_id);
            }
            Err(failure) => {
                if let Err(e) = self.state.fail_node(&node_id, attempt, failure.clone()) {
                    warn!(node_id = %node_id, error = %e, "could not record failure");
                    return;
                }
                warn!(node_id = %node_id, attempt, error = %failure, "node failed");
                self.publish(ExecutionEvent::node(
                    EventType::NodeFailed,
                    self.state.id,
                    node_id.as_str(),
                    json!({ "attempt": attempt, "error": failure }),
                ));

                if self.is_halting() {
                    return;
                }
                match self.policy.on_node_failure() {
                    FailureAction::Halt => {
                        info!(node_id = %node_id, "halting run after node failure");
                        self.halt_cause = Some(failure);
                        self.abandon.cancel();
                        self.skip_pending();
                    }
                    FailureAction::IsolateDependents => self.release_dependents(&node_id),
                }
            }
        }
    }

    /// Re-evaluate the dependents of a node that just became terminal:
    /// queue the ones now ready, skip (transitively) the ones now blocked.
    fn release_dependents(&mut self, node_id: &str) {
        let graph = Arc::clone(&self.graph);
        let mut worklist: Vec<&str> = graph.dependents_of(node_id).collect();

        while let Some(candidate) = worklist.pop() {
            if self.state.node_status(candidate) != Some(NodeStatus::Pending)
                || self.ready.contains(candidate)
            {
                continue;
            }

            let statuses = graph
                .dependencies_of(candidate)
                .filter_map(|dep| self.state.node_status(dep));
            match self.policy.readiness(statuses) {
                Readiness::Ready => {
                    self.ready.insert(candidate.to_owned());
                }
                Readiness::Waiting => {}
                Readiness::Blocked => {
                    if let Err(e) = self.state.skip_node(candidate) {
                        warn!(node_id = candidate, error = %e, "could not skip node");
                        continue;
                    }
                    debug!(node_id = candidate, "skipped: dependency did not succeed");
                    worklist.extend(graph.dependents_of(candidate));
                }
            }
        }
    }

    async fn finalize(mut self) -> RunState {
        for node_id in self.state.nodes_with_status(NodeStatus::Running) {
            let lost = ExecutionError::NodeExecution {
                node_id: node_id.clone(),
                message: "worker task lost".into(),
                retryable: false,
            };
            let attempt = self.state.node(&node_id).map_or(1, |n| n.attempt.max(1));
            if let Err(e) = self.state.fail_node(&node_id, attempt, lost) {
                warn!(node_id = %node_id, error = %e, "could not fail lost node");
            }
        }
        self.skip_pending();

        let (status, summary) =
            self.policy
                .outcome(&self.state, self.halt_cause.as_ref(), self.interrupted.as_ref());
        if let Err(e) = self.state.finish(status, summary) {
            warn!(error = %e, "could not finalize run");
        }

        if let Err(e) = self.services.store.save(&self.state).await {
            error!(error = %e, "failed to persist terminal run state");
        }

        let progress = self.state.progress();
        info!(
            status = %self.state.status,
            completed = progress.completed_nodes,
            failed = progress.failed_nodes,
            skipped = progress.skipped_nodes,
            "run finished"
        );

        let event_type = match self.state.status {
            RunStatus::Success => EventType::Completed,
            RunStatus::Cancelled => EventType::Cancelled,
            _ => EventType::Failed,
        };
        self.publish_snapshot();
        self.publish(ExecutionEvent::run(
            event_type,
            self.state.id,
            json!({ "status": self.state.status, "error": self.state.error, "progress": progress }),
        ));

        self.state
    }

    fn publish_snapshot(&self) {
        if *self.snapshots.borrow() != self.state {
            self.snapshots.send_replace(self.state.clone());
        }
    }

    fn publish(&self, event: ExecutionEvent) {
        self.services.sink.publish(&event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

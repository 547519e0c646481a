//! Scenario tests for the run coordinator and the submission API.
//!
//! Nodes are registered under their own ID as `type`, so each node can be
//! given its own `MockNode` behaviour. Timing-sensitive tests run on a
//! paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodes::mock::MockNode;
use nodes::{NodeError, NodeExecutionContext, NodeHandler, NodeRegistry};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    Edge, EngineError, ErrorHandling, EventSink, EventType, ExecutionEngine, ExecutionError,
    ExecutionEvent, ExecutionRequest, ExecutionScheduler, ExecutionSettings, GraphResolver,
    InMemoryRunStore, NodeSpec, NodeStatus, RunServices, RunState, RunStatus, RunStore,
    ValidationError, WorkflowGraph,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn graph(ids: &[&str], edges: &[(&str, &str)]) -> WorkflowGraph {
    WorkflowGraph::new(
        "test",
        ids.iter().map(|id| NodeSpec::new(*id, *id, Value::Null)).collect(),
        edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
    )
}

fn settings(mode: ErrorHandling) -> ExecutionSettings {
    ExecutionSettings::default()
        .with_error_handling(mode)
        .with_retry(0, 10)
}

type EventLog = Arc<Mutex<Vec<ExecutionEvent>>>;

fn recorder() -> (Arc<dyn EventSink>, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn EventSink> = {
        let log = Arc::clone(&log);
        Arc::new(move |e: &ExecutionEvent| log.lock().unwrap().push(e.clone()))
    };
    (sink, log)
}

async fn execute(
    graph: &WorkflowGraph,
    settings: ExecutionSettings,
    registry: NodeRegistry,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> RunState {
    let resolved = GraphResolver::new().resolve(graph).expect("valid graph");
    let scheduler = ExecutionScheduler::new(
        Uuid::new_v4(),
        graph.id,
        Arc::new(resolved),
        settings,
        ExecutionRequest::new(json!({ "origin": "trigger" })),
        RunServices {
            registry: Arc::new(registry),
            sink,
            store: Arc::new(InMemoryRunStore::new()),
        },
        cancel,
    );
    scheduler.run().await
}

async fn execute_simple(
    graph: &WorkflowGraph,
    settings: ExecutionSettings,
    registry: NodeRegistry,
) -> RunState {
    let (sink, _) = recorder();
    execute(graph, settings, registry, sink, CancellationToken::new()).await
}

fn statuses(state: &RunState) -> Vec<(String, NodeStatus)> {
    state
        .per_node
        .iter()
        .map(|(id, n)| (id.clone(), n.status))
        .collect()
}

/// Records start/end of every invocation and the peak number running at once.
#[derive(Default)]
struct Tracer {
    log: Mutex<Vec<(String, &'static str)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl Tracer {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Default::default() })
    }

    fn starts(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind)| *kind == "start")
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn position(&self, node_id: &str, kind: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .position(|(id, k)| id == node_id && *k == kind)
            .unwrap_or_else(|| panic!("no {kind} recorded for {node_id}"))
    }
}

#[async_trait]
impl NodeHandler for Tracer {
    async fn execute(&self, ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        self.log.lock().unwrap().push((ctx.node_id.clone(), "start"));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((ctx.node_id.clone(), "end"));
        Ok(json!({ ctx.node_id.clone(): true }))
    }
}

fn traced_registry(ids: &[&str], tracer: &Arc<Tracer>) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for id in ids {
        registry.register(*id, Arc::clone(tracer) as Arc<dyn NodeHandler>);
    }
    registry
}

// ---------------------------------------------------------------------------
// Ordering and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dependencies_finish_before_dependents_start() {
    let ids = ["a", "b", "c", "d", "e"];
    let edges = [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("e", "d")];
    let g = graph(&ids, &edges);
    let tracer = Tracer::with_delay(Duration::from_millis(10));

    let state = execute_simple(
        &g,
        settings(ErrorHandling::Stop).with_max_concurrent(4),
        traced_registry(&ids, &tracer),
    )
    .await;

    assert_eq!(state.status, RunStatus::Success);
    for (source, target) in edges {
        assert!(
            tracer.position(source, "end") < tracer.position(target, "start"),
            "{source} must finish before {target} starts"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn running_nodes_never_exceed_max_concurrent() {
    let ids: Vec<String> = (0..12).map(|i| format!("n{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let g = graph(&id_refs, &[]);

    for k in [1usize, 3, 5, 12] {
        let tracer = Tracer::with_delay(Duration::from_millis(10));
        let state = execute_simple(
            &g,
            settings(ErrorHandling::Stop).with_max_concurrent(k),
            traced_registry(&id_refs, &tracer),
        )
        .await;

        assert_eq!(state.status, RunStatus::Success);
        assert_eq!(tracer.peak.load(Ordering::SeqCst), k, "max_concurrent = {k}");
    }
}

#[tokio::test(start_paused = true)]
async fn ready_nodes_dispatch_in_lexicographic_order() {
    let ids = ["delta", "alpha", "charlie", "bravo"];
    let g = graph(&ids, &[]);
    let tracer = Tracer::with_delay(Duration::from_millis(1));

    execute_simple(
        &g,
        settings(ErrorHandling::Stop).with_max_concurrent(1),
        traced_registry(&ids, &tracer),
    )
    .await;

    assert_eq!(tracer.starts(), vec!["alpha", "bravo", "charlie", "delta"]);
}

#[tokio::test(start_paused = true)]
async fn identical_runs_replay_identically() {
    let ids = ["a", "b", "c", "d", "e", "f"];
    let edges = [("a", "c"), ("b", "c"), ("c", "d"), ("b", "e"), ("e", "f")];
    let g = graph(&ids, &edges);

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let tracer = Tracer::with_delay(Duration::from_millis(5));
        let mut registry = traced_registry(&ids, &tracer);
        registry.register("e", Arc::new(MockNode::failing_fatal("e", "deterministic failure")));
        let (sink, events) = recorder();

        let state = execute(
            &g,
            settings(ErrorHandling::Continue).with_max_concurrent(2),
            registry,
            sink,
            CancellationToken::new(),
        )
        .await;

        let sequence: Vec<(EventType, Option<String>)> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.event_type, e.node_id.clone()))
            .collect();
        outcomes.push((statuses(&state), tracer.starts(), sequence));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].1, vec!["a", "b", "c", "d"]);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_graph_never_starts() {
    let a = Arc::new(MockNode::returning("a", json!({})));
    let registry = NodeRegistry::new()
        .with("a", a.clone())
        .with("b", Arc::new(MockNode::returning("b", json!({}))));
    let store = Arc::new(InMemoryRunStore::new());
    let engine = ExecutionEngine::new(Arc::new(registry)).with_store(store.clone());

    let err = engine
        .start_execution(
            graph(&["a", "b"], &[("a", "b"), ("b", "a")]),
            ExecutionSettings::default(),
            json!({}),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::Validation(ValidationError::CycleDetected { cycle }) => {
            assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(a.call_count(), 0);
    assert!(store.is_empty().await);
    assert!(engine.active_executions().is_empty());
}

#[tokio::test]
async fn zero_concurrency_is_rejected_at_submission() {
    let engine = ExecutionEngine::new(Arc::new(NodeRegistry::new()));
    let err = engine
        .start_execution(
            graph(&["a"], &[]),
            ExecutionSettings::default().with_max_concurrent(0),
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::InvalidSettings(_))));
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_policy_skips_everything_after_the_failure() {
    // A → B → C, B fails after two attempts.
    let b = Arc::new(MockNode::failing_retryable("b", "upstream 503"));
    let c = Arc::new(MockNode::returning("c", json!({})));
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({}))))
        .with("b", b.clone())
        .with("c", c.clone());

    let state = execute_simple(
        &graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]),
        settings(ErrorHandling::Stop).with_retry(1, 10),
        registry,
    )
    .await;

    assert_eq!(state.node_status("a"), Some(NodeStatus::Success));
    assert_eq!(state.node_status("b"), Some(NodeStatus::Error));
    assert_eq!(state.node("b").unwrap().attempt, 2);
    assert_eq!(state.node_status("c"), Some(NodeStatus::Skipped));
    assert_eq!(state.status, RunStatus::Error);
    assert_eq!(
        state.error,
        Some(ExecutionError::NodeExecution {
            node_id: "b".into(),
            message: "upstream 503".into(),
            retryable: true,
        })
    );
    assert_eq!(b.call_count(), 2);
    assert_eq!(c.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_policy_abandons_in_flight_siblings() {
    let registry = NodeRegistry::new()
        .with("fast", Arc::new(MockNode::failing_fatal("fast", "boom")))
        .with(
            "slow",
            Arc::new(MockNode::returning("slow", json!({})).with_delay(Duration::from_secs(30))),
        )
        .with("tail", Arc::new(MockNode::returning("tail", json!({}))));

    let started = tokio::time::Instant::now();
    let state = execute_simple(
        &graph(&["fast", "slow", "tail"], &[("slow", "tail")]),
        settings(ErrorHandling::Stop),
        registry,
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(state.status, RunStatus::Error);
    assert_eq!(state.node("slow").unwrap().error, Some(ExecutionError::Cancelled));
    assert_eq!(state.node_status("tail"), Some(NodeStatus::Skipped));
    assert!(matches!(
        state.error,
        Some(ExecutionError::NodeExecution { ref node_id, .. }) if node_id == "fast"
    ));
}

#[tokio::test(start_paused = true)]
async fn continue_policy_keeps_independent_siblings_running() {
    // A → B, A → C; B fails, C succeeds.
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({}))))
        .with("b", Arc::new(MockNode::failing_fatal("b", "bad payload")))
        .with("c", Arc::new(MockNode::returning("c", json!({}))));

    let state = execute_simple(
        &graph(&["a", "b", "c"], &[("a", "b"), ("a", "c")]),
        settings(ErrorHandling::Continue),
        registry,
    )
    .await;

    assert_eq!(
        statuses(&state),
        vec![
            ("a".to_string(), NodeStatus::Success),
            ("b".to_string(), NodeStatus::Error),
            ("c".to_string(), NodeStatus::Success),
        ]
    );
    assert_eq!(state.status, RunStatus::Error);
    assert_eq!(
        state.error,
        Some(ExecutionError::NodesFailed { node_ids: vec!["b".into()] })
    );
}

#[tokio::test(start_paused = true)]
async fn continue_policy_skips_transitive_dependents_only() {
    //   a → b → c
    //   a → d
    //   b → e ← d    (e needs the failed branch too)
    let ids = ["a", "b", "c", "d", "e"];
    let mut registry = NodeRegistry::new();
    for id in ids {
        registry.register(id, Arc::new(MockNode::returning(id, json!({}))));
    }
    registry.register("b", Arc::new(MockNode::failing_fatal("b", "nope")));

    let state = execute_simple(
        &graph(&ids, &[("a", "b"), ("b", "c"), ("a", "d"), ("b", "e"), ("d", "e")]),
        settings(ErrorHandling::Continue),
        registry,
    )
    .await;

    assert_eq!(state.node_status("a"), Some(NodeStatus::Success));
    assert_eq!(state.node_status("b"), Some(NodeStatus::Error));
    assert_eq!(state.node_status("c"), Some(NodeStatus::Skipped));
    assert_eq!(state.node_status("d"), Some(NodeStatus::Success));
    assert_eq!(state.node_status("e"), Some(NodeStatus::Skipped));
    assert_eq!(state.status, RunStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn retry_policy_behaves_like_continue_after_retries() {
    let flaky = Arc::new(MockNode::failing_retryable("b", "still down"));
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({}))))
        .with("b", flaky.clone())
        .with("c", Arc::new(MockNode::returning("c", json!({}))));

    let state = execute_simple(
        &graph(&["a", "b", "c"], &[("a", "b"), ("a", "c")]),
        settings(ErrorHandling::Retry).with_retry(2, 50),
        registry,
    )
    .await;

    assert_eq!(flaky.call_count(), 3);
    assert_eq!(state.node("b").unwrap().attempt, 3);
    assert_eq!(state.node_status("c"), Some(NodeStatus::Success));
    assert_eq!(state.status, RunStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn node_recovering_on_retry_succeeds_with_its_attempt_number() {
    let registry = NodeRegistry::new().with("a", Arc::new(MockNode::flaky("a", 1, json!({ "v": 1 }))));

    let state = execute_simple(
        &graph(&["a"], &[]),
        settings(ErrorHandling::Stop).with_retry(3, 100),
        registry,
    )
    .await;

    let a = state.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Success);
    assert_eq!(a.attempt, 2);
    assert_eq!(state.status, RunStatus::Success);
}

#[tokio::test]
async fn unknown_node_type_fails_the_node() {
    let state = execute_simple(
        &graph(&["a"], &[]),
        settings(ErrorHandling::Continue),
        NodeRegistry::new(),
    )
    .await;

    assert_eq!(
        state.node("a").unwrap().error,
        Some(ExecutionError::HandlerNotFound { node_id: "a".into(), node_type: "a".into() })
    );
    assert_eq!(state.node("a").unwrap().attempt, 1);
    assert_eq!(state.status, RunStatus::Error);
}

// ---------------------------------------------------------------------------
// Cancellation and timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_between_nodes_skips_the_rest() {
    let b = Arc::new(MockNode::returning("b", json!({})));
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({}))))
        .with("b", b.clone());

    // Cancel as soon as A's completion is published, before B can be dispatched.
    let cancel = CancellationToken::new();
    let (recorder_sink, events) = recorder();
    let sink = {
        let cancel = cancel.clone();
        move |e: &ExecutionEvent| {
            recorder_sink.publish(e);
            if e.event_type == EventType::NodeCompleted && e.node_id.as_deref() == Some("a") {
                cancel.cancel();
            }
        }
    };

    let state = execute(
        &graph(&["a", "b"], &[("a", "b")]),
        settings(ErrorHandling::Stop),
        registry,
        Arc::new(sink),
        cancel,
    )
    .await;

    assert_eq!(state.node_status("a"), Some(NodeStatus::Success));
    assert_eq!(state.node_status("b"), Some(NodeStatus::Skipped));
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.error, Some(ExecutionError::Cancelled));
    assert_eq!(b.call_count(), 0);

    let kinds: Vec<EventType> = events.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![EventType::Started, EventType::NodeCompleted, EventType::Cancelled]
    );
}

#[tokio::test(start_paused = true)]
async fn run_timeout_cancels_the_run() {
    let registry = NodeRegistry::new().with(
        "slow",
        Arc::new(MockNode::returning("slow", json!({})).with_delay(Duration::from_secs(600))),
    );

    let state = execute_simple(
        &graph(&["slow", "after"], &[("slow", "after")]),
        settings(ErrorHandling::Stop)
            .with_timeout_ms(100)
            .with_node_timeout_ms(3_600_000),
        registry,
    )
    .await;

    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.error, Some(ExecutionError::RunTimeout { timeout_ms: 100 }));
    assert_eq!(state.node("slow").unwrap().error, Some(ExecutionError::Cancelled));
    assert_eq!(state.node_status("after"), Some(NodeStatus::Skipped));
}

// ---------------------------------------------------------------------------
// Data flow and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn node_input_merges_upstream_outputs() {
    let a = Arc::new(MockNode::returning("a", json!({ "x": 1 })));
    let c = Arc::new(MockNode::returning("c", json!({})));
    let registry = NodeRegistry::new()
        .with("a", a.clone())
        .with("b", Arc::new(MockNode::returning("b", json!({ "y": 2 }))))
        .with("c", c.clone());

    execute_simple(
        &graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]),
        settings(ErrorHandling::Stop),
        registry,
    )
    .await;

    assert_eq!(a.inputs(), vec![json!({ "origin": "trigger" })]);
    assert_eq!(c.inputs(), vec![json!({ "node": "b", "x": 1, "y": 2 })]);
}

#[tokio::test]
async fn successful_run_publishes_lifecycle_events_in_order() {
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({}))))
        .with("b", Arc::new(MockNode::returning("b", json!({}))));
    let (sink, events) = recorder();

    let state = execute(
        &graph(&["a", "b"], &[("a", "b")]),
        settings(ErrorHandling::Stop),
        registry,
        sink,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state.status, RunStatus::Success);
    assert!(state.completed_at.is_some());
    let seen: Vec<(EventType, Option<String>)> = events
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.event_type, e.node_id.clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (EventType::Started, None),
            (EventType::NodeCompleted, Some("a".into())),
            (EventType::NodeCompleted, Some("b".into())),
            (EventType::Completed, None),
        ]
    );
}

#[tokio::test]
async fn empty_graph_succeeds_immediately() {
    let state = execute_simple(&graph(&[], &[]), settings(ErrorHandling::Stop), NodeRegistry::new()).await;
    assert_eq!(state.status, RunStatus::Success);
    assert!(state.per_node.is_empty());
}

// ---------------------------------------------------------------------------
// Submission API
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_runs_to_completion_and_persists_terminal_state() {
    let store = Arc::new(InMemoryRunStore::new());
    let registry = NodeRegistry::new()
        .with("a", Arc::new(MockNode::returning("a", json!({ "x": 1 }))))
        .with("b", Arc::new(MockNode::returning("b", json!({}))));
    let engine = ExecutionEngine::new(Arc::new(registry)).with_store(store.clone());

    let id = engine
        .start_execution(
            graph(&["a", "b"], &[("a", "b")]),
            ExecutionSettings::default(),
            ExecutionRequest::new(json!({})).with_user("user-1"),
        )
        .await
        .unwrap();

    let done = engine.wait(id).await.unwrap();
    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(done.node("a").unwrap().output().unwrap()["x"], 1);

    let persisted = store.load(id).await.unwrap().expect("persisted");
    assert_eq!(persisted.status, RunStatus::Success);
    assert_eq!(engine.get_status(id).await.unwrap().status, RunStatus::Success);
    assert!(engine.active_executions().is_empty());

    // Cancelling a finished run is a no-op.
    engine.cancel_execution(id).await.unwrap();
    assert_eq!(engine.get_status(id).await.unwrap().status, RunStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn engine_cancel_stops_a_running_execution() {
    let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()));
    let g = WorkflowGraph::new(
        "sleepy",
        vec![
            NodeSpec::new("wait", "delay", json!({ "ms": 600_000 })),
            NodeSpec::new("after", "passthrough", Value::Null),
        ],
        vec![Edge::new("wait", "after")],
    );

    let id = engine
        .start_execution(g, ExecutionSettings::default(), json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.active_executions(), vec![id]);

    engine.cancel_execution(id).await.unwrap();
    engine.cancel_execution(id).await.unwrap();
    let done = engine.wait(id).await.unwrap();

    assert_eq!(done.status, RunStatus::Cancelled);
    assert_eq!(done.node_status("wait"), Some(NodeStatus::Error));
    assert_eq!(done.node_status("after"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn engine_subscription_closes_when_run_ends() {
    let registry = NodeRegistry::new().with("a", Arc::new(MockNode::returning("a", json!({}))));
    let engine = ExecutionEngine::new(Arc::new(registry));

    let id = engine
        .start_execution(graph(&["a"], &[]), ExecutionSettings::default(), json!({}))
        .await
        .unwrap();
    let mut rx = engine.subscribe(id).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.recv().await {
        kinds.push(event.event_type);
    }
    assert_eq!(
        kinds,
        vec![EventType::Started, EventType::NodeCompleted, EventType::Completed]
    );
}

#[tokio::test]
async fn unknown_execution_is_reported() {
    let engine = ExecutionEngine::new(Arc::new(NodeRegistry::new()));
    let id = Uuid::new_v4();
    assert!(matches!(engine.cancel_execution(id).await, Err(EngineError::ExecutionNotFound(x)) if x == id));
    assert!(matches!(engine.get_status(id).await, Err(EngineError::ExecutionNotFound(_))));
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    let registry = NodeRegistry::new()
        .with("ok", Arc::new(MockNode::returning("ok", json!({}))))
        .with("bad", Arc::new(MockNode::failing_fatal("bad", "x")));
    let engine = ExecutionEngine::new(Arc::new(registry));

    let good = engine
        .start_execution(graph(&["ok"], &[]), ExecutionSettings::default(), json!({}))
        .await
        .unwrap();
    let failing = engine
        .start_execution(graph(&["bad"], &[]), ExecutionSettings::default(), json!({}))
        .await
        .unwrap();

    assert_ne!(good, failing);
    assert_eq!(engine.wait(good).await.unwrap().status, RunStatus::Success);
    assert_eq!(engine.wait(failing).await.unwrap().status, RunStatus::Error);
}

#[tokio::test]
async fn finished_runs_leave_the_run_table() {
    let registry = NodeRegistry::new().with("a", Arc::new(MockNode::returning("a", json!({}))));
    let engine = ExecutionEngine::new(Arc::new(registry));

    let mut ids = Vec::new();
    for _ in 0..50 {
        let id = engine
            .start_execution(graph(&["a"], &[]), ExecutionSettings::default(), json!({}))
            .await
            .unwrap();
        engine.wait(id).await.unwrap();
        ids.push(id);
    }
    assert_eq!(engine.runs.len(), 0);

    // Evicted runs are still answered from the store.
    let last = *ids.last().unwrap();
    assert_eq!(engine.wait(last).await.unwrap().status, RunStatus::Success);
    assert_eq!(engine.get_status(ids[0]).await.unwrap().status, RunStatus::Success);
    let mut rx = engine.subscribe(last).await.unwrap();
    assert!(matches!(rx.recv().await, Err(tokio::sync::broadcast::error::RecvError::Closed)));
    assert!(matches!(
        engine.subscribe(Uuid::new_v4()).await,
        Err(EngineError::ExecutionNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Non-object outputs and handler panics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scalar_upstream_output_is_nested_under_its_node_id() {
    let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()));
    let g = WorkflowGraph::new(
        "scalars",
        vec![
            NodeSpec::new("src", "passthrough", Value::Null),
            NodeSpec::new("tag", "set", json!({ "values": { "k": 1 } })),
            NodeSpec::new("sink", "passthrough", Value::Null),
        ],
        vec![Edge::new("src", "sink"), Edge::new("tag", "sink")],
    );

    let id = engine
        .start_execution(g, ExecutionSettings::default(), json!(5))
        .await
        .unwrap();
    let done = engine.wait(id).await.unwrap();

    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(done.node("src").unwrap().output(), Some(&json!(5)));
    assert_eq!(
        done.node("sink").unwrap().output(),
        Some(&json!({ "src": 5, "input": 5, "k": 1 }))
    );
}

struct Panicker;

#[async_trait]
impl NodeHandler for Panicker {
    async fn execute(&self, _ctx: &NodeExecutionContext) -> Result<Value, NodeError> {
        panic!("handler blew up");
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_fails_its_node_without_retry() {
    let b = Arc::new(MockNode::returning("b", json!({})));
    let registry = NodeRegistry::new()
        .with("a", Arc::new(Panicker))
        .with("b", b.clone());

    let state = execute_simple(
        &graph(&["a", "b"], &[("a", "b")]),
        settings(ErrorHandling::Stop).with_retry(2, 10),
        registry,
    )
    .await;

    let a = state.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Error);
    assert_eq!(a.attempt, 1);
    match &a.error {
        Some(ExecutionError::NodeExecution { node_id, message, retryable }) => {
            assert_eq!(node_id, "a");
            assert!(message.contains("panicked"), "unexpected message: {message}");
            assert!(!retryable);
        }
        other => panic!("expected a node execution error, got {other:?}"),
    }
    assert_eq!(state.node_status("b"), Some(NodeStatus::Skipped));
    assert_eq!(state.status, RunStatus::Error);
    assert_eq!(b.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Retrying finished executions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_reruns_only_nodes_that_did_not_succeed() {
    // a → b, a → c; b fails once, then recovers.
    let a = Arc::new(MockNode::returning("a", json!({ "x": 1 })));
    let b = Arc::new(MockNode::flaky("b", 1, json!({ "y": 2 })));
    let c = Arc::new(MockNode::returning("c", json!({})));
    let registry = NodeRegistry::new()
        .with("a", a.clone())
        .with("b", b.clone())
        .with("c", c.clone());
    let engine = ExecutionEngine::new(Arc::new(registry));
    let settings = settings(ErrorHandling::Continue);

    let first = engine
        .start_execution(graph(&["a", "b", "c"], &[("a", "b"), ("a", "c")]), settings, json!({}))
        .await
        .unwrap();
    let failed = engine.wait(first).await.unwrap();
    assert_eq!(failed.status, RunStatus::Error);

    let second = engine.retry_execution(first, None).await.unwrap();
    assert_ne!(second, first);
    let done = engine.wait(second).await.unwrap();

    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(done.retry_of, Some(first));
    assert_eq!(done.node("a"), failed.node("a"));
    assert_eq!(done.node("c"), failed.node("c"));
    assert_eq!(done.node("b").unwrap().output().unwrap()["y"], 2);
    assert_eq!((a.call_count(), b.call_count(), c.call_count()), (1, 2, 1));
    assert_eq!(b.inputs()[1], json!({ "node": "a", "x": 1 }));

    // The earlier run is untouched.
    assert_eq!(engine.get_status(first).await.unwrap().status, RunStatus::Error);
}

#[tokio::test]
async fn retry_from_node_reruns_its_downstream_branch() {
    // a → b → c, d on its own.
    let ids = ["a", "b", "c", "d"];
    let mocks: Vec<Arc<MockNode>> = ids
        .iter()
        .map(|id| Arc::new(MockNode::returning(*id, json!({ *id: true }))))
        .collect();
    let mut registry = NodeRegistry::new();
    for (id, mock) in ids.iter().zip(&mocks) {
        registry.register(*id, mock.clone());
    }
    let engine = ExecutionEngine::new(Arc::new(registry));

    let first = engine
        .start_execution(
            graph(&ids, &[("a", "b"), ("b", "c")]),
            ExecutionSettings::default(),
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(engine.wait(first).await.unwrap().status, RunStatus::Success);

    let second = engine.retry_execution(first, Some("b")).await.unwrap();
    let done = engine.wait(second).await.unwrap();

    assert_eq!(done.status, RunStatus::Success);
    let calls: Vec<usize> = mocks.iter().map(|m| m.call_count()).collect();
    assert_eq!(calls, vec![1, 2, 2, 1]);
    // b is fed a's carried-over output.
    assert_eq!(mocks[1].inputs()[1], mocks[1].inputs()[0]);
    assert_eq!(done.progress().completed_nodes, 4);
}

#[tokio::test(start_paused = true)]
async fn retry_is_rejected_for_unknown_active_or_mismatched_runs() {
    let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()));
    let g = WorkflowGraph::new(
        "slow",
        vec![NodeSpec::new("wait", "delay", json!({ "ms": 60_000 }))],
        vec![],
    );
    let id = engine
        .start_execution(g, ExecutionSettings::default(), json!({}))
        .await
        .unwrap();

    assert!(matches!(
        engine.retry_execution(id, None).await,
        Err(EngineError::ExecutionActive(x)) if x == id
    ));
    assert!(matches!(
        engine.retry_execution(Uuid::new_v4(), None).await,
        Err(EngineError::ExecutionNotFound(_))
    ));

    engine.wait(id).await.unwrap();
    assert!(matches!(
        engine.retry_execution(id, Some("ghost")).await,
        Err(EngineError::UnknownNode { node_id, .. }) if node_id == "ghost"
    ));
}

//! `engine` crate: graph resolution, run state and the execution scheduler.
//!
//! Flow of a run: [`ExecutionEngine::start_execution`] validates the graph
//! with [`GraphResolver`], creates a [`RunState`], and hands both to an
//! [`ExecutionScheduler`], which dispatches ready nodes through
//! [`NodeRunner`] under the configured [`FailurePolicy`] until the run is
//! terminal.

pub mod dag;
pub mod error;
pub mod events;
pub mod models;
pub mod policy;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;

pub use dag::{validate_dag, GraphResolver, ResolvedGraph};
pub use error::{EngineError, ExecutionError, StateError, StoreError, ValidationError};
pub use events::{
    ChannelEventSink, EventSink, EventType, ExecutionEvent, NoopEventSink, TracingEventSink,
};
pub use models::{Edge, ErrorHandling, ExecutionSettings, NodeSpec, WorkflowGraph};
pub use policy::{FailureAction, FailurePolicy, Readiness};
pub use runner::{NodeOutcome, NodeRunner};
pub use scheduler::{ExecutionRequest, ExecutionScheduler, RunServices};
pub use service::ExecutionEngine;
pub use state::{ExecutionProgress, NodeExecutionState, NodeStatus, RunState, RunStatus};
pub use store::{InMemoryRunStore, RunStore, RunSubmission};

#[cfg(test)]
mod scheduler_tests;

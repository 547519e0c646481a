//! `flowctl` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow JSON file and print its execution order.
//! - `run`: execute a workflow JSON file with the built-in node types.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{ErrorHandling, ExecutionEngine, ExecutionSettings, RunStatus, TracingEventSink, WorkflowGraph};
use nodes::NodeRegistry;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowctl", about = "Run and validate workflow graphs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow and print the final run state as JSON.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Overrides the document's `errorHandling`.
        #[arg(long, env = "FLOW_ERROR_HANDLING")]
        error_handling: Option<ErrorHandling>,
        #[arg(long, env = "FLOW_MAX_CONCURRENT")]
        max_concurrent: Option<usize>,
        /// Whole-run deadline in milliseconds.
        #[arg(long, env = "FLOW_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
        /// Per-attempt node timeout in milliseconds.
        #[arg(long, env = "FLOW_NODE_TIMEOUT_MS")]
        node_timeout_ms: Option<u64>,
        #[arg(long, env = "FLOW_RETRY_ATTEMPTS")]
        retry_attempts: Option<u32>,
        #[arg(long, env = "FLOW_RETRY_DELAY_MS")]
        retry_delay_ms: Option<u64>,
    },
}

/// A workflow file: the graph itself plus optional run settings and input.
#[derive(Debug, Deserialize)]
struct WorkflowDocument {
    #[serde(flatten)]
    graph: WorkflowGraph,
    #[serde(default)]
    settings: Option<ExecutionSettings>,
    #[serde(default)]
    input: Option<Value>,
}

fn load(path: &Path) -> anyhow::Result<WorkflowDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let doc = load(&path)?;
            match engine::validate_dag(&doc.graph) {
                Ok(order) => {
                    println!("Workflow is valid. Execution order: {}", order.join(" -> "));
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Run {
            path,
            error_handling,
            max_concurrent,
            timeout_ms,
            node_timeout_ms,
            retry_attempts,
            retry_delay_ms,
        } => {
            let doc = load(&path)?;

            let mut settings = doc.settings.unwrap_or_default();
            if let Some(mode) = error_handling {
                settings.error_handling = mode;
            }
            if let Some(k) = max_concurrent {
                settings.max_concurrent = k;
            }
            if let Some(ms) = timeout_ms {
                settings.timeout_ms = ms;
            }
            if let Some(ms) = node_timeout_ms {
                settings.node_timeout_ms = Some(ms);
            }
            if let Some(n) = retry_attempts {
                settings.retry_attempts = n;
            }
            if let Some(ms) = retry_delay_ms {
                settings.retry_delay_ms = ms;
            }

            let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()))
                .with_sink(Arc::new(TracingEventSink));

            let execution_id = engine
                .start_execution(doc.graph, settings, doc.input.unwrap_or(Value::Null))
                .await
                .context("workflow rejected")?;
            info!(execution_id = %execution_id, "waiting for run to finish");

            let state = engine.wait(execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);

            Ok(if state.status == RunStatus::Success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

//! # Shrike - Workflow Execution Engine
//!
//! Shrike is a concurrent, graph-based execution engine for
//! declarative workflows: DAGs of HTTP, WebSocket, and transform
//! tasks with template-driven data flow between steps.
//!
//! ## Features
//!
//! - **Graph-Based Execution**: workflows compile into layered plans;
//!   at runtime a task starts the moment its predecessors finish
//! - **Bounded Concurrency**: a worker pool caps parallel tasks per
//!   execution
//! - **Failure Policy**: retries with exponential backoff, per-service
//!   circuit breaking, per-task timeouts under a workflow deadline
//! - **Template Data Flow**: `{{input...}}`, `{{tasks.X.output...}}`,
//!   and `{{env...}}` references resolve against a growing execution
//!   context
//! - **Structured Tracing**: per-task timings, dependency waits,
//!   planned vs. actual parallel groups, and a live event stream
//!
//! ## Core Modules
//!
//! - [`engine`] - the scheduler driving plans to a terminal state
//! - [`planner`] - dependency analysis, cycle detection, layering
//! - [`template`] - compiled template expressions
//! - [`runner`] - HTTP/WebSocket/transform task execution
//! - [`circuit`] - per-service circuit breakers
//! - [`trace`] - trace recording and live events
//! - [`workflow`] - the definition model
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use shrike::engine::{EngineBuilder, ExecuteOptions};
//! use shrike::registry::InMemoryRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(InMemoryRegistry::new());
//! for task in shrike::workflow::load_task_file("tasks.yaml".as_ref())? {
//!     registry.register_task(task);
//! }
//!
//! let workflow = shrike::workflow::load_workflow_file("workflow.yaml".as_ref())?;
//!
//! let engine = EngineBuilder::new()
//!     .with_definition_source(registry)
//!     .build();
//!
//! let (result, trace) = engine
//!     .execute(&workflow, serde_json::json!({"userId": 42}), ExecuteOptions::default())
//!     .await?;
//!
//! println!("status: {:?}", result.status);
//! println!("parallel groups: {:?}", trace.actual_parallel_groups);
//! # Ok(())
//! # }
//! ```
//!
//! ## Command-Line Interface
//!
//! ```bash
//! # Execute a workflow
//! shrike run workflow.yaml --tasks tasks.yaml --input input.json
//!
//! # Validate definitions without executing
//! shrike validate workflow.yaml --tasks tasks.yaml
//! ```
//!
//! ## Configuration
//!
//! Shrike reads `shrike.yaml` and `SHRIKE__*` environment variables;
//! see [`config::ShrikeConfig`].

pub mod circuit;
pub mod config;
pub mod context;
pub mod engine;
pub mod execution;
pub mod handle;
pub mod output;
pub mod persistence;
pub mod planner;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod template;
pub mod trace;
pub mod transform;
pub mod workflow;

pub use engine::{Engine, EngineBuilder, ExecuteOptions};
pub use execution::{ExecutionResult, ExecutionStatus};
pub use handle::ExecutionHandle;

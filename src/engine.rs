//! The execution engine: accepts a workflow definition and an input
//! payload, drives the plan to a terminal state, and produces the
//! execution result and trace.

use crate::circuit::{CircuitRegistry, GLOBAL_CIRCUITS};
use crate::context::{ErrorInfo, ErrorType, ExecutionContext};
use crate::execution::{ExecutionResult, ExecutionStatus, TaskDetail};
use crate::handle::ExecutionHandle;
use crate::persistence::{NoopHook, PersistenceHook};
use crate::planner::{self, ExecutionPlan};
use crate::registry::{DefinitionSource, InMemoryRegistry};
use crate::runner::TaskRunner;
use crate::trace::{Trace, TraceRecorder};
use crate::transform::{NoTransform, TransformEvaluator};
use crate::workflow::{self, RetryPolicy, WorkflowDefinition, WorkflowTask};
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{info, warn};

mod output;
mod scheduler;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Planning error: {source}"))]
    Plan { source: crate::planner::Error },

    #[snafu(display("Task '{task}' references unknown task definition '{task_ref}'"))]
    UnknownTaskRef { task: String, task_ref: String },

    #[snafu(display("Invalid definition: {source}"))]
    Definition { source: crate::workflow::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-invocation overrides.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Workflow deadline; overrides the definition's `timeout`.
    pub timeout: Option<Duration>,
    /// Parallelism cap for this execution; overrides the engine
    /// default.
    pub parallelism: Option<usize>,
    /// Environment view exposed to templates. Defaults to the process
    /// environment.
    pub env: Option<IndexMap<String, String>>,
}

/// Everything resolved ahead of execution: the plan plus per-task
/// definitions, retry policies, and parsed timeouts. Definition errors
/// surface here, synchronously, never at execution time.
pub(crate) struct Prepared {
    pub plan: ExecutionPlan,
    pub defs: Vec<Arc<WorkflowTask>>,
    pub retries: Vec<RetryPolicy>,
    pub task_timeouts: Vec<Option<Duration>>,
    pub workflow_timeout: Option<Duration>,
}

/// The workflow execution engine. Cheap to clone; clones share the
/// task runner, definition source, and circuit state.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<dyn DefinitionSource>,
    runner: Arc<TaskRunner>,
    hook: Arc<dyn PersistenceHook>,
    parallelism: usize,
    event_buffer: usize,
    anomaly_factor: f64,
}

/// Builder for configuring and creating an [`Engine`].
pub struct EngineBuilder {
    registry: Option<Arc<dyn DefinitionSource>>,
    transform: Option<Arc<dyn TransformEvaluator>>,
    hook: Option<Arc<dyn PersistenceHook>>,
    circuits: Option<Arc<CircuitRegistry>>,
    http: Option<reqwest::Client>,
    parallelism: usize,
    event_buffer: usize,
    anomaly_factor: f64,
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: None,
            transform: None,
            hook: None,
            circuits: None,
            http: None,
            parallelism: 50,
            event_buffer: 1024,
            anomaly_factor: 3.0,
        }
    }

    /// Set the definition source task references resolve against.
    #[must_use]
    pub fn with_definition_source(mut self, registry: Arc<dyn DefinitionSource>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the transform pipeline evaluator.
    #[must_use]
    pub fn with_transform_evaluator(mut self, transform: Arc<dyn TransformEvaluator>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the terminal-state persistence hook.
    #[must_use]
    pub fn with_persistence_hook(mut self, hook: Arc<dyn PersistenceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Use a private circuit-breaker registry instead of the shared
    /// process-wide one.
    #[must_use]
    pub fn with_circuit_registry(mut self, circuits: Arc<CircuitRegistry>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Default cap on concurrently running tasks per execution.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Capacity of the live event stream buffer. Subscribers that fall
    /// further behind than this lose events.
    #[must_use]
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    /// Multiple of the layer-median task duration past which an
    /// anomaly event is raised.
    #[must_use]
    pub fn with_anomaly_factor(mut self, factor: f64) -> Self {
        self.anomaly_factor = factor;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let circuits = self
            .circuits
            .unwrap_or_else(|| Arc::clone(&GLOBAL_CIRCUITS));
        let transform = self.transform.unwrap_or_else(|| Arc::new(NoTransform));
        let http = self.http.unwrap_or_default();
        Engine {
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(InMemoryRegistry::new())),
            runner: Arc::new(TaskRunner::new(http, circuits, transform)),
            hook: self.hook.unwrap_or_else(|| Arc::new(NoopHook)),
            parallelism: self.parallelism,
            event_buffer: self.event_buffer,
            anomaly_factor: self.anomaly_factor,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Execute a workflow synchronously: resolves definitions, plans,
    /// runs to a terminal state, and returns the result with its
    /// trace.
    ///
    /// # Errors
    /// Returns an error for definition problems (unknown task
    /// references, invalid durations, planning failures). Runtime task
    /// failures are reported inside the [`ExecutionResult`], not here.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<(ExecutionResult, Trace)> {
        let prepared = self.prepare(workflow, &options).await?;
        let (events_tx, _events_rx) = broadcast::channel(self.event_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let execution_id = uuid::Uuid::new_v4().to_string();
        Ok(self
            .run(
                workflow,
                &prepared,
                input,
                &options,
                events_tx,
                &Arc::new(cancel_tx),
                cancel_rx,
                execution_id,
            )
            .await)
    }

    /// Execute a workflow in the background, returning a handle for
    /// event streaming, cancellation, and the final result.
    ///
    /// # Errors
    /// Same definition errors as [`execute`](Self::execute).
    pub async fn execute_streaming(
        &self,
        workflow: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle> {
        let prepared = self.prepare(&workflow, &options).await?;
        let (events_tx, events_rx) = broadcast::channel(self.event_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (result_tx, result_rx) = oneshot::channel();
        let execution_id = uuid::Uuid::new_v4().to_string();

        let engine = self.clone();
        let handle = ExecutionHandle::new(
            execution_id.clone(),
            events_tx.clone(),
            events_rx,
            Arc::clone(&cancel_tx),
            result_rx,
        );
        tokio::spawn(async move {
            let outcome = engine
                .run(
                    &workflow,
                    &prepared,
                    input,
                    &options,
                    events_tx,
                    &cancel_tx,
                    cancel_rx,
                    execution_id,
                )
                .await;
            let _ = result_tx.send(outcome);
        });
        Ok(handle)
    }

    async fn prepare(
        &self,
        workflow: &WorkflowDefinition,
        options: &ExecuteOptions,
    ) -> Result<Prepared> {
        let plan = planner::plan(workflow).context(PlanSnafu)?;

        let mut defs = Vec::with_capacity(workflow.tasks.len());
        let mut retries = Vec::with_capacity(workflow.tasks.len());
        let mut task_timeouts = Vec::with_capacity(workflow.tasks.len());
        for task in &workflow.tasks {
            let def = self
                .registry
                .lookup_task(&task.task_ref, &workflow.namespace)
                .await
                .ok_or_else(|| Error::UnknownTaskRef {
                    task: task.id.clone(),
                    task_ref: task.task_ref.clone(),
                })?;
            defs.push(def);
            retries.push(task.retry_policy());
            task_timeouts.push(match &task.timeout {
                Some(t) => Some(workflow::parse_duration(t).context(DefinitionSnafu)?),
                None => None,
            });
        }

        let workflow_timeout = match options.timeout {
            Some(t) => Some(t),
            None => match &workflow.timeout {
                Some(t) => Some(workflow::parse_duration(t).context(DefinitionSnafu)?),
                None => None,
            },
        };

        Ok(Prepared {
            plan,
            defs,
            retries,
            task_timeouts,
            workflow_timeout,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        workflow: &WorkflowDefinition,
        prepared: &Prepared,
        input: Value,
        options: &ExecuteOptions,
        events_tx: broadcast::Sender<crate::trace::ExecutionEvent>,
        cancel_tx: &Arc<watch::Sender<bool>>,
        cancel_rx: watch::Receiver<bool>,
        execution_id: String,
    ) -> (ExecutionResult, Trace) {
        let parallelism = options.parallelism.unwrap_or(self.parallelism).max(1);
        let env = options
            .env
            .clone()
            .unwrap_or_else(|| std::env::vars().collect());

        let ctx = ExecutionContext::new(input, env, prepared.plan.task_ids.iter().cloned());
        let recorder = TraceRecorder::new(
            execution_id.clone(),
            workflow.name.clone(),
            &prepared.plan,
            events_tx,
            self.anomaly_factor,
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = prepared.workflow_timeout.map(|d| started + d);

        info!(
            workflow = %workflow.name,
            execution = %execution_id,
            tasks = prepared.plan.task_count(),
            "starting execution"
        );
        recorder.workflow_started();

        let state = scheduler::SchedulerState::new(
            workflow,
            prepared,
            &ctx,
            &recorder,
            &self.runner,
            parallelism,
            cancel_rx.clone(),
            deadline,
        );
        let timed_out = scheduler::run(&state, cancel_tx).await;

        let mut errors = state.fatal_errors.lock().clone();
        let user_cancelled = !timed_out && *cancel_rx.borrow();
        let mut status = if timed_out {
            errors.push(
                ErrorInfo::new(
                    ErrorType::Timeout,
                    format!(
                        "workflow timed out after {}ms",
                        prepared
                            .workflow_timeout
                            .map(|d| d.as_millis())
                            .unwrap_or_default()
                    ),
                )
                .with_code("WORKFLOW_TIMEOUT"),
            );
            ExecutionStatus::Failed
        } else if !errors.is_empty() {
            ExecutionStatus::Failed
        } else if user_cancelled {
            errors.push(
                ErrorInfo::new(ErrorType::Cancelled, "execution cancelled")
                    .with_code("CANCELLED"),
            );
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Succeeded
        };

        // Output mapping runs against the final context regardless of
        // status; keys whose upstream tasks never produced output are
        // dropped, any other template failure voids the output.
        let snapshot = ctx.snapshot();
        let output = match output::map_output(&workflow.output, &snapshot) {
            Ok(map) => {
                if map.is_empty() && status != ExecutionStatus::Succeeded {
                    None
                } else {
                    Some(Value::Object(map))
                }
            }
            Err(e) => {
                if status == ExecutionStatus::Succeeded {
                    status = ExecutionStatus::Failed;
                    errors.push(
                        ErrorInfo::new(ErrorType::TemplateError, e.to_string())
                            .with_code("OUTPUT_MAPPING_FAILED"),
                    );
                }
                None
            }
        };

        let task_details: Vec<TaskDetail> = {
            let mut details = state.details.lock();
            details.iter_mut().filter_map(Option::take).collect()
        };

        let completed_at = Utc::now();
        recorder.workflow_completed(status);
        let trace = recorder.finish();

        let result = ExecutionResult {
            execution_id,
            workflow_name: workflow.name.clone(),
            status,
            output,
            task_details,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at,
        };

        info!(
            workflow = %workflow.name,
            execution = %result.execution_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "execution finished"
        );

        if let Err(e) = self.hook.persist(&result, &trace).await {
            warn!(error = %e, "persistence hook failed; execution result is unaffected");
        }

        (result, trace)
    }
}

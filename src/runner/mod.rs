//! Task execution.
//!
//! The runner executes a single resolved task invocation against its
//! effective deadline and cancellation signal. It reads its arguments
//! and reports back through the returned outcome; context updates are
//! the scheduler's job.

use crate::circuit::CircuitRegistry;
use crate::context::{ContextSnapshot, ErrorInfo, ErrorType};
use crate::schema;
use crate::template;
use crate::transform::TransformEvaluator;
use crate::workflow::{RetryPolicy, TaskKind, WorkflowTask};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

mod http;
mod transform;
mod websocket;

/// How much of an error response body survives into the error record.
pub const BODY_PREVIEW_LIMIT: usize = 256;

/// Successful task invocation: the output plus how many retries it
/// took to get there.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub output: Value,
    pub retry_count: u32,
}

enum Raced<T> {
    Done(T),
    Cancelled,
    Deadline,
}

/// Executes individual tasks with retry, timeout, and circuit
/// breaking. One runner is shared by every execution of an engine.
pub struct TaskRunner {
    http: reqwest::Client,
    circuits: Arc<CircuitRegistry>,
    transform: Arc<dyn TransformEvaluator>,
}

impl TaskRunner {
    pub fn new(
        http: reqwest::Client,
        circuits: Arc<CircuitRegistry>,
        transform: Arc<dyn TransformEvaluator>,
    ) -> Self {
        Self {
            http,
            circuits,
            transform,
        }
    }

    /// Run one task invocation to completion.
    ///
    /// `input` is the snapshot carrying the invocation's resolved
    /// input; `deadline` is the effective deadline (per-task timeout
    /// bounded by the remaining workflow budget); `cancel` flips to
    /// `true` when the execution is cancelled.
    pub async fn run(
        &self,
        task: &WorkflowTask,
        retry: &RetryPolicy,
        input: &ContextSnapshot,
        deadline: Option<Instant>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<TaskOutcome, ErrorInfo> {
        let run_started = Instant::now();

        if let Some(schema_doc) = &task.input_schema {
            if let Err(violations) = schema::validate_against(schema_doc, &input.input) {
                let info = ErrorInfo::new(
                    ErrorType::SchemaError,
                    format!(
                        "input schema violation: {}",
                        format_violations(&violations)
                    ),
                )
                .with_code("INPUT_SCHEMA_VIOLATION");
                return Err(finalize(info, 0, run_started));
            }
        }

        match &task.kind {
            TaskKind::Transform(def) => {
                let output = transform::run(self.transform.as_ref(), def, input)
                    .map_err(|info| finalize(info, 0, run_started))?;
                self.check_output_schema(task, output, 0, run_started)
            }
            TaskKind::Http(_) | TaskKind::Websocket(_) => {
                self.run_network(task, retry, input, deadline, &mut cancel, run_started)
                    .await
            }
        }
    }

    /// Shared attempt loop for HTTP and WebSocket tasks: circuit gate,
    /// one attempt raced against cancellation and the deadline,
    /// exponential backoff between retryable failures.
    async fn run_network(
        &self,
        task: &WorkflowTask,
        retry: &RetryPolicy,
        input: &ContextSnapshot,
        deadline: Option<Instant>,
        cancel: &mut watch::Receiver<bool>,
        run_started: Instant,
    ) -> Result<TaskOutcome, ErrorInfo> {
        let request = match &task.kind {
            TaskKind::Http(def) => NetworkRequest::Http(
                http::build_request(def, input)
                    .map_err(|info| finalize(info, 0, run_started))?,
            ),
            TaskKind::Websocket(def) => NetworkRequest::Ws(
                websocket::build_request(def, input)
                    .map_err(|info| finalize(info, 0, run_started))?,
            ),
            TaskKind::Transform(_) => unreachable!("transform tasks do not reach the network loop"),
        };

        let service = host_of(request.url());
        let breaker = self.circuits.breaker_for(&service);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(finalize(deadline_exceeded(), attempt - 1, run_started));
            }
            if !breaker.allow_request() {
                let info = ErrorInfo::new(
                    ErrorType::CircuitOpen,
                    format!("circuit breaker is open for service '{service}'"),
                )
                .with_code("CIRCUIT_OPEN")
                .with_suggestion(
                    "The service has been failing; wait for the cool-off period to elapse",
                );
                return Err(finalize(info, attempt - 1, run_started));
            }

            debug!(task = %task.name, attempt, "dispatching {} request", task.kind.type_name());
            let attempt_future = async {
                match &request {
                    NetworkRequest::Http(parts) => http::attempt(&self.http, parts).await,
                    NetworkRequest::Ws(parts) => websocket::attempt(parts).await,
                }
            };

            match race(attempt_future, cancel, deadline).await {
                Raced::Done(Ok(output)) => {
                    breaker.record_success();
                    return self.check_output_schema(task, output, attempt - 1, run_started);
                }
                Raced::Done(Err(info)) => {
                    if is_service_failure(&info) {
                        breaker.record_failure();
                    }
                    if !info.is_retryable || attempt >= retry.max_attempts {
                        return Err(finalize(info, attempt - 1, run_started));
                    }
                    let mut delay = retry.delay_before(attempt);
                    if let Some(d) = deadline {
                        delay = delay.min(d.saturating_duration_since(Instant::now()));
                    }
                    debug!(task = %task.name, attempt, ?delay, "retrying after failure");
                    if let Raced::Cancelled =
                        race(tokio::time::sleep(delay), cancel, None).await
                    {
                        return Err(finalize(cancellation(), attempt - 1, run_started));
                    }
                }
                Raced::Cancelled => {
                    return Err(finalize(cancellation(), attempt - 1, run_started));
                }
                Raced::Deadline => {
                    return Err(finalize(deadline_exceeded(), attempt - 1, run_started));
                }
            }
        }
    }

    fn check_output_schema(
        &self,
        task: &WorkflowTask,
        output: Value,
        retry_count: u32,
        run_started: Instant,
    ) -> Result<TaskOutcome, ErrorInfo> {
        if let Some(schema_doc) = &task.output_schema {
            if let Err(violations) = schema::validate_against(schema_doc, &output) {
                let info = ErrorInfo::new(
                    ErrorType::SchemaError,
                    format!(
                        "output schema violation: {}",
                        format_violations(&violations)
                    ),
                )
                .with_code("OUTPUT_SCHEMA_VIOLATION");
                return Err(finalize(info, retry_count, run_started));
            }
        }
        Ok(TaskOutcome {
            output,
            retry_count,
        })
    }
}

enum NetworkRequest {
    Http(http::RequestParts),
    Ws(websocket::RequestParts),
}

impl NetworkRequest {
    fn url(&self) -> &str {
        match self {
            NetworkRequest::Http(parts) => &parts.url,
            NetworkRequest::Ws(parts) => &parts.url,
        }
    }
}

/// Circuit key: the hostname of the resolved URL, falling back to the
/// raw URL when it does not parse.
fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Failures that indicate the service itself is unhealthy and should
/// count against its circuit.
fn is_service_failure(info: &ErrorInfo) -> bool {
    match info.error_type {
        ErrorType::NetworkError | ErrorType::Timeout => true,
        ErrorType::HttpError => info.http_status_code.is_some_and(|s| s >= 500),
        ErrorType::SchemaError
        | ErrorType::CircuitOpen
        | ErrorType::TransformError
        | ErrorType::TemplateError
        | ErrorType::Cancelled
        | ErrorType::UnknownError => false,
    }
}

fn cancellation() -> ErrorInfo {
    ErrorInfo::new(ErrorType::Cancelled, "task cancelled").with_code("CANCELLED")
}

fn deadline_exceeded() -> ErrorInfo {
    ErrorInfo::new(ErrorType::Timeout, "effective deadline exceeded")
        .with_code("DEADLINE_EXCEEDED")
        .retryable(true)
}

fn finalize(mut info: ErrorInfo, retries: u32, run_started: Instant) -> ErrorInfo {
    info.retry_attempts = retries;
    info.duration_until_error_ms = run_started.elapsed().as_millis() as u64;
    info
}

pub(crate) fn template_failure(err: &template::Error) -> ErrorInfo {
    ErrorInfo::new(ErrorType::TemplateError, err.to_string()).with_code("TEMPLATE_ERROR")
}

fn format_violations(violations: &[(String, String)]) -> String {
    violations
        .iter()
        .map(|(field, message)| {
            if field.is_empty() {
                message.clone()
            } else {
                format!("{field}: {message}")
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn truncate_preview(body: &str) -> String {
    if body.len() <= BODY_PREVIEW_LIMIT {
        body.to_string()
    } else {
        let mut end = BODY_PREVIEW_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

/// Wait until the cancellation flag flips. Never resolves if the
/// sender is dropped without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

async fn race<F>(
    future: F,
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
) -> Raced<F::Output>
where
    F: Future,
{
    tokio::select! {
        out = future => Raced::Done(out),
        () = cancelled(cancel) => Raced::Cancelled,
        () = deadline_sleep(deadline) => Raced::Deadline,
    }
}

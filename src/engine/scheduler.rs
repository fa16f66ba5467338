//! The scheduling core: one driver future per task, edge-driven
//! readiness, a bounded worker pool, and the failure policy.
//!
//! Layers from the plan are a planning artifact; at runtime a task
//! starts the moment its own predecessors are terminal, regardless of
//! what else its layer is doing. Completion is signaled per task
//! through a watch channel its successors subscribe to, which gives
//! the happens-before edge between a predecessor's context write and
//! any dependent read.

use super::Prepared;
use crate::context::{ErrorInfo, ErrorType, ExecutionContext, TaskEntry, TaskStatus};
use crate::execution::TaskDetail;
use crate::runner::{self, TaskRunner};
use crate::template;
use crate::trace::{TaskTiming, TraceRecorder};
use crate::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tracing::debug;

pub(super) struct SchedulerState<'a> {
    workflow: &'a WorkflowDefinition,
    prepared: &'a Prepared,
    ctx: &'a ExecutionContext,
    recorder: &'a TraceRecorder,
    runner: &'a TaskRunner,
    pool: Semaphore,
    /// One sender per task; flips to `Some(status)` at the terminal
    /// transition. Successors subscribe.
    signals: Vec<watch::Sender<Option<TaskStatus>>>,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
    /// Set on the first fatal task failure; no new task starts after.
    aborted: AtomicBool,
    pub(super) fatal_errors: Mutex<Vec<ErrorInfo>>,
    pub(super) details: Mutex<Vec<Option<TaskDetail>>>,
}

impl<'a> SchedulerState<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        workflow: &'a WorkflowDefinition,
        prepared: &'a Prepared,
        ctx: &'a ExecutionContext,
        recorder: &'a TraceRecorder,
        runner: &'a TaskRunner,
        parallelism: usize,
        cancel: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Self {
        let task_count = prepared.plan.task_count();
        Self {
            workflow,
            prepared,
            ctx,
            recorder,
            runner,
            pool: Semaphore::new(parallelism),
            signals: (0..task_count)
                .map(|_| watch::channel(None).0)
                .collect(),
            cancel,
            deadline,
            aborted: AtomicBool::new(false),
            fatal_errors: Mutex::new(Vec::new()),
            details: Mutex::new(vec![None; task_count]),
        }
    }
}

/// Drive every task to a terminal state. Returns whether the workflow
/// deadline fired.
pub(super) async fn run(st: &SchedulerState<'_>, cancel_tx: &watch::Sender<bool>) -> bool {
    let drivers: Vec<_> = (0..st.prepared.plan.task_count())
        .map(|idx| drive_task(st, idx))
        .collect();
    let mut all = std::pin::pin!(futures::future::join_all(drivers));

    match st.deadline {
        Some(deadline) => {
            tokio::select! {
                _ = &mut all => false,
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    debug!("workflow deadline reached; cancelling in-flight tasks");
                    cancel_tx.send_replace(true);
                    (&mut all).await;
                    true
                }
            }
        }
        None => {
            all.await;
            false
        }
    }
}

/// One task's lifecycle: wait for predecessors, resolve inputs, take a
/// worker slot, run, install the terminal entry, signal successors.
async fn drive_task(st: &SchedulerState<'_>, idx: usize) {
    let task = &st.workflow.tasks[idx];
    let task_id = &st.prepared.plan.task_ids[idx];
    let mut cancel = st.cancel.clone();

    st.recorder.task_started(task_id);

    let preds = &st.prepared.plan.preds_of[idx];
    let mut waited_for = Vec::with_capacity(preds.len());
    for &pred in preds {
        let pred_id = &st.prepared.plan.task_ids[pred];
        let mut rx = st.signals[pred].subscribe();
        loop {
            if rx.borrow().is_some() {
                break;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = cancelled_flag(&mut cancel) => {
                    finish_cancelled(st, idx, waited_for);
                    return;
                }
            }
        }
        st.recorder.signal_flow(pred_id, task_id);
        waited_for.push(pred_id.clone());
    }

    let ready_at = Utc::now();
    st.recorder.dependencies_satisfied(
        task_id,
        waited_for.clone(),
        if preds.is_empty() {
            None
        } else {
            Some(ready_at)
        },
    );

    if st.aborted.load(Ordering::SeqCst) || *cancel.borrow() {
        finish_cancelled(st, idx, waited_for);
        return;
    }

    // Inputs resolve against the live context only after every
    // predecessor is terminal.
    let snapshot = st.ctx.snapshot();
    let input_doc = Value::Object(
        task.input
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let resolved = match template::evaluate_value(&input_doc, &snapshot) {
        Ok(resolved) => resolved,
        Err(e) => {
            let now = Utc::now();
            let info = runner::template_failure(&e);
            finish(st, idx, Finish {
                status: TaskStatus::Failed,
                output: Value::Null,
                retry_count: 0,
                error: Some(info),
                started_at: now,
                completed_at: now,
                waited_for,
                wait_time_ms: 0,
            });
            return;
        }
    };

    let permit = tokio::select! {
        permit = st.pool.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                finish_cancelled(st, idx, waited_for);
                return;
            }
        },
        () = cancelled_flag(&mut cancel) => {
            finish_cancelled(st, idx, waited_for);
            return;
        }
    };

    if st.aborted.load(Ordering::SeqCst) {
        drop(permit);
        finish_cancelled(st, idx, waited_for);
        return;
    }

    let started_at = Utc::now();
    let run_started = Instant::now();
    let wait_time_ms = if preds.is_empty() {
        0
    } else {
        millis_between(ready_at, started_at)
    };

    let effective_deadline = match (st.deadline, st.prepared.task_timeouts[idx]) {
        (Some(workflow), Some(task)) => Some(workflow.min(run_started + task)),
        (Some(workflow), None) => Some(workflow),
        (None, Some(task)) => Some(run_started + task),
        (None, None) => None,
    };

    debug!(task = %task_id, wait_time_ms, "task dispatched");
    let task_snapshot = st.ctx.task_snapshot(resolved);
    let outcome = st
        .runner
        .run(
            &st.prepared.defs[idx],
            &st.prepared.retries[idx],
            &task_snapshot,
            effective_deadline,
            cancel.clone(),
        )
        .await;
    let completed_at = Utc::now();
    drop(permit);

    match outcome {
        Ok(outcome) => finish(st, idx, Finish {
            status: TaskStatus::Succeeded,
            output: outcome.output,
            retry_count: outcome.retry_count,
            error: None,
            started_at,
            completed_at,
            waited_for,
            wait_time_ms,
        }),
        Err(info) if info.error_type == ErrorType::Cancelled => finish(st, idx, Finish {
            status: TaskStatus::Cancelled,
            output: Value::Null,
            retry_count: info.retry_attempts,
            error: Some(info),
            started_at,
            completed_at,
            waited_for,
            wait_time_ms,
        }),
        Err(info) => {
            // A continueOnFailure task exposes its error record as its
            // output so downstream templates can read it.
            let output = if task.continue_on_failure {
                serde_json::json!({ "error": info })
            } else {
                Value::Null
            };
            finish(st, idx, Finish {
                status: TaskStatus::Failed,
                output,
                retry_count: info.retry_attempts,
                error: Some(info),
                started_at,
                completed_at,
                waited_for,
                wait_time_ms,
            });
        }
    }
}

struct Finish {
    status: TaskStatus,
    output: Value,
    retry_count: u32,
    error: Option<ErrorInfo>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    waited_for: Vec<String>,
    wait_time_ms: u64,
}

/// Terminal transition: apply the failure policy, install the context
/// entry exactly once, record the timing, then signal successors.
fn finish(st: &SchedulerState<'_>, idx: usize, f: Finish) {
    let task = &st.workflow.tasks[idx];
    let task_id = st.prepared.plan.task_ids[idx].clone();

    if f.status == TaskStatus::Failed && !task.continue_on_failure {
        st.aborted.store(true, Ordering::SeqCst);
        if let Some(info) = &f.error {
            st.fatal_errors.lock().push(info.clone());
        }
    }

    st.ctx.install(
        &task_id,
        TaskEntry {
            output: f.output.clone(),
            status: f.status,
            started_at: f.started_at,
            completed_at: f.completed_at,
            retry_count: f.retry_count,
            error: f.error.clone(),
        },
    );

    let duration_ms = millis_between(f.started_at, f.completed_at);
    st.recorder.task_completed(
        TaskTiming {
            task_id: task_id.clone(),
            task_ref: task.task_ref.clone(),
            started_at: f.started_at,
            completed_at: f.completed_at,
            duration_ms,
            wait_time_ms: f.wait_time_ms,
            waited_for: f.waited_for,
            retry_count: f.retry_count,
            success: f.status == TaskStatus::Succeeded,
        },
        f.status,
        f.error
            .clone()
            .filter(|_| f.status == TaskStatus::Failed),
    );

    st.details.lock()[idx] = Some(TaskDetail {
        task_id,
        task_ref: task.task_ref.clone(),
        status: f.status,
        output: f.output,
        error: f.error,
        started_at: f.started_at,
        completed_at: f.completed_at,
        duration_ms,
        retry_count: f.retry_count,
        wait_time_ms: f.wait_time_ms,
    });

    st.signals[idx].send_replace(Some(f.status));
}

/// A task abandoned before its runner started: zero output, identical
/// start and completion stamps.
fn finish_cancelled(st: &SchedulerState<'_>, idx: usize, waited_for: Vec<String>) {
    let now = Utc::now();
    finish(st, idx, Finish {
        status: TaskStatus::Cancelled,
        output: Value::Null,
        retry_count: 0,
        error: Some(
            ErrorInfo::new(ErrorType::Cancelled, "task cancelled before completion")
                .with_code("CANCELLED"),
        ),
        started_at: now,
        completed_at: now,
        waited_for,
        wait_time_ms: 0,
    });
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

async fn cancelled_flag(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

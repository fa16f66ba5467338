//! Trace recording and live event publication.
//!
//! The recorder captures per-task timings, dependency satisfaction
//! times, and planned vs. actual parallel groupings, and publishes a
//! live event stream for the edge layer to push to subscribers. The
//! stream is best-effort: a slow subscriber loses events, execution
//! never waits for it.

use crate::context::{ErrorInfo, TaskStatus};
use crate::execution::ExecutionStatus;
use crate::planner::ExecutionPlan;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Timing record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTiming {
    pub task_id: String,
    pub task_ref: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Time between the last predecessor completing and the runner
    /// starting; zero for tasks with no predecessors.
    pub wait_time_ms: u64,
    pub waited_for: Vec<String>,
    pub retry_count: u32,
    pub success: bool,
}

/// When a task's dependencies were all satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyWait {
    pub task_id: String,
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied_at: Option<DateTime<Utc>>,
}

/// Structured trace of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub execution_id: String,
    pub workflow_name: String,
    pub task_timings: Vec<TaskTiming>,
    pub dependency_order: Vec<DependencyWait>,
    /// The plan's layers: tasks that could have run together.
    pub planned_parallel_groups: Vec<Vec<String>>,
    /// Tasks whose execution intervals transitively overlapped.
    pub actual_parallel_groups: Vec<Vec<String>>,
    #[serde(rename = "errorInfo")]
    pub errors: IndexMap<String, ErrorInfo>,
}

/// Live events published while an execution runs.
///
/// Per task the order is strict: `TaskStarted`, then one `SignalFlow`
/// per predecessor as it completes, then `TaskCompleted`.
/// `WorkflowCompleted` follows every `TaskCompleted`, exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: String,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        execution_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    SignalFlow {
        execution_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        execution_id: String,
        task_id: String,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: String,
        status: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },
    AnomalyDetected {
        execution_id: String,
        task_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

struct RecorderInner {
    timings: Vec<TaskTiming>,
    waits: Vec<DependencyWait>,
    errors: IndexMap<String, ErrorInfo>,
}

/// Collects trace data for one execution and publishes live events.
pub struct TraceRecorder {
    execution_id: String,
    workflow_name: String,
    planned: Vec<Vec<String>>,
    id_to_layer: HashMap<String, usize>,
    events: broadcast::Sender<ExecutionEvent>,
    inner: Mutex<RecorderInner>,
    /// A task slower than this multiple of its layer's median duration
    /// raises an anomaly event.
    anomaly_factor: f64,
}

impl TraceRecorder {
    pub fn new(
        execution_id: String,
        workflow_name: String,
        plan: &ExecutionPlan,
        events: broadcast::Sender<ExecutionEvent>,
        anomaly_factor: f64,
    ) -> Self {
        Self {
            execution_id,
            workflow_name,
            planned: plan.layers.clone(),
            id_to_layer: plan
                .task_ids
                .iter()
                .filter_map(|id| plan.layer_of(id).map(|l| (id.clone(), l)))
                .collect(),
            events,
            inner: Mutex::new(RecorderInner {
                timings: Vec::new(),
                waits: Vec::new(),
                errors: IndexMap::new(),
            }),
            anomaly_factor,
        }
    }

    fn publish(&self, event: ExecutionEvent) {
        // No receivers is fine; the stream is best-effort.
        let _ = self.events.send(event);
    }

    pub fn workflow_started(&self) {
        self.publish(ExecutionEvent::WorkflowStarted {
            execution_id: self.execution_id.clone(),
            workflow_name: self.workflow_name.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn task_started(&self, task_id: &str) {
        self.publish(ExecutionEvent::TaskStarted {
            execution_id: self.execution_id.clone(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn signal_flow(&self, from: &str, to: &str) {
        self.publish(ExecutionEvent::SignalFlow {
            execution_id: self.execution_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn dependencies_satisfied(
        &self,
        task_id: &str,
        depends_on: Vec<String>,
        satisfied_at: Option<DateTime<Utc>>,
    ) {
        self.inner.lock().waits.push(DependencyWait {
            task_id: task_id.to_string(),
            depends_on,
            satisfied_at,
        });
    }

    pub fn task_completed(
        &self,
        timing: TaskTiming,
        status: TaskStatus,
        error: Option<ErrorInfo>,
    ) {
        let anomaly = {
            let mut inner = self.inner.lock();
            if let Some(e) = error {
                inner.errors.insert(timing.task_id.clone(), e);
            }
            let anomaly = self.detect_anomaly(&inner.timings, &timing);
            inner.timings.push(timing.clone());
            anomaly
        };

        self.publish(ExecutionEvent::TaskCompleted {
            execution_id: self.execution_id.clone(),
            task_id: timing.task_id.clone(),
            status,
            timestamp: Utc::now(),
        });
        if let Some(message) = anomaly {
            self.publish(ExecutionEvent::AnomalyDetected {
                execution_id: self.execution_id.clone(),
                task_id: timing.task_id,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    /// Compare a completed task against the median duration of its
    /// already-completed layer peers.
    fn detect_anomaly(&self, timings: &[TaskTiming], timing: &TaskTiming) -> Option<String> {
        if !timing.success {
            return None;
        }
        let layer = self.id_to_layer.get(&timing.task_id)?;
        let mut peers: Vec<u64> = timings
            .iter()
            .filter(|t| t.success && self.id_to_layer.get(&t.task_id) == Some(layer))
            .map(|t| t.duration_ms)
            .collect();
        if peers.len() < 2 {
            return None;
        }
        peers.sort_unstable();
        let median = peers[peers.len() / 2].max(1);
        let ratio = timing.duration_ms as f64 / median as f64;
        if ratio > self.anomaly_factor {
            Some(format!(
                "task ran {}ms against a layer median of {}ms",
                timing.duration_ms, median
            ))
        } else {
            None
        }
    }

    pub fn workflow_completed(&self, status: ExecutionStatus) {
        self.publish(ExecutionEvent::WorkflowCompleted {
            execution_id: self.execution_id.clone(),
            status,
            timestamp: Utc::now(),
        });
    }

    /// Freeze the recorder into the final trace.
    pub fn finish(&self) -> Trace {
        let inner = self.inner.lock();
        let mut timings = inner.timings.clone();
        timings.sort_by_key(|t| t.started_at);
        Trace {
            execution_id: self.execution_id.clone(),
            workflow_name: self.workflow_name.clone(),
            actual_parallel_groups: actual_parallel_groups(&timings),
            task_timings: timings,
            dependency_order: inner.waits.clone(),
            planned_parallel_groups: self.planned.clone(),
            errors: inner.errors.clone(),
        }
    }
}

/// Sweep the timeline and group tasks whose `[startedAt, completedAt]`
/// intervals transitively overlap. Input must be sorted by start time.
fn actual_parallel_groups(timings: &[TaskTiming]) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_end: Option<DateTime<Utc>> = None;

    for timing in timings {
        match current_end {
            Some(end) if timing.started_at < end => {
                current.push(timing.task_id.clone());
                current_end = Some(end.max(timing.completed_at));
            }
            _ => {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                current.push(timing.task_id.clone());
                current_end = Some(timing.completed_at);
            }
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timing(id: &str, start_ms: i64, end_ms: i64) -> TaskTiming {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        TaskTiming {
            task_id: id.to_string(),
            task_ref: "t".to_string(),
            started_at: base + chrono::Duration::milliseconds(start_ms),
            completed_at: base + chrono::Duration::milliseconds(end_ms),
            duration_ms: (end_ms - start_ms).unsigned_abs(),
            wait_time_ms: 0,
            waited_for: Vec::new(),
            retry_count: 0,
            success: true,
        }
    }

    #[test]
    fn test_sequential_tasks_form_separate_groups() {
        let groups = actual_parallel_groups(&[timing("a", 0, 10), timing("b", 20, 30)]);
        assert_eq!(groups, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }

    #[test]
    fn test_overlapping_tasks_share_a_group() {
        let groups = actual_parallel_groups(&[timing("a", 0, 50), timing("b", 10, 60)]);
        assert_eq!(groups, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_transitive_overlap_merges() {
        // a overlaps b, b overlaps c, a does not directly overlap c.
        let groups = actual_parallel_groups(&[
            timing("a", 0, 30),
            timing("b", 20, 60),
            timing("c", 50, 80),
        ]);
        assert_eq!(
            groups,
            vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
        );
    }

    #[test]
    fn test_touching_endpoints_do_not_merge() {
        let groups = actual_parallel_groups(&[timing("a", 0, 10), timing("b", 10, 20)]);
        assert_eq!(groups.len(), 2);
    }
}

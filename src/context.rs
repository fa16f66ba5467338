//! Per-execution context: the invoker's input, terminal task entries,
//! and a read-only environment view.
//!
//! The context is the only shared mutable structure within an
//! execution. Each task writes its entry exactly once, at its terminal
//! transition; readers work from immutable snapshots.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal (or in-flight) status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    Timeout,
    HttpError,
    NetworkError,
    SchemaError,
    CircuitOpen,
    TransformError,
    TemplateError,
    Cancelled,
    UnknownError,
}

/// Structured failure record. Appears verbatim in the trace, the
/// execution result, and (for `continueOnFailure` tasks) in the context
/// entry templates read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_preview: Option<String>,
    pub retry_attempts: u32,
    pub is_retryable: bool,
    pub duration_until_error_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_action: Option<String>,
}

impl ErrorInfo {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            error_code: None,
            http_status_code: None,
            response_body_preview: None,
            retry_attempts: 0,
            is_retryable: false,
            duration_until_error_ms: 0,
            suggestion: None,
            support_action: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status_code = Some(status);
        self
    }

    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.response_body_preview = Some(preview.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }
}

/// Terminal record for one task, installed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub output: Value,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Immutable view of the context handed to the template evaluator.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub input: Value,
    pub env: Value,
    pub tasks: IndexMap<String, TaskSnapshot>,
}

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    /// `None` while the task has not reached a terminal status.
    pub status: Option<TaskStatus>,
    /// The serialized [`TaskEntry`]; `Null` until terminal.
    pub value: Value,
}

impl TaskSnapshot {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// The mutable per-execution context. One writer per task entry, at
/// terminal transition only.
pub struct ExecutionContext {
    input: Value,
    env: IndexMap<String, String>,
    entries: RwLock<IndexMap<String, Option<TaskEntry>>>,
}

impl ExecutionContext {
    /// Create a context for the given input and environment view, with
    /// a slot per declared task id.
    pub fn new<I>(input: Value, env: IndexMap<String, String>, task_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let entries = task_ids.into_iter().map(|id| (id, None)).collect();
        Self {
            input,
            env,
            entries: RwLock::new(entries),
        }
    }

    /// Install a task's terminal entry. The entry for a task is written
    /// once; a second install for the same id is a bug upstream.
    pub fn install(&self, task_id: &str, entry: TaskEntry) {
        debug_assert!(entry.status.is_terminal());
        let mut entries = self.entries.write();
        match entries.get_mut(task_id) {
            Some(slot) => {
                debug_assert!(slot.is_none(), "task entry installed twice: {task_id}");
                *slot = Some(entry);
            }
            None => {
                entries.insert(task_id.to_string(), Some(entry));
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskEntry> {
        self.entries.read().get(task_id).cloned().flatten()
    }

    /// All installed terminal entries, in declaration order.
    pub fn entries(&self) -> IndexMap<String, TaskEntry> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, entry)| entry.clone().map(|e| (id.clone(), e)))
            .collect()
    }

    fn env_value(&self) -> Value {
        Value::Object(
            self.env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    /// Snapshot the full context for workflow-level template
    /// evaluation (`input`, `tasks`, `env` roots).
    pub fn snapshot(&self) -> ContextSnapshot {
        let tasks = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| {
                let snap = match entry {
                    Some(e) => TaskSnapshot {
                        status: Some(e.status),
                        value: serde_json::to_value(e).unwrap_or(Value::Null),
                    },
                    None => TaskSnapshot {
                        status: None,
                        value: Value::Null,
                    },
                };
                (id.clone(), snap)
            })
            .collect();
        ContextSnapshot {
            input: self.input.clone(),
            env: self.env_value(),
            tasks,
        }
    }

    /// Snapshot for task-level template evaluation, where `input` is
    /// the invocation's resolved input and task outputs are not
    /// visible.
    pub fn task_snapshot(&self, resolved_input: Value) -> ContextSnapshot {
        ContextSnapshot {
            input: resolved_input,
            env: self.env_value(),
            tasks: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(status: TaskStatus, output: Value) -> TaskEntry {
        TaskEntry {
            output,
            status,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            retry_count: 0,
            error: None,
        }
    }

    #[test]
    fn test_snapshot_distinguishes_pending_from_missing() {
        let ctx = ExecutionContext::new(
            json!({"a": 1}),
            IndexMap::new(),
            vec!["first".to_string(), "second".to_string()],
        );
        ctx.install("first", entry(TaskStatus::Succeeded, json!({"v": 1})));

        let snap = ctx.snapshot();
        assert!(snap.tasks.get("first").unwrap().is_terminal());
        assert!(!snap.tasks.get("second").unwrap().is_terminal());
        assert!(!snap.tasks.contains_key("third"));

        assert!(ctx.get("first").is_some());
        assert!(ctx.get("second").is_none());
        assert_eq!(ctx.entries().len(), 1);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let e = entry(TaskStatus::Succeeded, json!({"v": 2}));
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["output"]["v"], 2);
        assert_eq!(value["status"], "Succeeded");
        assert!(value.get("startedAt").is_some());
        assert!(value.get("retryCount").is_some());
    }

    #[test]
    fn test_env_is_visible_in_snapshot() {
        let mut env = IndexMap::new();
        env.insert("REGION".to_string(), "eu-west-1".to_string());
        let ctx = ExecutionContext::new(json!({}), env, Vec::new());
        assert_eq!(ctx.snapshot().env["REGION"], "eu-west-1");
    }
}

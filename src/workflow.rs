//! Workflow and task definition model.
//!
//! Definitions are authored as YAML documents and deserialized into the
//! types below. The same types serialize back to YAML structurally
//! unchanged, so definitions survive a load/store round trip.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid duration '{input}': {message}"))]
    InvalidDuration { input: String, message: String },

    #[snafu(display("I/O error reading {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("YAML parsing error in {path}: {source}"))]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Ceiling applied to exponential retry backoff.
pub const BACKOFF_CAP_MS: u64 = 30_000;

fn default_namespace() -> String {
    "default".to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A declarative workflow: a set of task invocations wired together by
/// dependencies, plus an output mapping over their results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Schema the invoker's payload is validated against at the edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSchema>,

    /// Task invocations in authoring order. Execution order is derived
    /// from `dependsOn` and template references, not from this order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRef>,

    /// Map of output key to template string, evaluated against the
    /// final execution context.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub output: IndexMap<String, String>,

    /// Workflow-wide deadline as a duration string, e.g. `"30s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// One step of a workflow: an invocation of a named [`WorkflowTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Unique id within the workflow; the key under which the task's
    /// output appears in the execution context.
    pub id: String,

    /// Name of the `WorkflowTask` to invoke.
    pub task_ref: String,

    /// Input parameters. String values may contain `{{...}}` templates.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub input: IndexMap<String, serde_json::Value>,

    /// Explicit predecessor task ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-task deadline override as a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// When true, a failure of this task does not fail the workflow.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_failure: bool,
}

impl TaskRef {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

/// Retry policy for a task invocation. Backoff doubles per attempt and
/// is capped at [`BACKOFF_CAP_MS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-indexed): `backoff * 2^(k-1)`,
    /// capped.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << exp)
            .min(BACKOFF_CAP_MS);
        Duration::from_millis(ms)
    }
}

/// Reusable task template, referenced from workflows by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(flatten)]
    pub kind: TaskKind,

    /// JSON Schema the resolved input is validated against before the
    /// task runs. Violations are fatal for the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,

    /// JSON Schema the task's output is validated against on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// The three task variants share a capability set (resolve inputs, run
/// against a deadline, classify errors); a tagged union plus a dispatch
/// match in the runner keeps that set closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Http(HttpTask),
    Websocket(WebSocketTask),
    Transform(TransformTask),
}

impl TaskKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::Http(_) => "http",
            TaskKind::Websocket(_) => "websocket",
            TaskKind::Transform(_) => "transform",
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP request template. All fields are template strings evaluated
/// over the invocation's resolved input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTask {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// WebSocket request template: open a connection, send one request
/// frame, await a single response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketTask {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
}

/// Pipeline definition handed verbatim to the external transform
/// evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformTask {
    pub pipeline: serde_json::Value,
}

/// Workflow input schema. Recognized option set only; anything richer
/// belongs in task-level `inputSchema`/`outputSchema` documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Parse a duration string into a [`Duration`].
///
/// Supports compound values with `ms`, `s`, `m`, and `h` units:
/// - `500ms` (500 milliseconds)
/// - `30s` (30 seconds)
/// - `1m30s` (90 seconds)
/// - `0.5s` (500 milliseconds)
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidDuration {
            input: input.to_string(),
            message: "empty duration".to_string(),
        });
    }

    let mut total_ms: f64 = 0.0;
    let mut current_num = String::new();
    let mut current_unit = String::new();
    let mut saw_component = false;

    let mut flush = |num: &mut String, unit: &mut String, total: &mut f64| -> Result<()> {
        if num.is_empty() || unit.is_empty() {
            return Err(Error::InvalidDuration {
                input: input.to_string(),
                message: "expected <number><unit> components".to_string(),
            });
        }
        let value: f64 = num.parse().map_err(|_| Error::InvalidDuration {
            input: input.to_string(),
            message: format!("failed to parse number: {num}"),
        })?;
        let factor = match unit.as_str() {
            "ms" => 1.0,
            "s" => 1000.0,
            "m" => 60.0 * 1000.0,
            "h" => 3600.0 * 1000.0,
            other => {
                return Err(Error::InvalidDuration {
                    input: input.to_string(),
                    message: format!("unsupported unit: {other}"),
                });
            }
        };
        *total += value * factor;
        num.clear();
        unit.clear();
        Ok(())
    };

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            if !current_unit.is_empty() {
                flush(&mut current_num, &mut current_unit, &mut total_ms)?;
                saw_component = true;
            }
            current_num.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if current_num.is_empty() {
                return Err(Error::InvalidDuration {
                    input: input.to_string(),
                    message: format!("unit without a number: {ch}"),
                });
            }
            current_unit.push(ch);
        } else {
            return Err(Error::InvalidDuration {
                input: input.to_string(),
                message: format!("unexpected character: {ch}"),
            });
        }
    }
    if !current_num.is_empty() || !current_unit.is_empty() {
        flush(&mut current_num, &mut current_unit, &mut total_ms)?;
        saw_component = true;
    }
    if !saw_component {
        return Err(Error::InvalidDuration {
            input: input.to_string(),
            message: "no components".to_string(),
        });
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = total_ms as u64;
    Ok(Duration::from_millis(millis))
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(path).context(IoSnafu {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&text).context(YamlSnafu {
        path: path.display().to_string(),
    })
}

/// Load a list of task definitions from a YAML file.
pub fn load_task_file(path: &Path) -> Result<Vec<WorkflowTask>> {
    let text = std::fs::read_to_string(path).context(IoSnafu {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&text).context(YamlSnafu {
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        let duration = parse_duration("30s").unwrap();
        assert_eq!(duration.as_secs(), 30);
    }

    #[test]
    fn test_parse_duration_millis() {
        let duration = parse_duration("500ms").unwrap();
        assert_eq!(duration.as_millis(), 500);
    }

    #[test]
    fn test_parse_duration_compound() {
        let duration = parse_duration("1m30s").unwrap();
        assert_eq!(duration.as_secs(), 90);
    }

    #[test]
    fn test_parse_duration_fractional() {
        let duration = parse_duration("0.5s").unwrap();
        assert_eq!(duration.as_millis(), 500);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("5 s").is_err());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            backoff_ms: 100,
        };
        assert_eq!(retry.delay_before(1).as_millis(), 100);
        assert_eq!(retry.delay_before(2).as_millis(), 200);
        assert_eq!(retry.delay_before(3).as_millis(), 400);
        assert_eq!(
            retry.delay_before(20).as_millis(),
            u128::from(BACKOFF_CAP_MS)
        );
    }

    #[test]
    fn test_workflow_yaml_round_trip() {
        let yaml = r#"
name: enrich-user
namespace: demo
input:
  type: object
  properties:
    userId:
      type: number
      required: true
  required:
    - userId
tasks:
  - id: fetch
    taskRef: get-user
    input:
      userId: '{{input.userId}}'
  - id: greet
    taskRef: greet-user
    input:
      name: '{{tasks.fetch.output.name}}'
    dependsOn:
      - fetch
    timeout: 5s
    retry:
      maxAttempts: 2
      backoffMs: 50
output:
  greeting: '{{tasks.greet.output.message}}'
timeout: 30s
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.tasks.len(), 2);
        assert_eq!(workflow.tasks[1].depends_on, vec!["fetch"]);

        let rendered = serde_yaml::to_string(&workflow).unwrap();
        let reparsed: WorkflowDefinition = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(workflow, reparsed);
    }

    #[test]
    fn test_task_kind_tagging() {
        let yaml = r#"
name: get-user
type: http
method: GET
url: 'http://api.internal/users/{{input.userId}}'
headers:
  accept: application/json
"#;
        let task: WorkflowTask = serde_yaml::from_str(yaml).unwrap();
        match &task.kind {
            TaskKind::Http(http) => {
                assert_eq!(http.method, "GET");
                assert!(http.url.contains("{{input.userId}}"));
            }
            TaskKind::Websocket(_) | TaskKind::Transform(_) => panic!("expected http task"),
        }

        let rendered = serde_yaml::to_string(&task).unwrap();
        let reparsed: WorkflowTask = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(task, reparsed);
    }

    #[test]
    fn test_retry_defaults() {
        let task: TaskRef = serde_yaml::from_str("id: a\ntaskRef: t").unwrap();
        let retry = task.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_ms, 100);
        assert!(!task.continue_on_failure);
    }
}

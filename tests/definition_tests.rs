#![allow(clippy::unwrap_used)]

/// Definition loading and the synchronous error surface: every
/// definition problem is reported before any task runs.
mod common;

use common::{engine_with, http_task, parse_workflow};
use serde_json::json;
use shrike::engine::{Error as EngineError, ExecuteOptions};
use shrike::registry::InMemoryRegistry;
use shrike::workflow;
use std::io::Write;
use std::sync::Arc;

#[test]
fn test_load_definitions_from_files() {
    let dir = tempfile::tempdir().unwrap();

    let workflow_path = dir.path().join("workflow.yaml");
    std::fs::File::create(&workflow_path)
        .unwrap()
        .write_all(
            br#"
name: file-based
tasks:
  - id: fetch
    taskRef: get-user
    input:
      userId: '{{input.userId}}'
"#,
        )
        .unwrap();

    let tasks_path = dir.path().join("tasks.yaml");
    std::fs::File::create(&tasks_path)
        .unwrap()
        .write_all(
            br#"
- name: get-user
  type: http
  method: GET
  url: 'http://api.internal/users/{{input.userId}}'
"#,
        )
        .unwrap();

    let definition = workflow::load_workflow_file(&workflow_path).unwrap();
    assert_eq!(definition.name, "file-based");
    assert_eq!(definition.tasks.len(), 1);

    let tasks = workflow::load_task_file(&tasks_path).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "get-user");
}

#[test]
fn test_load_rejects_malformed_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"name: [unclosed")
        .unwrap();

    assert!(matches!(
        workflow::load_workflow_file(&path),
        Err(workflow::Error::Yaml { .. })
    ));
}

#[tokio::test]
async fn test_unknown_task_reference_is_a_definition_error() {
    let registry = Arc::new(InMemoryRegistry::new());
    let workflow = parse_workflow(
        r#"
name: dangling
tasks:
  - id: a
    taskRef: not-registered
"#,
    );

    let engine = engine_with(registry);
    let err = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnknownTaskRef { task, task_ref }
            if task == "a" && task_ref == "not-registered"
    ));
}

#[tokio::test]
async fn test_cyclic_workflow_is_rejected_before_execution() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("noop", "GET", "http://api.internal/"));

    let workflow = parse_workflow(
        r#"
name: loop
tasks:
  - id: a
    taskRef: noop
    dependsOn: [b]
  - id: b
    taskRef: noop
    dependsOn: [a]
"#,
    );

    let engine = engine_with(registry);
    let err = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Plan { .. }));
}

#[tokio::test]
async fn test_invalid_timeout_is_a_definition_error() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("noop", "GET", "http://api.internal/"));

    let workflow = parse_workflow(
        r#"
name: bad-timeout
timeout: eventually
tasks:
  - id: a
    taskRef: noop
"#,
    );

    let engine = engine_with(registry);
    let err = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition { .. }));
}

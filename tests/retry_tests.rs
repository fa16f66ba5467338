#![allow(clippy::unwrap_used)]

/// Retry, backoff, and circuit-breaker behavior against a mock
/// service.
mod common;

use common::{engine_with, http_task, parse_workflow};
use serde_json::json;
use shrike::circuit::{CircuitBreakerConfig, CircuitRegistry, CircuitState};
use shrike::context::{ErrorType, TaskStatus};
use shrike::engine::{EngineBuilder, ExecuteOptions};
use shrike::execution::ExecutionStatus;
use shrike::registry::{DefinitionSource, InMemoryRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_retries_until_the_service_recovers() {
    let server = MockServer::start().await;
    // Two failures, then success.
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": [1, 2]})))
        .mount(&server)
        .await;

    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("orders", "GET", &format!("{}/orders", server.uri())));

    let workflow = parse_workflow(
        r#"
name: flaky-fetch
tasks:
  - id: fetch
    taskRef: orders
    retry:
      maxAttempts: 3
      backoffMs: 10
output:
  orders: '{{tasks.fetch.output.orders}}'
"#,
    );

    let engine = engine_with(Arc::clone(&registry));
    let (result, _trace) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    let fetch = result.task("fetch").unwrap();
    assert_eq!(fetch.retry_count, 2);
    assert_eq!(fetch.output, json!({"orders": [1, 2]}));
    assert_eq!(result.output, Some(json!({"orders": [1, 2]})));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("orders", "GET", &format!("{}/orders", server.uri())));

    let workflow = parse_workflow(
        r#"
name: fatal-fetch
tasks:
  - id: fetch
    taskRef: orders
    retry:
      maxAttempts: 3
      backoffMs: 10
"#,
    );

    let engine = engine_with(Arc::clone(&registry));
    let (result, trace) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.task("fetch").unwrap().error.clone().unwrap();
    assert_eq!(error.error_type, ErrorType::HttpError);
    assert_eq!(error.http_status_code, Some(400));
    assert!(!error.is_retryable);
    assert_eq!(error.retry_attempts, 0);
    assert_eq!(error.response_body_preview.as_deref(), Some("bad request"));
    assert_eq!(trace.errors.get("fetch"), Some(&error));
}

#[tokio::test]
async fn test_retry_envelope_spends_the_backoff_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("orders", "GET", &format!("{}/orders", server.uri())));

    let workflow = parse_workflow(
        r#"
name: exhausted
tasks:
  - id: fetch
    taskRef: orders
    retry:
      maxAttempts: 3
      backoffMs: 50
"#,
    );

    let engine = engine_with(Arc::clone(&registry));
    let start = Instant::now();
    let (result, _trace) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.task("fetch").unwrap().error.clone().unwrap();
    assert_eq!(error.error_type, ErrorType::HttpError);
    assert_eq!(error.retry_attempts, 2);
    assert!(error.is_retryable);
    // Backoff doubles: 50ms before attempt 2, 100ms before attempt 3.
    assert!(
        elapsed >= Duration::from_millis(140),
        "three attempts with doubling backoff should spend >=150ms, took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures_and_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/inventory"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/inventory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task(
        "inventory",
        "GET",
        &format!("{}/inventory", server.uri()),
    ));

    let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
        failure_threshold: 5,
        window: Duration::from_secs(60),
        cool_off: Duration::from_millis(200),
        half_open_successes: 2,
    }));
    let engine = EngineBuilder::new()
        .with_definition_source(Arc::clone(&registry) as Arc<dyn DefinitionSource>)
        .with_circuit_registry(Arc::clone(&circuits))
        .build();

    let workflow = parse_workflow(
        r#"
name: inventory-check
tasks:
  - id: check
    taskRef: inventory
    retry:
      maxAttempts: 1
"#,
    );

    // Five failures trip the breaker for the service.
    for _ in 0..5 {
        let (result, _) = engine
            .execute(&workflow, json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.task("check").unwrap().error.clone().unwrap();
        assert_eq!(error.error_type, ErrorType::HttpError);
    }
    let breaker = circuits.breaker_for("127.0.0.1");
    assert_eq!(breaker.state(), CircuitState::Open);

    // The sixth invocation is rejected without touching the network.
    let (result, _) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    let error = result.task("check").unwrap().error.clone().unwrap();
    assert_eq!(error.error_type, ErrorType::CircuitOpen);
    assert!(!error.is_retryable);
    assert!(
        error.duration_until_error_ms < 100,
        "a rejected request fails immediately, took {}ms",
        error.duration_until_error_ms
    );

    // After the cool-off a success half-opens the circuit, another
    // closes it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let (result, _) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let (result, _) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_connection_refused_is_retryable_and_counted() {
    // Port 1 on localhost refuses connections.
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_task(http_task("dead", "GET", "http://127.0.0.1:1/unreachable"));

    let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default()));
    let engine = EngineBuilder::new()
        .with_definition_source(Arc::clone(&registry) as Arc<dyn DefinitionSource>)
        .with_circuit_registry(Arc::clone(&circuits))
        .build();

    let workflow = parse_workflow(
        r#"
name: unreachable
tasks:
  - id: ping
    taskRef: dead
    retry:
      maxAttempts: 2
      backoffMs: 10
"#,
    );

    let (result, _trace) = engine
        .execute(&workflow, json!({}), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.task("ping").unwrap().error.clone().unwrap();
    assert_eq!(error.error_type, ErrorType::NetworkError);
    assert!(error.is_retryable);
    assert_eq!(error.retry_attempts, 1);
    assert_eq!(result.task("ping").unwrap().status, TaskStatus::Failed);
}

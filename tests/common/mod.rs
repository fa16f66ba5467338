#![allow(dead_code)]

use serde_json::Value;
use shrike::circuit::CircuitRegistry;
use shrike::engine::{Engine, EngineBuilder};
use shrike::registry::{DefinitionSource, InMemoryRegistry};
use shrike::transform::{FnTransform, TransformEvaluator};
use shrike::workflow::{HttpTask, TaskKind, TransformTask, WorkflowDefinition, WorkflowTask};
use std::sync::Arc;

pub fn http_task(name: &str, method: &str, url: &str) -> WorkflowTask {
    WorkflowTask {
        name: name.to_string(),
        namespace: "default".to_string(),
        kind: TaskKind::Http(HttpTask {
            method: method.to_string(),
            url: url.to_string(),
            headers: indexmap::IndexMap::new(),
            body: None,
        }),
        input_schema: None,
        output_schema: None,
    }
}

pub fn websocket_task(name: &str, url: &str, request: Option<Value>) -> WorkflowTask {
    WorkflowTask {
        name: name.to_string(),
        namespace: "default".to_string(),
        kind: TaskKind::Websocket(shrike::workflow::WebSocketTask {
            url: url.to_string(),
            request,
        }),
        input_schema: None,
        output_schema: None,
    }
}

pub fn transform_task(name: &str, pipeline: &str) -> WorkflowTask {
    WorkflowTask {
        name: name.to_string(),
        namespace: "default".to_string(),
        kind: TaskKind::Transform(TransformTask {
            pipeline: serde_json::json!(pipeline),
        }),
        input_schema: None,
        output_schema: None,
    }
}

/// Test evaluator understanding two pipelines: "sum" adds integer
/// rows into one value, "echo" returns its input unchanged.
pub fn test_evaluator() -> Arc<dyn TransformEvaluator> {
    Arc::new(FnTransform(|pipeline: &Value, input: &[Value]| {
        match pipeline.as_str() {
            Some("sum") => Ok(vec![Value::from(
                input.iter().filter_map(Value::as_i64).sum::<i64>(),
            )]),
            Some("echo") => Ok(input.to_vec()),
            other => Err(format!("unknown pipeline: {other:?}")),
        }
    }))
}

pub fn engine_with(registry: Arc<InMemoryRegistry>) -> Engine {
    // A private circuit registry per engine keeps failure counts from
    // leaking between tests that share the mock server's host.
    EngineBuilder::new()
        .with_definition_source(registry as Arc<dyn DefinitionSource>)
        .with_transform_evaluator(test_evaluator())
        .with_circuit_registry(Arc::new(CircuitRegistry::default()))
        .build()
}

pub fn parse_workflow(yaml: &str) -> WorkflowDefinition {
    serde_yaml::from_str(yaml).expect("workflow fixture should parse")
}

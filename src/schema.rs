//! Schema validation.
//!
//! Workflow-level input schemas use a small recognized option set and
//! are checked at the edge before an execution starts; task-level
//! schemas are arbitrary JSON Schema documents compiled on demand.

use crate::workflow::InputSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of validating an invocation payload against a workflow's
/// input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl InputValidationResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            violations: Vec::new(),
        }
    }
}

/// Validate an invocation payload against a workflow input schema.
///
/// The recognized option set (`type`, per-property `type`/`required`/
/// `format`, top-level `required[]`) is lowered to a JSON Schema
/// document and compiled, so the semantics match task-level schemas.
pub fn validate_input(schema: &InputSchema, input: &Value) -> InputValidationResult {
    let document = lower_input_schema(schema);
    match validate_against(&document, input) {
        Ok(()) => InputValidationResult::ok(),
        Err(messages) => InputValidationResult {
            valid: false,
            violations: messages
                .into_iter()
                .map(|(field, message)| FieldViolation { field, message })
                .collect(),
        },
    }
}

fn lower_input_schema(schema: &InputSchema) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<String> = schema.required.clone();

    for (name, prop) in &schema.properties {
        let mut spec = serde_json::Map::new();
        if let Some(ty) = &prop.schema_type {
            spec.insert("type".to_string(), Value::String(ty.clone()));
        }
        if let Some(format) = &prop.format {
            spec.insert("format".to_string(), Value::String(format.clone()));
        }
        if prop.required && !required.contains(name) {
            required.push(name.clone());
        }
        properties.insert(name.clone(), Value::Object(spec));
    }

    let mut document = serde_json::Map::new();
    document.insert(
        "type".to_string(),
        Value::String(
            schema
                .schema_type
                .clone()
                .unwrap_or_else(|| "object".to_string()),
        ),
    );
    if !properties.is_empty() {
        document.insert("properties".to_string(), Value::Object(properties));
    }
    if !required.is_empty() {
        document.insert(
            "required".to_string(),
            Value::Array(required.into_iter().map(Value::String).collect()),
        );
    }
    Value::Object(document)
}

/// Validate an instance against an arbitrary JSON Schema document.
///
/// Returns the list of `(instance path, message)` pairs on failure. An
/// uncompilable schema is reported as a single violation at the root.
pub fn validate_against(
    schema: &Value,
    instance: &Value,
) -> std::result::Result<(), Vec<(String, String)>> {
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => {
            return Err(vec![(
                String::new(),
                format!("schema compilation failed: {e}"),
            )]);
        }
    };

    if let Err(errors) = compiled.validate(instance) {
        let messages: Vec<(String, String)> = errors
            .map(|e| (e.instance_path.to_string(), e.to_string()))
            .collect();
        return Err(messages);
    }
    Ok(())
}

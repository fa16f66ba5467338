//! Output mapping: produce the workflow's output document by
//! evaluating each output template against the final context.

use crate::context::ContextSnapshot;
use crate::template::{self, Template};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

/// Evaluate the output map. Keys whose expressions cannot resolve
/// because the upstream task never produced output are omitted; any
/// other template failure fails the mapping as a whole.
pub(super) fn map_output(
    output: &IndexMap<String, String>,
    snapshot: &ContextSnapshot,
) -> Result<Map<String, Value>, template::Error> {
    let mut doc = Map::new();
    for (key, expr) in output {
        let template = Template::parse(expr)?;
        match template.evaluate(snapshot) {
            Ok(value) => {
                doc.insert(key.clone(), value);
            }
            Err(template::Error::Unresolved { task, .. }) => {
                debug!(key = %key, task = %task, "output key dropped: upstream task produced no output");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, TaskEntry, TaskStatus};
    use chrono::Utc;
    use serde_json::json;

    fn context_with(entries: Vec<(&str, TaskStatus, Value)>) -> ExecutionContext {
        let ctx = ExecutionContext::new(
            json!({"region": "eu"}),
            IndexMap::new(),
            entries.iter().map(|(id, _, _)| id.to_string()).collect::<Vec<_>>(),
        );
        for (id, status, output) in entries {
            ctx.install(
                id,
                TaskEntry {
                    output,
                    status,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                    retry_count: 0,
                    error: None,
                },
            );
        }
        ctx
    }

    #[test]
    fn test_maps_resolved_keys() {
        let ctx = context_with(vec![("fetch", TaskStatus::Succeeded, json!({"name": "Ada"}))]);
        let mut output = IndexMap::new();
        output.insert("who".to_string(), "{{tasks.fetch.output.name}}".to_string());
        output.insert("where".to_string(), "{{input.region}}".to_string());

        let doc = map_output(&output, &ctx.snapshot()).unwrap();
        assert_eq!(doc.get("who"), Some(&json!("Ada")));
        assert_eq!(doc.get("where"), Some(&json!("eu")));
    }

    #[test]
    fn test_unresolved_keys_are_dropped() {
        let ctx = context_with(vec![
            ("done", TaskStatus::Succeeded, json!({"v": 1})),
            ("skipped", TaskStatus::Cancelled, Value::Null),
        ]);
        let mut output = IndexMap::new();
        output.insert("v".to_string(), "{{tasks.done.output.v}}".to_string());
        output.insert("gone".to_string(), "{{tasks.skipped.output.v}}".to_string());

        let doc = map_output(&output, &ctx.snapshot()).unwrap();
        assert_eq!(doc.get("v"), Some(&json!(1)));
        assert!(!doc.contains_key("gone"));
    }

    #[test]
    fn test_other_template_errors_fail_the_mapping() {
        let ctx = context_with(vec![("done", TaskStatus::Succeeded, json!({"v": 1}))]);
        let mut output = IndexMap::new();
        output.insert("bad".to_string(), "{{tasks.done.output.absent}}".to_string());

        assert!(map_output(&output, &ctx.snapshot()).is_err());
    }
}

//! Transform task execution: delegate to the configured evaluator.
//! No retry, no circuit; failures surface as transform errors.

use crate::context::{ContextSnapshot, ErrorInfo, ErrorType};
use crate::transform::TransformEvaluator;
use crate::workflow::TransformTask;
use serde_json::Value;

pub(super) fn run(
    evaluator: &dyn TransformEvaluator,
    def: &TransformTask,
    input: &ContextSnapshot,
) -> Result<Value, ErrorInfo> {
    let data = input
        .input
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ErrorInfo::new(
                ErrorType::TransformError,
                "transform input must carry a 'data' array".to_string(),
            )
            .with_code("MISSING_DATA")
        })?;

    let mut rows = evaluator.apply(&def.pipeline, data).map_err(|message| {
        ErrorInfo::new(ErrorType::TransformError, message).with_code("PIPELINE_FAILED")
    })?;

    // A single-row result is exposed as the value itself so templates
    // can address it without an index.
    Ok(if rows.len() == 1 {
        rows.remove(0)
    } else {
        Value::Array(rows)
    })
}

//! Seam for the external transform pipeline evaluator.
//!
//! The engine treats transforms as a pure function from a pipeline
//! definition and an input array to an output array; the DSL itself
//! lives outside this crate.

use serde_json::Value;

/// A pure, synchronous transform pipeline evaluator.
pub trait TransformEvaluator: Send + Sync {
    /// Apply `pipeline` to `input`, producing the output rows. Errors
    /// are reported as plain messages; the runner wraps them in its
    /// structured error record.
    fn apply(&self, pipeline: &Value, input: &[Value]) -> Result<Vec<Value>, String>;
}

/// Adapter turning a closure into an evaluator, mainly for embedders
/// and tests.
pub struct FnTransform<F>(pub F);

impl<F> TransformEvaluator for FnTransform<F>
where
    F: Fn(&Value, &[Value]) -> Result<Vec<Value>, String> + Send + Sync,
{
    fn apply(&self, pipeline: &Value, input: &[Value]) -> Result<Vec<Value>, String> {
        (self.0)(pipeline, input)
    }
}

/// Default evaluator when none is configured: every transform task
/// fails with a configuration message.
pub struct NoTransform;

impl TransformEvaluator for NoTransform {
    fn apply(&self, _pipeline: &Value, _input: &[Value]) -> Result<Vec<Value>, String> {
        Err("no transform evaluator is configured".to_string())
    }
}

//! Terminal-state persistence hook.
//!
//! Called once when an execution reaches a terminal state. The hook is
//! strictly best-effort: a missing or failing hook never fails the
//! execution.

use crate::execution::ExecutionResult;
use crate::trace::Trace;
use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Persistence error: {message}"))]
    Storage { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Persist a finished execution and its trace.
    async fn persist(&self, result: &ExecutionResult, trace: &Trace) -> Result<()>;
}

/// Default hook: discard everything.
pub struct NoopHook;

#[async_trait]
impl PersistenceHook for NoopHook {
    async fn persist(&self, _result: &ExecutionResult, _trace: &Trace) -> Result<()> {
        Ok(())
    }
}

/// Keeps finished executions in memory; for tests and embedders that
/// manage their own storage.
#[derive(Default)]
pub struct InMemoryHook {
    records: Mutex<Vec<(ExecutionResult, Trace)>>,
}

impl InMemoryHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<(ExecutionResult, Trace)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl PersistenceHook for InMemoryHook {
    async fn persist(&self, result: &ExecutionResult, trace: &Trace) -> Result<()> {
        self.records.lock().push((result.clone(), trace.clone()));
        Ok(())
    }
}

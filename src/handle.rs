//! Handle for observing and controlling a streaming execution.

use crate::execution::ExecutionResult;
use crate::trace::{ExecutionEvent, Trace};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Execution ended before a result was produced"))]
    ResultChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to an execution started with
/// [`Engine::execute_streaming`](crate::engine::Engine::execute_streaming).
///
/// Offers three capabilities: stream live events, cancel the
/// execution, and await the final result. Event delivery is
/// best-effort; a subscriber that falls behind loses events without
/// slowing the execution. Stop consuming once `WorkflowCompleted`
/// arrives.
pub struct ExecutionHandle {
    execution_id: String,
    events_tx: broadcast::Sender<ExecutionEvent>,
    events: broadcast::Receiver<ExecutionEvent>,
    cancel: Arc<watch::Sender<bool>>,
    result: oneshot::Receiver<(ExecutionResult, Trace)>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        execution_id: String,
        events_tx: broadcast::Sender<ExecutionEvent>,
        events: broadcast::Receiver<ExecutionEvent>,
        cancel: Arc<watch::Sender<bool>>,
        result: oneshot::Receiver<(ExecutionResult, Trace)>,
    ) -> Self {
        Self {
            execution_id,
            events_tx,
            events,
            cancel,
            result,
        }
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Next live event, skipping over any the subscriber was too slow
    /// to receive. Returns `None` once the stream closes.
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// An additional independent event subscription (e.g. one per
    /// WebSocket client at the edge).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events_tx.subscribe()
    }

    /// Cancel the execution. Cooperative: in-flight tasks observe the
    /// signal at their next suspension point and report `Cancelled`.
    pub fn abort(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the execution to reach a terminal state.
    ///
    /// # Errors
    /// Returns an error if the execution ended without producing a
    /// result (the driving future panicked or was dropped).
    pub async fn wait_for_result(self) -> Result<(ExecutionResult, Trace)> {
        self.result.await.map_err(|_| Error::ResultChannelClosed)
    }
}

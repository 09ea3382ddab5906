use crate::error::PoolError;
use crate::task::TaskOutcome;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing;

/// A handle to a task submitted with [`Pool::submit`](crate::Pool::submit).
///
/// There is no way to cancel a task through its handle; dropping the handle
/// only discards the result.
#[derive(Debug)]
pub struct TaskHandle {
  pub(crate) task_id: u64,
  pub(crate) result_receiver: Option<oneshot::Receiver<TaskOutcome>>,
}

impl TaskHandle {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Awaits the worker's reply for this task.
  ///
  /// # Errors
  /// Returns whatever the worker reported (`PoolError::TaskFailed`, including
  /// crashes), `PoolError::Spawn` if no worker could be started for it, or
  /// `PoolError::ResultChannelError` if the pool dropped the task's responder.
  pub async fn await_result(mut self) -> Result<Value, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(outcome) => outcome,
        Err(recv_error) => {
          tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Task (id: {}) result channel unexpectedly closed: {}",
            self.task_id, recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }
}

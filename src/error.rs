use thiserror::Error;

/// Errors that can occur within the `child_pool` scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  /// The worker reported an error for the task it was given, or the worker
  /// process crashed while holding the task.
  #[error("{message}")]
  TaskFailed {
    message: String,
    stack: Option<String>,
    fatal: bool,
  },

  #[error("Out of band data: {0}")]
  OutOfBandData(String),

  #[error("Failed to spawn worker process: {0}")]
  Spawn(String),

  #[error("Worker process input channel is closed")]
  ChannelClosed,

  #[error("Worker sent a message that could not be understood: {0}")]
  Protocol(String),

  #[error("Task result channel error (receiver side closed before a result arrived): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken or channel was not available")]
  ResultUnavailable,
}

impl PoolError {
  /// Returns `true` when the error caused the worker that produced it to be evicted.
  pub fn is_fatal(&self) -> bool {
    matches!(self, PoolError::TaskFailed { fatal: true, .. })
  }
}

use crate::error::PoolError;
use crate::pool::Pool;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

/// Outcome of one unit of work: the worker's data or the error it reported.
pub type TaskOutcome = Result<Value, PoolError>;

/// Completion callback supplied to [`Pool::send`]. Invoked exactly once.
pub type TaskCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// Where the outcome of a task goes once its worker replies.
pub(crate) enum Responder {
  Callback(TaskCallback),
  Handle(oneshot::Sender<TaskOutcome>),
  /// No one is waiting; failures are raised as pool events.
  Detached,
}

impl fmt::Debug for Responder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Responder::Callback(_) => f.write_str("Responder::Callback"),
      Responder::Handle(_) => f.write_str("Responder::Handle"),
      Responder::Detached => f.write_str("Responder::Detached"),
    }
  }
}

/// A task that admission control turned away, waiting in the global queue.
pub(crate) struct QueuedTask {
  pub(crate) pool: Arc<Pool>,
  pub(crate) message: Value,
  pub(crate) responder: Responder,
}

impl fmt::Debug for QueuedTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("pool", &self.pool.name())
      .field("responder", &self.responder)
      .finish_non_exhaustive()
  }
}

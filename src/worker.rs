use crate::process::ProcessHandle;
use crate::task::Responder;

use std::fmt;
use std::sync::Arc;

/// Lifecycle of a worker as seen by the scheduler.
///
/// `Idle --assign--> Busy`, `Busy --release--> Idle`, and any state goes to
/// `Dead` when the worker is evicted. A dead worker is never reassigned.
#[derive(Debug)]
pub(crate) enum WorkerState {
  Idle,
  Busy(Responder),
  Dead,
}

/// Scheduler-side record of one worker process and the task it holds.
pub(crate) struct Worker {
  pub(crate) id: u64,
  pub(crate) handle: Arc<dyn ProcessHandle>,
  state: WorkerState,
}

impl fmt::Debug for Worker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Worker")
      .field("id", &self.id)
      .field("pid", &self.handle.pid())
      .field("state", &self.state)
      .finish()
  }
}

impl Worker {
  pub(crate) fn new(id: u64, handle: Arc<dyn ProcessHandle>) -> Self {
    Self {
      id,
      handle,
      state: WorkerState::Idle,
    }
  }

  pub(crate) fn is_idle(&self) -> bool {
    matches!(self.state, WorkerState::Idle)
  }

  /// Hands the worker a task. Only idle workers accept work; a busy or dead
  /// worker gives the responder back.
  pub(crate) fn assign(&mut self, responder: Responder) -> Result<(), Responder> {
    match self.state {
      WorkerState::Idle => {
        self.state = WorkerState::Busy(responder);
        Ok(())
      }
      WorkerState::Busy(_) | WorkerState::Dead => Err(responder),
    }
  }

  /// Marks the worker idle again, returning the responder of the task it held.
  pub(crate) fn release(&mut self) -> Option<Responder> {
    match std::mem::replace(&mut self.state, WorkerState::Idle) {
      WorkerState::Busy(responder) => Some(responder),
      WorkerState::Idle => None,
      WorkerState::Dead => {
        self.state = WorkerState::Dead;
        None
      }
    }
  }

  /// Terminal transition. Returns the responder of any task still held.
  pub(crate) fn mark_dead(&mut self) -> Option<Responder> {
    match std::mem::replace(&mut self.state, WorkerState::Dead) {
      WorkerState::Busy(responder) => Some(responder),
      WorkerState::Idle | WorkerState::Dead => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::PoolError;
  use serde_json::Value;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[derive(Default)]
  struct NullProcess {
    killed: AtomicBool,
  }

  impl ProcessHandle for NullProcess {
    fn pid(&self) -> Option<u32> {
      None
    }

    fn send(&self, _message: &Value) -> Result<(), PoolError> {
      Ok(())
    }

    fn kill(&self) {
      self.killed.store(true, Ordering::SeqCst);
    }
  }

  fn worker() -> Worker {
    Worker::new(1, Arc::new(NullProcess::default()))
  }

  #[test]
  fn test_assign_then_release() {
    let mut w = worker();
    assert!(w.is_idle());
    w.assign(Responder::Detached).unwrap();
    assert!(!w.is_idle());
    assert!(matches!(w.release(), Some(Responder::Detached)));
    assert!(w.is_idle());
    assert!(w.release().is_none());
  }

  #[test]
  fn test_busy_worker_rejects_second_task() {
    let mut w = worker();
    w.assign(Responder::Detached).unwrap();
    assert!(w.assign(Responder::Detached).is_err());
  }

  #[test]
  fn test_dead_worker_stays_dead() {
    let mut w = worker();
    w.assign(Responder::Detached).unwrap();
    assert!(w.mark_dead().is_some());
    assert!(w.release().is_none());
    assert!(!w.is_idle());
    assert!(w.assign(Responder::Detached).is_err());
    assert!(w.mark_dead().is_none());
  }
}

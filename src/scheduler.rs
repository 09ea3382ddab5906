//! Process-wide admission control shared by every [`Pool`](crate::Pool).
//!
//! A [`Scheduler`] owns the global pending queue, the count of tasks currently
//! assigned to any worker, and the concurrency ceiling derived from the number
//! of cores. Pools created against the same scheduler compete for the same
//! budget, and work they cannot start right away waits in one shared FIFO.

use crate::task::QueuedTask;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::info;

lazy_static::lazy_static! {
  static ref GLOBAL_SCHEDULER: Arc<Scheduler> = Arc::new(Scheduler::with_available_parallelism());
}

/// State mutated only while holding the scheduler lock.
///
/// Dispatch and completion handling take this lock first and a pool's worker
/// lock second, never the other way around.
pub(crate) struct SchedulerState {
  pub(crate) pending: VecDeque<QueuedTask>,
  pub(crate) active_tasks: usize,
  pub(crate) total_workers_forked: u64,
}

/// Process-wide admission control and pending queue, shared by every pool
/// created against it.
pub struct Scheduler {
  core_count: usize,
  background: AtomicBool,
  state: Mutex<SchedulerState>,
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("core_count", &self.core_count)
      .field("background", &self.is_background())
      .field("active_tasks", &self.active_task_count())
      .field("queued_tasks", &self.queued_task_count())
      .finish()
  }
}

impl Scheduler {
  /// Creates a scheduler for a machine with `core_count` hardware threads.
  pub fn new(core_count: usize) -> Self {
    Self {
      core_count,
      background: AtomicBool::new(false),
      state: Mutex::new(SchedulerState {
        pending: VecDeque::new(),
        active_tasks: 0,
        total_workers_forked: 0,
      }),
    }
  }

  pub fn with_available_parallelism() -> Self {
    Self::new(available_cores())
  }

  /// The scheduler shared by every pool that was not given one explicitly.
  pub fn global() -> Arc<Scheduler> {
    GLOBAL_SCHEDULER.clone()
  }

  pub fn core_count(&self) -> usize {
    self.core_count
  }

  /// Leaves one core free for interactive work when `background` is set.
  pub fn set_background(&self, background: bool) {
    let previous = self.background.swap(background, AtomicOrdering::SeqCst);
    if previous != background {
      info!(background, ceiling = self.ceiling(), "Scheduler background mode changed.");
    }
  }

  pub fn is_background(&self) -> bool {
    self.background.load(AtomicOrdering::SeqCst)
  }

  /// Maximum number of tasks that may be active at once across all pools.
  ///
  /// At least two slots are assumed even on single-core machines so that one
  /// long task cannot starve everything else; background mode gives one back.
  pub fn ceiling(&self) -> usize {
    self.core_count.max(2) - usize::from(self.is_background())
  }

  /// Whether one more task may start while `active_tasks` are running.
  pub(crate) fn admits(&self, active_tasks: usize) -> bool {
    active_tasks + usize::from(self.is_background()) < self.core_count.max(2)
  }

  pub fn active_task_count(&self) -> usize {
    self.state.lock().active_tasks
  }

  /// Number of tasks waiting in the global queue.
  pub fn queued_task_count(&self) -> usize {
    self.state.lock().pending.len()
  }

  pub fn total_workers_forked(&self) -> u64 {
    self.state.lock().total_workers_forked
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
    self.state.lock()
  }
}

impl Default for Scheduler {
  fn default() -> Self {
    Self::with_available_parallelism()
  }
}

pub(crate) fn available_cores() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

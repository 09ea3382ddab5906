use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::notifier::{EventNotifier, PoolEvent};
use crate::process::{ProcessEvent, SpawnRequest, Spawner, StdoutSink};
use crate::protocol::{WorkerReply, SIGKILL};
use crate::scheduler::{available_cores, Scheduler, SchedulerState};
use crate::task::{QueuedTask, Responder, TaskOutcome};
use crate::worker::Worker;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fibre::mpsc::{AsyncReceiver, RecvError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Configuration for a [`Pool`].
#[derive(Clone)]
pub struct PoolOptions {
  /// Desired number of worker processes. Defaults to the number of cores.
  pub workers: usize,
  /// Advisory idle timeout. Accepted for callers that expect it; idle workers
  /// are never culled by the scheduler.
  pub keep_alive: Duration,
  /// Receives worker stdout lines that are not protocol messages.
  pub stdout: Option<StdoutSink>,
  /// Diagnostic tag used in logs and worker names.
  pub log_id: Option<String>,
}

impl Default for PoolOptions {
  fn default() -> Self {
    Self {
      workers: available_cores(),
      keep_alive: Duration::from_millis(500),
      stdout: None,
      log_id: None,
    }
  }
}

impl fmt::Debug for PoolOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolOptions")
      .field("workers", &self.workers)
      .field("keep_alive", &self.keep_alive)
      .field("has_stdout_sink", &self.stdout.is_some())
      .field("log_id", &self.log_id)
      .finish()
  }
}

impl PoolOptions {
  pub fn workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
    self.keep_alive = keep_alive;
    self
  }

  pub fn stdout(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.stdout = Some(Arc::new(sink));
    self
  }

  pub fn log_id(mut self, log_id: impl Into<String>) -> Self {
    self.log_id = Some(log_id.into());
    self
  }
}

struct PoolState {
  workers: Vec<Worker>,
  /// Never decremented; only used to name workers.
  workers_created: u64,
}

/// Result of trying to place a task on a worker while holding the scheduler lock.
enum Dispatch {
  Assigned,
  /// The global ceiling refused the task; no pool can take work.
  Saturated(Value, Responder),
  /// Only this pool is out of capacity.
  PoolFull(Value, Responder),
  Failed(Responder, PoolError),
}

/// What a completion or exit left behind once the locks were released.
struct Settled {
  responder: Option<Responder>,
  evicted: Option<Worker>,
  drained: Drained,
}

/// Work handed out while draining the queue under the scheduler lock.
#[derive(Default)]
struct Drained {
  failures: Vec<(Arc<Pool>, Responder, PoolError)>,
  /// Pools whose queued tasks were dispatched. Held so that none of them is
  /// dropped while the scheduler lock is still taken.
  dispatched: Vec<Arc<Pool>>,
}

/// A set of worker processes all running the same module.
///
/// Admission is decided by the [`Scheduler`] the pool was created with, which
/// may be shared with other pools.
///
/// Worker event loops only hold a weak reference, so dropping the last
/// `Arc<Pool>` kills the pool's workers. Tasks still waiting in the scheduler
/// queue keep their pool alive until they are dispatched.
pub struct Pool {
  pool_name: Arc<String>,
  module_spec: Value,
  options: PoolOptions,
  scheduler: Arc<Scheduler>,
  spawner: Arc<dyn Spawner>,
  state: Mutex<PoolState>,
  notifier: EventNotifier,
  tokio_handle: TokioHandle,
}

impl fmt::Debug for Pool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("name", &self.pool_name)
      .field("module_spec", &self.module_spec)
      .field("options", &self.options)
      .field("worker_count", &self.worker_count())
      .finish_non_exhaustive()
  }
}

impl Pool {
  pub fn new(
    scheduler: Arc<Scheduler>,
    spawner: Arc<dyn Spawner>,
    module_spec: Value,
    mut options: PoolOptions,
    tokio_handle: TokioHandle,
  ) -> Arc<Self> {
    options.workers = options.workers.max(1);
    let pool_name = Arc::new(match (&options.log_id, &module_spec) {
      (Some(log_id), _) => log_id.clone(),
      (None, Value::String(module)) => module.clone(),
      (None, other) => other.to_string(),
    });
    info!(pool_name = %*pool_name, workers = options.workers, "Creating worker pool.");

    Arc::new(Self {
      notifier: EventNotifier::new(tokio_handle.clone(), pool_name.clone()),
      pool_name,
      module_spec,
      options,
      scheduler,
      spawner,
      state: Mutex::new(PoolState {
        workers: Vec::new(),
        workers_created: 0,
      }),
      tokio_handle,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn module_spec(&self) -> &Value {
    &self.module_spec
  }

  pub fn options(&self) -> &PoolOptions {
    &self.options
  }

  pub fn scheduler(&self) -> &Arc<Scheduler> {
    &self.scheduler
  }

  /// Number of live workers currently in the pool.
  pub fn worker_count(&self) -> usize {
    self.state.lock().workers.len()
  }

  pub fn idle_worker_count(&self) -> usize {
    self.state.lock().workers.iter().filter(|w| w.is_idle()).count()
  }

  /// Total workers this pool has ever forked.
  pub fn workers_created(&self) -> u64 {
    self.state.lock().workers_created
  }

  /// Registers a handler for pool-level events such as out-of-band replies.
  pub fn on_event(&self, handler: impl Fn(PoolEvent) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Sends `message` to a worker and calls `callback` exactly once with its reply.
  ///
  /// If the global ceiling is reached, or this pool has no idle worker and no
  /// room to fork one, the task waits in the scheduler's FIFO queue.
  pub fn send<F>(self: &Arc<Self>, message: Value, callback: F)
  where
    F: FnOnce(TaskOutcome) + Send + 'static,
  {
    self.dispatch(message, Responder::Callback(Box::new(callback)));
  }

  /// Like [`send`](Self::send), returning a handle to await the reply on.
  pub fn submit(self: &Arc<Self>, message: Value) -> TaskHandle {
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (result_tx, result_rx) = oneshot::channel();
    trace!(pool_name = %*self.pool_name, %task_id, "Submitting task.");
    self.dispatch(message, Responder::Handle(result_tx));
    TaskHandle {
      task_id,
      result_receiver: Some(result_rx),
    }
  }

  /// Sends `message` without waiting for the reply. A failure is raised as
  /// [`PoolEvent::UnhandledFailure`] instead of being discarded.
  pub fn send_detached(self: &Arc<Self>, message: Value) {
    self.dispatch(message, Responder::Detached);
  }

  /// Broadcasts `message` to every worker in the pool, bypassing admission
  /// control. No reply is expected and no task is accounted for.
  pub fn send_all(&self, message: &Value) {
    let state = self.state.lock();
    debug!(pool_name = %*self.pool_name, workers = state.workers.len(), "Broadcasting message to all workers.");
    for worker in state.workers.iter() {
      if let Err(e) = worker.handle.send(message) {
        warn!(pool_name = %*self.pool_name, worker_id = worker.id, "Broadcast to worker failed: {}", e);
      }
    }
  }

  fn dispatch(self: &Arc<Self>, message: Value, responder: Responder) {
    let failed = {
      let mut sched = self.scheduler.lock();
      match self.dispatch_locked(&mut sched, message, responder) {
        Dispatch::Assigned => None,
        Dispatch::Saturated(message, responder) | Dispatch::PoolFull(message, responder) => {
          sched.pending.push_back(QueuedTask {
            pool: Arc::clone(self),
            message,
            responder,
          });
          debug!(
            pool_name = %*self.pool_name,
            queued = sched.pending.len(),
            active = sched.active_tasks,
            "No capacity for task; queued."
          );
          None
        }
        Dispatch::Failed(responder, error) => Some((responder, error)),
      }
    };

    // Never call back into the caller from inside `send`.
    if let Some((responder, error)) = failed {
      let pool = Arc::clone(self);
      self.tokio_handle.spawn(async move {
        pool.deliver(responder, Err(error)).await;
      });
    }
  }

  fn dispatch_locked(self: &Arc<Self>, sched: &mut SchedulerState, message: Value, responder: Responder) -> Dispatch {
    if !self.scheduler.admits(sched.active_tasks) {
      trace!(pool_name = %*self.pool_name, active = sched.active_tasks, "Global ceiling reached.");
      return Dispatch::Saturated(message, responder);
    }

    let mut state = self.state.lock();
    let idle = state.workers.iter().position(Worker::is_idle);
    let index = match idle {
      Some(index) => index,
      None if state.workers.len() < self.options.workers => match self.fork(sched, &mut state) {
        Ok(index) => index,
        Err(error) => {
          error!(pool_name = %*self.pool_name, "Failed to fork worker: {}", error);
          return Dispatch::Failed(responder, error);
        }
      },
      None => return Dispatch::PoolFull(message, responder),
    };

    let worker = &mut state.workers[index];
    if let Err(responder) = worker.assign(responder) {
      return Dispatch::PoolFull(message, responder);
    }
    sched.active_tasks += 1;
    debug!(
      pool_name = %*self.pool_name,
      worker_id = worker.id,
      active = sched.active_tasks,
      "Task assigned to worker."
    );
    if let Err(e) = worker.handle.send(&message) {
      // The exit event for this worker will fail the task.
      warn!(pool_name = %*self.pool_name, worker_id = worker.id, "Could not deliver task to worker: {}", e);
    }
    Dispatch::Assigned
  }

  /// Spawns a worker, hands it the module spec and starts listening to it.
  /// Returns the new worker's index in the pool.
  fn fork(self: &Arc<Self>, sched: &mut SchedulerState, state: &mut PoolState) -> Result<usize, PoolError> {
    sched.total_workers_forked += 1;
    state.workers_created += 1;
    let worker_id = sched.total_workers_forked;
    let request = SpawnRequest {
      pool_name: self.pool_name.clone(),
      log_id: self.options.log_id.clone(),
      pool_ordinal: state.workers_created,
      global_ordinal: worker_id,
      stdout: self.options.stdout.clone(),
    };

    let spawned = {
      let _runtime = self.tokio_handle.enter();
      self.spawner.spawn(&request)?
    };
    if let Err(e) = spawned.handle.send(&self.module_spec) {
      warn!(pool_name = %*self.pool_name, worker_id, "Could not send module spec to new worker: {}", e);
    }
    info!(
      pool_name = %*self.pool_name,
      worker_id,
      pid = ?spawned.handle.pid(),
      tag = %request.diagnostic_tag(),
      "Forked worker."
    );

    self.tokio_handle.spawn(
      Self::run_worker_events(Arc::downgrade(self), worker_id, spawned.events)
        .instrument(info_span!("worker_events", pool_name = %*self.pool_name, worker_id)),
    );
    state.workers.push(Worker::new(worker_id, spawned.handle));
    Ok(state.workers.len() - 1)
  }

  async fn run_worker_events(weak_pool: Weak<Self>, worker_id: u64, events: AsyncReceiver<ProcessEvent>) {
    loop {
      let event = match events.recv().await {
        Ok(event) => event,
        Err(RecvError::Disconnected) => {
          debug!("Worker event stream closed without an exit status.");
          ProcessEvent::Exited { code: None, signal: None }
        }
      };
      let Some(pool) = weak_pool.upgrade() else {
        debug!("Pool dropped; no longer observing worker.");
        break;
      };

      match event {
        ProcessEvent::Message(message) => {
          trace!("Message from worker.");
          if !pool.complete(worker_id, WorkerReply::from_message(message)).await {
            break;
          }
        }
        ProcessEvent::Error(message) => {
          error!("Worker process error: {}", message);
          pool.notifier.emit(PoolEvent::ProcessError { worker_id, message }).await;
        }
        ProcessEvent::Exited { code, signal } => {
          pool.handle_exit(worker_id, code, signal).await;
          break;
        }
      }
    }
    trace!("Worker event loop stopped.");
  }

  /// Handles one reply from a worker. Returns `false` once the worker is gone
  /// and its events should no longer be observed.
  async fn complete(self: &Arc<Self>, worker_id: u64, reply: WorkerReply) -> bool {
    let fatal = reply.fatal;
    let Some(settled) = self.settle(worker_id, fatal) else {
      debug!(worker_id, "Reply from a worker no longer in the pool; ignored.");
      return false;
    };

    if let Some(worker) = &settled.evicted {
      info!(pool_name = %*self.pool_name, worker_id, pid = ?worker.handle.pid(), "Killing worker after fatal reply.");
      worker.handle.kill();
    }
    Self::deliver_failures(settled.drained).await;

    match settled.responder {
      Some(responder) => self.deliver(responder, reply.into_outcome()).await,
      None => {
        let data = reply.data.clone();
        let error = match reply.into_outcome() {
          Err(error) => error,
          Ok(_) => PoolError::OutOfBandData(data.as_ref().map_or_else(|| "null".to_string(), Value::to_string)),
        };
        warn!(pool_name = %*self.pool_name, worker_id, "Worker replied with no task assigned.");
        self.notifier.emit(PoolEvent::OutOfBandData { worker_id, error, data }).await;
      }
    }
    !fatal
  }

  async fn handle_exit(self: &Arc<Self>, worker_id: u64, code: Option<i32>, signal: Option<i32>) {
    let Some(settled) = self.settle(worker_id, true) else {
      trace!(?code, ?signal, "Exit of a worker already evicted.");
      return;
    };
    Self::deliver_failures(settled.drained).await;

    let crashed = code.is_none() && signal != Some(SIGKILL);
    let reply = WorkerReply::unexpected_exit(code, signal);
    match settled.responder {
      Some(responder) => {
        error!(pool_name = %*self.pool_name, worker_id, ?code, ?signal, "Worker exited while running a task.");
        self.deliver(responder, reply.into_outcome()).await;
      }
      None if crashed => {
        error!(pool_name = %*self.pool_name, worker_id, ?signal, "Idle worker exited unexpectedly.");
        if let Err(error) = reply.into_outcome() {
          self.notifier.emit(PoolEvent::WorkerCrashed { worker_id, error }).await;
        }
      }
      None => {
        info!(pool_name = %*self.pool_name, worker_id, ?code, ?signal, "Idle worker exited; removed from pool.");
      }
    }
  }

  /// Frees the worker's task slot, optionally evicting the worker, and hands
  /// queued work to whatever capacity that opened up. Returns `None` if the
  /// worker is no longer part of the pool.
  fn settle(self: &Arc<Self>, worker_id: u64, evict: bool) -> Option<Settled> {
    let mut sched = self.scheduler.lock();
    let (responder, evicted) = {
      let mut state = self.state.lock();
      let index = state.workers.iter().position(|w| w.id == worker_id)?;
      if evict {
        let mut worker = state.workers.remove(index);
        (worker.mark_dead(), Some(worker))
      } else {
        (state.workers[index].release(), None)
      }
    };
    if responder.is_some() {
      sched.active_tasks = sched.active_tasks.saturating_sub(1);
    }
    let drained = Self::drain_queue(&mut sched);
    Some(Settled {
      responder,
      evicted,
      drained,
    })
  }

  /// Dispatches queued tasks in FIFO order until the global ceiling is hit.
  ///
  /// A task whose own pool is full keeps its place, and so does every later
  /// task of that pool, while tasks behind it from other pools still run.
  fn drain_queue(sched: &mut SchedulerState) -> Drained {
    let mut drained = Drained::default();
    let mut full_pools: Vec<Arc<Pool>> = Vec::new();
    let mut index = 0;
    while index < sched.pending.len() {
      let blocked = full_pools.iter().any(|full| Arc::ptr_eq(full, &sched.pending[index].pool));
      if blocked {
        index += 1;
        continue;
      }
      let Some(QueuedTask {
        pool,
        message,
        responder,
      }) = sched.pending.remove(index)
      else {
        break;
      };

      match pool.dispatch_locked(sched, message, responder) {
        Dispatch::Assigned => {
          trace!(pool_name = %*pool.pool_name, remaining = sched.pending.len(), "Dequeued task dispatched.");
          drained.dispatched.push(pool);
        }
        Dispatch::Failed(responder, error) => drained.failures.push((pool, responder, error)),
        Dispatch::PoolFull(message, responder) => {
          trace!(pool_name = %*pool.pool_name, position = index, "Pool full; queued task keeps its place.");
          full_pools.push(Arc::clone(&pool));
          sched.pending.insert(
            index,
            QueuedTask {
              pool,
              message,
              responder,
            },
          );
          index += 1;
        }
        Dispatch::Saturated(message, responder) => {
          sched.pending.insert(
            index,
            QueuedTask {
              pool,
              message,
              responder,
            },
          );
          break;
        }
      }
    }
    drained
  }

  async fn deliver_failures(drained: Drained) {
    if !drained.dispatched.is_empty() {
      trace!(dispatched = drained.dispatched.len(), "Queued tasks handed to workers.");
    }
    for (pool, responder, error) in drained.failures {
      pool.deliver(responder, Err(error)).await;
    }
  }

  async fn deliver(&self, responder: Responder, outcome: TaskOutcome) {
    match responder {
      Responder::Callback(callback) => {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
          error!(pool_name = %*self.pool_name, "Task callback panicked.");
        }
      }
      Responder::Handle(result_tx) => {
        if result_tx.send(outcome).is_err() {
          warn!(pool_name = %*self.pool_name, "Result receiver for task was dropped. Task outcome lost.");
        }
      }
      Responder::Detached => match outcome {
        Ok(_) => trace!(pool_name = %*self.pool_name, "Detached task completed."),
        Err(error) => self.notifier.emit(PoolEvent::UnhandledFailure { error }).await,
      },
    }
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    let workers = std::mem::take(&mut self.state.get_mut().workers);
    if workers.is_empty() {
      return;
    }
    info!(
      pool_name = %*self.pool_name,
      workers = workers.len(),
      "Pool dropped. Killing its remaining workers."
    );

    let mut abandoned = 0;
    for mut worker in workers {
      if worker.mark_dead().is_some() {
        abandoned += 1;
      }
      worker.handle.kill();
    }
    if abandoned == 0 {
      return;
    }

    // In-flight tasks of this pool are dropped with it; free their slots for
    // tasks queued by other pools.
    let drained = {
      let mut sched = self.scheduler.lock();
      sched.active_tasks = sched.active_tasks.saturating_sub(abandoned);
      Self::drain_queue(&mut sched)
    };
    if !drained.failures.is_empty() {
      self.tokio_handle.spawn(Self::deliver_failures(drained));
    }
  }
}

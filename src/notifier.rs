use crate::error::PoolError;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Once, RwLock};
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Pool-level anomalies that have no task callback to be delivered to.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
  /// A worker replied while it had no task assigned.
  OutOfBandData {
    worker_id: u64,
    error: PoolError,
    data: Option<Value>,
  },
  /// The process layer reported an error for a worker. The worker is not evicted for it.
  ProcessError { worker_id: u64, message: String },
  /// A worker with no task assigned died abnormally and was evicted.
  WorkerCrashed { worker_id: u64, error: PoolError },
  /// A task submitted with `send_detached` failed.
  UnhandledFailure { error: PoolError },
}

type EventHandler = Arc<dyn Fn(PoolEvent) + Send + Sync + 'static>;

pub(crate) struct EventNotifier {
  handlers: Arc<RwLock<Vec<EventHandler>>>,
  init_once: Once,
  event_tx: AsyncSender<PoolEvent>,
  rx_for_init: StdMutex<Option<AsyncReceiver<PoolEvent>>>,
  tokio_handle: TokioHandle,
  pool_name: Arc<String>,
}

impl fmt::Debug for EventNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("EventNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish()
  }
}

impl EventNotifier {
  pub(crate) fn new(tokio_handle: TokioHandle, pool_name: Arc<String>) -> Self {
    let (event_tx, event_rx) = mpsc::unbounded_async();
    Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      event_tx,
      rx_for_init: StdMutex::new(Some(event_rx)),
      tokio_handle,
      pool_name,
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let rx = self.rx_for_init.lock().ok().and_then(|mut guard| guard.take());
      match rx {
        Some(rx) => {
          info!(pool_name = %*self.pool_name, "First event handler added. Starting event dispatch loop.");
          self.tokio_handle.spawn(
            Self::run_dispatch_loop(rx, self.handlers.clone(), self.tokio_handle.clone())
              .instrument(info_span!("pool_event_loop", pool_name = %*self.pool_name)),
          );
        }
        None => warn!(pool_name = %*self.pool_name, "Event receiver already taken; dispatch loop not started."),
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(PoolEvent) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    match self.handlers.write() {
      Ok(mut handlers) => {
        handlers.push(Arc::new(handler));
        info!(pool_name = %*self.pool_name, "Added pool event handler. Total handlers: {}", handlers.len());
      }
      Err(_) => error!(pool_name = %*self.pool_name, "Event handler list poisoned; handler not added."),
    }
  }

  fn has_handlers(&self) -> bool {
    self.handlers.read().map_or(false, |handlers| !handlers.is_empty())
  }

  /// Raises `event` to registered handlers, or logs it when nobody is listening.
  pub(crate) async fn emit(&self, event: PoolEvent) {
    if !self.has_handlers() {
      warn!(pool_name = %*self.pool_name, ?event, "Pool event raised with no handler registered.");
      return;
    }
    if self.event_tx.send(event).await.is_err() {
      error!(pool_name = %*self.pool_name, "Pool event loop is gone; event dropped.");
    }
  }

  async fn run_dispatch_loop(
    event_rx: AsyncReceiver<PoolEvent>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    tokio_handle: TokioHandle,
  ) {
    loop {
      match event_rx.recv().await {
        Ok(event) => {
          let handlers_snapshot: Vec<EventHandler> = match handlers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
              error!("Event handler list poisoned; dropping event.");
              continue;
            }
          };
          debug!(?event, "Dispatching pool event to {} handlers.", handlers_snapshot.len());

          for handler in handlers_snapshot {
            let event = event.clone();
            tokio_handle.spawn(async move {
              let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
              if result.is_err() {
                error!("A pool event handler panicked.");
              }
            });
          }
        }
        Err(RecvError::Disconnected) => {
          trace!("Pool event channel closed.");
          break;
        }
      }
    }
    info!("Pool event loop stopped.");
  }
}

//! A Tokio-based scheduler that distributes work across pools of child
//! worker processes, with a process-wide concurrency ceiling, a shared FIFO
//! queue, and recovery from worker crashes.

mod error;
mod handle;
mod notifier;
mod pool;
mod process;
mod protocol;
mod scheduler;
mod task;
mod worker;

pub use error::PoolError;
pub use handle::TaskHandle;
pub use notifier::PoolEvent;
pub use pool::{Pool, PoolOptions};
pub use process::{
  CommandSpawner, ProcessEvent, ProcessHandle, SpawnRequest, SpawnedProcess, Spawner, StdoutSink, WORKER_TAG_ENV,
};
pub use protocol::{WorkerReply, SIGKILL};
pub use scheduler::Scheduler;
pub use task::{TaskCallback, TaskOutcome};

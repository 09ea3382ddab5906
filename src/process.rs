//! The boundary between the scheduler and the operating system.
//!
//! The scheduler only ever talks to worker processes through [`Spawner`] and
//! [`ProcessHandle`]. [`CommandSpawner`] is the stock implementation: it runs a
//! program with piped stdio and speaks newline-delimited JSON over it.

use crate::error::PoolError;

use std::ffi::OsString;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Environment variable through which `CommandSpawner` tells a worker its diagnostic tag.
pub const WORKER_TAG_ENV: &str = "CHILD_POOL_WORKER_TAG";

/// Receives lines a worker writes to stdout that are not protocol messages.
pub type StdoutSink = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Something that happened to a worker process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
  /// The worker sent a structured message.
  Message(Value),
  /// The process terminated. `code` is `None` when it was terminated by `signal`.
  Exited { code: Option<i32>, signal: Option<i32> },
  /// A spawn or runtime error on the process. Does not imply the process is gone.
  Error(String),
}

/// A live worker process.
pub trait ProcessHandle: Send + Sync {
  fn pid(&self) -> Option<u32>;

  /// Queues `message` for delivery to the process. Never blocks.
  fn send(&self, message: &Value) -> Result<(), PoolError>;

  /// Forcibly terminates the process.
  fn kill(&self);
}

/// A freshly spawned process together with its event stream.
pub struct SpawnedProcess {
  pub handle: Arc<dyn ProcessHandle>,
  pub events: AsyncReceiver<ProcessEvent>,
}

impl fmt::Debug for SpawnedProcess {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SpawnedProcess")
      .field("pid", &self.handle.pid())
      .finish_non_exhaustive()
  }
}

/// Everything a spawner is told about the worker it is asked to create.
#[derive(Clone)]
pub struct SpawnRequest {
  pub pool_name: Arc<String>,
  pub log_id: Option<String>,
  /// 1-based count of workers this pool has created, including this one.
  pub pool_ordinal: u64,
  /// 1-based count of workers forked in the whole process, including this one.
  pub global_ordinal: u64,
  pub stdout: Option<StdoutSink>,
}

impl SpawnRequest {
  /// A name distinguishing this worker in diagnostics such as profiling log files.
  pub fn diagnostic_tag(&self) -> String {
    match &self.log_id {
      Some(log_id) => format!("{}.{}", log_id, self.pool_ordinal),
      None => self.global_ordinal.to_string(),
    }
  }
}

impl fmt::Debug for SpawnRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SpawnRequest")
      .field("pool_name", &self.pool_name)
      .field("log_id", &self.log_id)
      .field("pool_ordinal", &self.pool_ordinal)
      .field("global_ordinal", &self.global_ordinal)
      .field("has_stdout_sink", &self.stdout.is_some())
      .finish()
  }
}

/// Creates worker processes. Called from within the pool's Tokio runtime context.
pub trait Spawner: Send + Sync {
  fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PoolError>;
}

/// Spawns `program` with piped stdin/stdout and exchanges one JSON object per line.
///
/// Stdout lines that are not JSON objects go to the request's stdout sink, if any.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
  program: OsString,
  args: Vec<OsString>,
  envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
  pub fn new(program: impl Into<OsString>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      envs: Vec::new(),
    }
  }

  pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
    self.envs.push((key.into(), value.into()));
    self
  }
}

impl Spawner for CommandSpawner {
  fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, PoolError> {
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .envs(self.envs.iter().map(|(k, v)| (k, v)))
      .env(WORKER_TAG_ENV, request.diagnostic_tag())
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| PoolError::Spawn(format!("{:?}: {}", self.program, e)))?;

    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| PoolError::Spawn("Failed to capture worker stdin".to_string()))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| PoolError::Spawn("Failed to capture worker stdout".to_string()))?;
    let pid = child.id();
    debug!(pool_name = %*request.pool_name, ?pid, tag = %request.diagnostic_tag(), "Spawned worker process.");

    let (events_tx, events_rx) = mpsc::unbounded_async();
    let (input_tx, input_rx) = unbounded_channel();
    let kill_token = CancellationToken::new();

    tokio::spawn(write_input(stdin, input_rx, events_tx.clone()));
    let reader = tokio::spawn(read_output(stdout, events_tx.clone(), request.stdout.clone()));
    tokio::spawn(wait_for_exit(child, kill_token.clone(), reader, events_tx));

    Ok(SpawnedProcess {
      handle: Arc::new(CommandProcess {
        pid,
        input: input_tx,
        kill_token,
      }),
      events: events_rx,
    })
  }
}

struct CommandProcess {
  pid: Option<u32>,
  input: UnboundedSender<String>,
  kill_token: CancellationToken,
}

impl ProcessHandle for CommandProcess {
  fn pid(&self) -> Option<u32> {
    self.pid
  }

  fn send(&self, message: &Value) -> Result<(), PoolError> {
    let line = serde_json::to_string(message).map_err(|e| PoolError::Protocol(e.to_string()))?;
    self.input.send(line).map_err(|_| PoolError::ChannelClosed)
  }

  fn kill(&self) {
    trace!(pid = ?self.pid, "Kill requested for worker process.");
    self.kill_token.cancel();
  }
}

async fn write_input(
  mut stdin: ChildStdin,
  mut input_rx: UnboundedReceiver<String>,
  events_tx: AsyncSender<ProcessEvent>,
) {
  while let Some(line) = input_rx.recv().await {
    let written = async {
      stdin.write_all(line.as_bytes()).await?;
      stdin.write_all(b"\n").await?;
      stdin.flush().await
    }
    .await;
    if let Err(e) = written {
      warn!("Failed writing to worker stdin: {}", e);
      let _ = events_tx.send(ProcessEvent::Error(format!("stdin write failed: {}", e))).await;
      break;
    }
  }
}

async fn read_output(stdout: ChildStdout, events_tx: AsyncSender<ProcessEvent>, sink: Option<StdoutSink>) {
  let mut lines = BufReader::new(stdout).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
        Ok(message) if message.is_object() => {
          if events_tx.send(ProcessEvent::Message(message)).await.is_err() {
            trace!("Worker event receiver dropped; discarding remaining output.");
            break;
          }
        }
        _ => match &sink {
          Some(sink) => sink(&line),
          None => trace!(line = %line, "Worker stdout"),
        },
      },
      Ok(None) => break,
      Err(e) => {
        let _ = events_tx.send(ProcessEvent::Error(format!("stdout read failed: {}", e))).await;
        break;
      }
    }
  }
}

async fn wait_for_exit(
  mut child: Child,
  kill_token: CancellationToken,
  reader: JoinHandle<()>,
  events_tx: AsyncSender<ProcessEvent>,
) {
  let exited = tokio::select! {
    biased;
    _ = kill_token.cancelled() => None,
    status = child.wait() => Some(status),
  };
  let status = match exited {
    Some(status) => status,
    None => {
      if let Err(e) = child.start_kill() {
        warn!("Failed to kill worker process: {}", e);
      }
      child.wait().await
    }
  };

  // Replies written just before exiting must be delivered ahead of the exit.
  if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
    debug!("Worker stdout still open after exit; not waiting for it any longer.");
  }

  let event = match status {
    Ok(status) => ProcessEvent::Exited {
      code: status.code(),
      signal: exit_signal(&status),
    },
    Err(e) => {
      error!("Failed to wait on worker process: {}", e);
      ProcessEvent::Exited { code: None, signal: None }
    }
  };
  let _ = events_tx.send(event).await;
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
  use std::os::unix::process::ExitStatusExt;
  status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
  None
}

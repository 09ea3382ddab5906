//! Message shapes exchanged with worker processes.
//!
//! The scheduler sends the pool's module spec as the first message to every
//! freshly spawned worker, followed by opaque task payloads. Workers answer
//! each task with exactly one [`WorkerReply`].

use crate::error::PoolError;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reply from a worker process for the task it currently holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub err: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
  /// Instructs the scheduler to kill and discard the worker.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub fatal: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl WorkerReply {
  pub fn success(data: Value) -> Self {
    Self {
      data: Some(data),
      ..Self::default()
    }
  }

  pub fn failure(err: impl Into<String>, stack: Option<String>, fatal: bool) -> Self {
    Self {
      err: Some(err.into()),
      stack,
      fatal,
      data: None,
    }
  }

  /// The reply synthesized on behalf of a worker whose process died on its own.
  pub fn unexpected_exit(code: Option<i32>, signal: Option<i32>) -> Self {
    let signal_desc = signal.map_or_else(|| "null".to_string(), signal_name);
    let message = match code {
      Some(code) => format!("Worker exited unexpectedly, signal {} (code {})", signal_desc, code),
      None => format!("Worker exited unexpectedly, signal {}", signal_desc),
    };
    Self::failure(message, None, true)
  }

  /// Interprets a raw message received from a worker.
  ///
  /// Anything that is not an object shaped like a reply is treated as bare data.
  pub fn from_message(message: Value) -> Self {
    if message.is_object() {
      match serde_json::from_value::<WorkerReply>(message.clone()) {
        Ok(reply) => return reply,
        Err(e) => tracing::warn!("Worker reply did not match the reply shape, treating as data: {}", e),
      }
    }
    Self::success(message)
  }

  /// Splits the reply into the outcome delivered to the task's responder.
  pub fn into_outcome(self) -> Result<Value, PoolError> {
    match self.err {
      Some(message) => Err(PoolError::TaskFailed {
        message,
        stack: self.stack,
        fatal: self.fatal,
      }),
      None => Ok(self.data.unwrap_or(Value::Null)),
    }
  }
}

/// Signal number the scheduler itself uses to terminate workers.
pub const SIGKILL: i32 = 9;

pub(crate) fn signal_name(signal: i32) -> String {
  match signal {
    1 => "SIGHUP".to_string(),
    2 => "SIGINT".to_string(),
    6 => "SIGABRT".to_string(),
    SIGKILL => "SIGKILL".to_string(),
    11 => "SIGSEGV".to_string(),
    13 => "SIGPIPE".to_string(),
    15 => "SIGTERM".to_string(),
    other => other.to_string(),
  }
}

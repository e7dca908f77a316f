use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type returned by background computations.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A background failure coerced into one of the known categories.
///
/// A failure is never left without a description: anything that carries no
/// discoverable cause (an error with an empty message, a panic with a
/// non-string payload, a job that was dropped before it could run) becomes
/// [`Failure::Unknown`].
#[derive(Error, Debug, Clone)]
pub enum Failure {
  /// The computation failed with an identifiable cause.
  #[error(transparent)]
  Declared(Arc<dyn StdError + Send + Sync + 'static>),

  /// The background unit died without leaving a cause behind.
  #[error("background process failed without a discoverable cause")]
  Unknown,
}

impl Failure {
  /// Normalizes an error returned by a computation. Errors with a blank
  /// message and no source become [`Failure::Unknown`].
  pub fn normalize(error: BoxError) -> Self {
    if error.to_string().trim().is_empty() && error.source().is_none() {
      return Failure::Unknown;
    }
    Failure::Declared(Arc::from(error))
  }

  /// Normalizes a panic payload caught at the execution boundary.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      Some((*s).to_string())
    } else {
      payload.downcast_ref::<String>().cloned()
    };

    match message {
      Some(message) if !message.trim().is_empty() => Failure::Declared(Arc::new(PanicError { message })),
      _ => Failure::Unknown,
    }
  }

  pub fn is_unknown(&self) -> bool {
    matches!(self, Failure::Unknown)
  }

  /// The underlying cause, if one was recorded.
  pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
    match self {
      Failure::Declared(cause) => Some(cause.as_ref()),
      Failure::Unknown => None,
    }
  }

  /// Attempts to view the cause as a concrete error type.
  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    self.cause().and_then(|cause| cause.downcast_ref::<E>())
  }

  pub fn as_label(&self) -> &'static str {
    match self {
      Failure::Declared(_) => "failure_declared",
      Failure::Unknown => "failure_unknown",
    }
  }
}

/// Cause recorded for a computation that panicked with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicError {
  message: String,
}

impl PanicError {
  pub fn message(&self) -> &str {
    &self.message
  }
}

impl fmt::Display for PanicError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "background computation panicked: {}", self.message)
  }
}

impl StdError for PanicError {}

/// Errors surfaced by the pool, result futures and task runners.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  #[error("Task execution failed: {0}")]
  Execution(#[source] Failure),

  #[error("Timed out after {0:?} waiting for the task outcome")]
  Timeout(Duration),

  #[error("Outcome of task {task_id} was already published")]
  AlreadyPublished { task_id: u64 },

  #[error("Task was interrupted by a cancellation request")]
  Interrupted,

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Failed to build the pool runtime: {0}")]
  PoolBuild(String),

  #[error("Operation is only permitted on the UI thread")]
  NotOnUiThread,

  #[error("UI event loop is no longer accepting jobs")]
  UiClosed,

  #[error("Task has not been executed yet")]
  NotStarted,
}

impl TaskError {
  /// Returns a short stable label for use in logs.
  pub fn as_label(&self) -> &'static str {
    match self {
      TaskError::Execution(_) => "task_execution_failed",
      TaskError::Timeout(_) => "task_timeout",
      TaskError::AlreadyPublished { .. } => "task_already_published",
      TaskError::Interrupted => "task_interrupted",
      TaskError::PoolShuttingDown => "pool_shutting_down",
      TaskError::PoolBuild(_) => "pool_build_failed",
      TaskError::NotOnUiThread => "not_on_ui_thread",
      TaskError::UiClosed => "ui_closed",
      TaskError::NotStarted => "task_not_started",
    }
  }

  /// The normalized failure, when this error wraps one.
  pub fn failure(&self) -> Option<&Failure> {
    match self {
      TaskError::Execution(failure) => Some(failure),
      _ => None,
    }
  }
}

/// Failure rethrown on the initiating thread once an [`AsyncProcess`](crate::AsyncProcess)
/// indicator has been dismissed.
#[derive(Error, Debug)]
pub enum AsyncProcessError {
  #[error("Async process failed: {0}")]
  Failed(#[source] Failure),

  #[error("Async process could not be started: {0}")]
  Start(#[from] TaskError),
}

impl AsyncProcessError {
  pub fn as_label(&self) -> &'static str {
    match self {
      AsyncProcessError::Failed(_) => "async_process_failed",
      AsyncProcessError::Start(_) => "async_process_start_failed",
    }
  }

  pub fn failure(&self) -> Option<&Failure> {
    match self {
      AsyncProcessError::Failed(failure) => Some(failure),
      AsyncProcessError::Start(_) => None,
    }
  }
}

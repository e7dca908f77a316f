use crate::error::{Failure, TaskError};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Continuation<T> = Box<dyn FnOnce(&ResultFuture<T>) + Send + 'static>;

/// A snapshot of a terminal task outcome.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
  Done(T),
  Failed(Failure),
  Cancelled,
}

impl<T> Outcome<T> {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Outcome::Cancelled)
  }

  /// Converts into the shape returned by [`ResultFuture::get`].
  pub fn into_result(self) -> Result<Option<T>, TaskError> {
    match self {
      Outcome::Done(value) => Ok(Some(value)),
      Outcome::Cancelled => Ok(None),
      Outcome::Failed(failure) => Err(TaskError::Execution(failure)),
    }
  }
}

enum State<T> {
  Pending,
  Terminal(Outcome<T>),
}

struct Slot<T> {
  state: State<T>,
  continuations: Vec<Continuation<T>>,
}

struct Shared<T> {
  task_id: u64,
  slot: Mutex<Slot<T>>,
  published: Condvar,
  token: CancellationToken,
}

/// Single-assignment handle to the eventual outcome of one task invocation.
///
/// Clones share the same state: one producer publishes the outcome exactly
/// once and any number of observers may block on [`get`](Self::get).
pub struct ResultFuture<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for ResultFuture<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T> fmt::Debug for ResultFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match &self.shared.slot.lock().state {
      State::Pending => "pending",
      State::Terminal(Outcome::Done(_)) => "done",
      State::Terminal(Outcome::Failed(_)) => "failed",
      State::Terminal(Outcome::Cancelled) => "cancelled",
    };
    f.debug_struct("ResultFuture")
      .field("task_id", &self.shared.task_id)
      .field("state", &state)
      .finish()
  }
}

impl<T: Send + 'static> ResultFuture<T> {
  /// Creates a pending future with its own cancellation token.
  pub fn new(task_id: u64) -> Self {
    Self::with_token(task_id, CancellationToken::new())
  }

  pub(crate) fn with_token(task_id: u64, token: CancellationToken) -> Self {
    Self {
      shared: Arc::new(Shared {
        task_id,
        slot: Mutex::new(Slot {
          state: State::Pending,
          continuations: Vec::new(),
        }),
        published: Condvar::new(),
        token,
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.shared.task_id
  }

  /// The token the running computation observes for cooperative cancellation.
  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.shared.token
  }

  /// `true` once any terminal outcome (value, failure or cancellation) is set.
  pub fn is_done(&self) -> bool {
    matches!(self.shared.slot.lock().state, State::Terminal(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.shared.slot.lock().state, State::Terminal(Outcome::Cancelled))
  }

  /// Publishes a value.
  pub fn complete(&self, value: T) -> Result<(), TaskError> {
    self.publish(Outcome::Done(value))
  }

  /// Publishes a failure.
  pub fn fail(&self, failure: Failure) -> Result<(), TaskError> {
    self.publish(Outcome::Failed(failure))
  }

  /// Publishes the cancelled state without touching the token.
  pub fn mark_cancelled(&self) -> Result<(), TaskError> {
    self.publish(Outcome::Cancelled)
  }

  /// Requests interruption of the computation and, if no outcome has been
  /// published yet, publishes the cancelled state.
  ///
  /// Repeated calls are no-ops. Returns `true` if this call published.
  pub fn cancel(&self) -> bool {
    self.shared.token.cancel();
    match self.mark_cancelled() {
      Ok(()) => {
        debug!(task_id = %self.shared.task_id, "ResultFuture: cancellation published.");
        true
      }
      Err(_) => {
        trace!(task_id = %self.shared.task_id, "ResultFuture: cancel ignored, outcome already published.");
        false
      }
    }
  }

  /// Registers a continuation run exactly once by the thread that publishes
  /// the outcome, or right away on the caller's thread if already terminal.
  pub fn on_complete(&self, continuation: impl FnOnce(&ResultFuture<T>) + Send + 'static) {
    let mut slot = self.shared.slot.lock();
    if let State::Pending = slot.state {
      slot.continuations.push(Box::new(continuation));
      return;
    }
    drop(slot);
    continuation(self);
  }

  fn publish(&self, outcome: Outcome<T>) -> Result<(), TaskError> {
    let continuations = {
      let mut slot = self.shared.slot.lock();
      if let State::Terminal(_) = slot.state {
        return Err(TaskError::AlreadyPublished {
          task_id: self.shared.task_id,
        });
      }
      slot.state = State::Terminal(outcome);
      std::mem::take(&mut slot.continuations)
    };
    self.shared.published.notify_all();

    for continuation in continuations {
      continuation(self);
    }
    Ok(())
  }
}

impl<T: Clone + Send + 'static> ResultFuture<T> {
  /// Blocks until the outcome is published.
  ///
  /// Returns `Ok(Some(value))` on success, `Ok(None)` if the task was
  /// cancelled, and [`TaskError::Execution`] if the computation failed.
  /// Subsequent calls return the same outcome.
  pub fn get(&self) -> Result<Option<T>, TaskError> {
    let mut slot = self.shared.slot.lock();
    loop {
      if let State::Terminal(outcome) = &slot.state {
        return outcome.clone().into_result();
      }
      self.shared.published.wait(&mut slot);
    }
  }

  /// As [`get`](Self::get), bounded by `timeout`.
  ///
  /// A timeout leaves the task untouched; cancel it explicitly to abandon it.
  /// Timeouts too large to express as a deadline wait without bound.
  pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, TaskError> {
    let Some(deadline) = Instant::now().checked_add(timeout) else {
      return self.get();
    };
    let mut slot = self.shared.slot.lock();
    loop {
      if let State::Terminal(outcome) = &slot.state {
        return outcome.clone().into_result();
      }
      if self.shared.published.wait_until(&mut slot, deadline).timed_out() {
        if let State::Terminal(outcome) = &slot.state {
          return outcome.clone().into_result();
        }
        trace!(task_id = %self.shared.task_id, ?timeout, "ResultFuture: get timed out.");
        return Err(TaskError::Timeout(timeout));
      }
    }
  }

  /// Non-blocking peek at the outcome.
  pub fn outcome(&self) -> Option<Outcome<T>> {
    match &self.shared.slot.lock().state {
      State::Pending => None,
      State::Terminal(outcome) => Some(outcome.clone()),
    }
  }
}

use crate::error::TaskError;
use crate::indicator::IndicatorSlot;

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Routes progress updates from a computation to the indicator of its
/// invocation, through the UI thread.
#[derive(Clone)]
pub(crate) struct ProgressLink {
  pub(crate) slot: IndicatorSlot,
  pub(crate) step: u32,
  pub(crate) indeterminate: bool,
}

impl ProgressLink {
  fn post(&self, update: impl FnOnce(&IndicatorSlot) -> Result<(), TaskError> + Send + 'static) {
    if self.indeterminate {
      return;
    }
    let slot = self.slot.clone();
    let posted = self.slot.ui().invoke(move || {
      if let Err(e) = update(&slot) {
        warn!(error = %e, "Progress update rejected.");
      }
    });
    if posted.is_err() {
      trace!("Progress update dropped, UI loop is gone.");
    }
  }
}

/// Handed to every computation run by the pool.
///
/// Exposes the task's identity, its cooperative cancellation signal and, for
/// progress-aware tasks, the progress mutators. Progress calls never touch
/// the indicator directly: they are queued onto the UI thread, and are no-ops
/// for tasks without a determinate progress display.
pub struct TaskContext {
  task_id: u64,
  token: CancellationToken,
  pool_shutdown: CancellationToken,
  runtime: TokioHandle,
  progress: Option<ProgressLink>,
}

impl fmt::Debug for TaskContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskContext")
      .field("task_id", &self.task_id)
      .field("cancelled", &self.token.is_cancelled())
      .field("has_progress", &self.progress.is_some())
      .finish()
  }
}

impl TaskContext {
  pub(crate) fn new(
    task_id: u64,
    token: CancellationToken,
    pool_shutdown: CancellationToken,
    runtime: TokioHandle,
    progress: Option<ProgressLink>,
  ) -> Self {
    Self {
      task_id,
      token,
      pool_shutdown,
      runtime,
      progress,
    }
  }

  pub fn task_id(&self) -> u64 {
    self.task_id
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.token
  }

  /// Returns [`TaskError::Interrupted`] once cancellation was requested, so
  /// computations can bail out with `ctx.checkpoint()?`.
  pub fn checkpoint(&self) -> Result<(), TaskError> {
    if self.token.is_cancelled() {
      Err(TaskError::Interrupted)
    } else {
      Ok(())
    }
  }

  /// Sleeps for `duration`, waking early with [`TaskError::Interrupted`] if
  /// the task is cancelled.
  ///
  /// Timers belong to the pool: once the pool starts shutting down this
  /// returns [`TaskError::PoolShuttingDown`], also for dedicated threads that
  /// outlive it.
  ///
  /// Blocking: for synchronous computations only. Async computations should
  /// select on [`cancellation_token`](Self::cancellation_token) instead.
  pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
    self.checkpoint()?;
    if self.pool_shutdown.is_cancelled() {
      return Err(TaskError::PoolShuttingDown);
    }
    let token = self.token.clone();
    let pool_shutdown = self.pool_shutdown.clone();
    self.runtime.block_on(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Interrupted),
        _ = pool_shutdown.cancelled() => Err(TaskError::PoolShuttingDown),
        _ = tokio::time::sleep(duration) => Ok(()),
      }
    })
  }

  /// Advances the progress by the configured step.
  pub fn add_step(&self) {
    if let Some(link) = &self.progress {
      self.add_delta(i64::from(link.step));
    }
  }

  /// Advances (or rewinds, for negative values) the progress by `delta`.
  pub fn add_delta(&self, delta: i64) {
    if let Some(link) = &self.progress {
      link.post(move |slot| slot.grow(delta));
    }
  }

  /// Sets the absolute progress value.
  pub fn set_progress(&self, value: u32) {
    if let Some(link) = &self.progress {
      link.post(move |slot| slot.set_progress(value));
    }
  }

  pub fn update_message(&self, message: impl Into<String>) {
    if let Some(link) = &self.progress {
      let message = message.into();
      link.post(move |slot| slot.set_message(&message));
    }
  }
}

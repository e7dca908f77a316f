use crate::context::TaskContext;
use crate::error::{AsyncProcessError, BoxError, Failure};
use crate::future::{Outcome, ResultFuture};
use crate::indicator::{IndicatorBody, IndicatorFactory, IndicatorLabels, IndicatorSlot, ParentContext};
use crate::pool::TaskPool;
use crate::ui::UiLoop;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

/// Computation run by an [`AsyncProcess`].
pub type ProcessJob = Box<dyn FnOnce(&TaskContext) -> Result<(), BoxError> + Send + 'static>;

/// Failure strategy of a [`Process::Dedicated`] unit.
pub type FailureHandler = Box<dyn FnOnce(Failure) + Send + 'static>;

/// What an [`AsyncProcess`] runs, and where.
pub enum Process {
  /// Runs on the shared pool; failures are returned by [`AsyncProcess::run`].
  Pooled(ProcessJob),
  /// Runs on its own thread, configured by the caller. Failures go to
  /// `on_failure` and are not returned to the initiating thread.
  Dedicated {
    thread: thread::Builder,
    work: ProcessJob,
    on_failure: FailureHandler,
  },
}

impl Process {
  pub fn pooled(job: impl FnOnce(&TaskContext) -> Result<(), BoxError> + Send + 'static) -> Self {
    Process::Pooled(Box::new(job))
  }

  pub fn dedicated(
    thread: thread::Builder,
    work: impl FnOnce(&TaskContext) -> Result<(), BoxError> + Send + 'static,
    on_failure: impl FnOnce(Failure) + Send + 'static,
  ) -> Self {
    Process::Dedicated {
      thread,
      work: Box::new(work),
      on_failure: Box::new(on_failure),
    }
  }
}

impl fmt::Debug for Process {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Process::Pooled(_) => f.write_str("Process::Pooled"),
      Process::Dedicated { thread, .. } => f
        .debug_struct("Process::Dedicated")
        .field("thread", thread)
        .finish_non_exhaustive(),
    }
  }
}

/// Runs a process with no result while the UI thread waits behind a
/// spinner, then reports its failure, if any, on the UI thread.
pub struct AsyncProcess {
  pool: TaskPool,
  factory: Arc<dyn IndicatorFactory>,
  labels: IndicatorLabels,
}

impl AsyncProcess {
  pub fn new(pool: TaskPool, factory: Arc<dyn IndicatorFactory>) -> Self {
    Self {
      pool,
      factory,
      labels: IndicatorLabels::default(),
    }
  }

  pub fn with_labels(mut self, labels: IndicatorLabels) -> Self {
    self.labels = labels;
    self
  }

  /// Runs with the default loading title and message.
  pub fn run_default(
    &self,
    ui: &UiLoop,
    parent: Option<&ParentContext>,
    process: Process,
  ) -> Result<(), AsyncProcessError> {
    self.run(ui, parent, process, &self.labels.loading_title, &self.labels.loading_message)
  }

  /// Runs with the default loading title.
  pub fn run_with_message(
    &self,
    ui: &UiLoop,
    parent: Option<&ParentContext>,
    process: Process,
    message: &str,
  ) -> Result<(), AsyncProcessError> {
    self.run(ui, parent, process, &self.labels.loading_title, message)
  }

  /// Starts `process`, shows the indicator and pumps the UI loop until the
  /// process ends. Only one run per UI loop may be in flight.
  pub fn run(
    &self,
    ui: &UiLoop,
    parent: Option<&ParentContext>,
    process: Process,
    title: &str,
    message: &str,
  ) -> Result<(), AsyncProcessError> {
    let future = match process {
      Process::Pooled(job) => self.pool.submit(job)?,
      Process::Dedicated { thread, work, on_failure } => self.spawn_dedicated(thread, work, on_failure)?,
    };
    let task_id = future.id();

    let body = IndicatorBody::Waiting {
      message: message.to_string(),
    };
    let slot = IndicatorSlot::show(self.factory.as_ref(), ui.handle(), parent, title, body, None)?;
    let finish_slot = slot.clone();
    future.on_complete(move |_| {
      let ui = finish_slot.ui().clone();
      let posted = ui.invoke(move || {
        let _ = finish_slot.dispose();
      });
      if posted.is_err() {
        warn!(%task_id, "AsyncProcess: UI loop is gone, indicator left open.");
      }
    });

    debug!(%task_id, title, "AsyncProcess: entering modal wait.");
    ui.run_until(|| slot.is_disposed());

    match future.outcome() {
      Some(Outcome::Done(())) => Ok(()),
      Some(Outcome::Cancelled) => {
        debug!(%task_id, "AsyncProcess: process was cancelled.");
        Ok(())
      }
      Some(Outcome::Failed(failure)) => {
        debug!(%task_id, label = failure.as_label(), "AsyncProcess: rethrowing background failure.");
        Err(AsyncProcessError::Failed(failure))
      }
      None => Err(AsyncProcessError::Failed(Failure::Unknown)),
    }
  }

  fn spawn_dedicated(
    &self,
    thread: thread::Builder,
    work: ProcessJob,
    on_failure: FailureHandler,
  ) -> Result<ResultFuture<()>, AsyncProcessError> {
    let (future, ctx, execution) = self.pool.register::<()>(None)?;
    let task_id = future.id();

    thread
      .spawn(move || {
        let failure = match catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
          Ok(Ok(())) => None,
          Ok(Err(e)) => Some(Failure::normalize(e)),
          Err(panic_payload) => Some(Failure::from_panic(panic_payload)),
        };
        if let Some(failure) = failure {
          debug!(
            %task_id,
            label = failure.as_label(),
            "Dedicated process failed, handing failure to its own handler."
          );
          if catch_unwind(AssertUnwindSafe(move || on_failure(failure))).is_err() {
            error!(%task_id, "Dedicated process failure handler panicked.");
          }
        }
        execution.finish(Ok(Ok(())));
      })
      .map_err(|e| AsyncProcessError::Failed(Failure::normalize(Box::new(e))))?;

    Ok(future)
  }
}

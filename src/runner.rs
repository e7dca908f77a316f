use crate::context::{ProgressLink, TaskContext};
use crate::error::{BoxError, TaskError};
use crate::future::{Outcome, ResultFuture};
use crate::pool::TaskPool;
use crate::ui::UiHandle;

use std::sync::Arc;

use tracing::{debug, warn};

/// Finish hook of one invocation. Runs on the UI thread.
pub type FinishHook<O> = Box<dyn FnOnce(&ResultFuture<O>) + Send + 'static>;

/// A computation that runs off the UI thread.
pub trait BackgroundTask: Send + Sync + 'static {
  type Input: Send + 'static;
  type Output: Clone + Send + 'static;

  /// Runs on a pool worker. Long computations should poll
  /// [`TaskContext::checkpoint`] or use [`TaskContext::sleep`] so that
  /// cancellation can stop them.
  fn do_in_background(&self, inputs: Vec<Self::Input>, ctx: &TaskContext) -> Result<Self::Output, BoxError>;

  /// Runs on the UI thread after the invocation finished with a value.
  fn done(&self, _output: &Self::Output) {}
}

/// Binds a [`BackgroundTask`] to a pool and routes each outcome back to the
/// UI thread.
///
/// Every [`execute`](Self::execute) allocates a fresh [`ResultFuture`], so
/// sequential invocations never share state. The runner itself is not meant
/// to be driven concurrently from several callers.
pub struct TaskRunner<B: BackgroundTask> {
  pool: TaskPool,
  task: Arc<B>,
}

impl<B: BackgroundTask> TaskRunner<B> {
  pub fn new(pool: TaskPool, task: B) -> Self {
    Self {
      pool,
      task: Arc::new(task),
    }
  }

  pub fn task(&self) -> &B {
    &self.task
  }

  /// Submits the task with `inputs` and returns without waiting.
  ///
  /// Once the outcome is published, `done` is called on the UI thread for
  /// value outcomes.
  pub fn execute(&self, ui: &UiHandle, inputs: Vec<B::Input>) -> Result<ResultFuture<B::Output>, TaskError> {
    self.execute_with(ui, inputs, None, None)
  }

  /// As [`execute`](Self::execute), running `finish` on the UI thread before
  /// `done`, whatever the outcome.
  pub fn execute_with_finish(
    &self,
    ui: &UiHandle,
    inputs: Vec<B::Input>,
    finish: impl FnOnce(&ResultFuture<B::Output>) + Send + 'static,
  ) -> Result<ResultFuture<B::Output>, TaskError> {
    self.execute_with(ui, inputs, None, Some(Box::new(finish)))
  }

  pub(crate) fn execute_with(
    &self,
    ui: &UiHandle,
    inputs: Vec<B::Input>,
    progress: Option<ProgressLink>,
    finish: Option<FinishHook<B::Output>>,
  ) -> Result<ResultFuture<B::Output>, TaskError> {
    let task = self.task.clone();
    let future = self
      .pool
      .submit_blocking(move |ctx| task.do_in_background(inputs, ctx), progress)?;
    let task_id = future.id();
    debug!(pool_name = %self.pool.name(), %task_id, "TaskRunner: invocation submitted.");

    let ui = ui.clone();
    let task = self.task.clone();
    future.on_complete(move |published| {
      let published = published.clone();
      let posted = ui.invoke(move || {
        if let Some(finish) = finish {
          finish(&published);
        }
        match published.outcome() {
          Some(Outcome::Done(output)) => task.done(&output),
          Some(outcome) => debug!(
            %task_id,
            cancelled = outcome.is_cancelled(),
            "TaskRunner: no value produced, skipping done."
          ),
          None => {}
        }
      });
      if posted.is_err() {
        warn!(%task_id, "TaskRunner: UI loop is gone, finish hook dropped.");
      }
    });
    Ok(future)
  }
}

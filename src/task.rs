use crate::context::ProgressLink;
use crate::error::TaskError;
use crate::future::ResultFuture;
use crate::indicator::{
  CancelAffordance, IndicatorBody, IndicatorFactory, IndicatorLabels, IndicatorSlot, ParentContext,
};
use crate::pool::TaskPool;
use crate::runner::{BackgroundTask, TaskRunner};
use crate::ui::UiLoop;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Display options of an [`AsyncTask`].
#[derive(Debug, Clone)]
pub struct AsyncTaskConfig {
  /// Indicator title. Falls back to the loading or progress title of the
  /// task's [`IndicatorLabels`].
  pub title: Option<String>,
  /// Increment applied by [`TaskContext::add_step`](crate::TaskContext::add_step).
  pub step: u32,
  /// Shows a spinner instead of a progress bar and ignores progress updates.
  pub indeterminate: bool,
  pub cancel_enabled: bool,
  pub parent: Option<ParentContext>,
}

impl AsyncTaskConfig {
  /// Spinner indicator with a cancel button.
  pub fn indeterminate() -> Self {
    Self {
      title: None,
      step: 0,
      indeterminate: true,
      cancel_enabled: true,
      parent: None,
    }
  }

  /// Progress bar advancing by `step` on each `add_step`, with a cancel button.
  pub fn with_step(step: u32) -> Self {
    Self {
      title: None,
      step,
      indeterminate: false,
      cancel_enabled: true,
      parent: None,
    }
  }

  pub fn title(mut self, title: impl Into<String>) -> Self {
    self.title = Some(title.into());
    self
  }

  pub fn parent(mut self, parent: ParentContext) -> Self {
    self.parent = Some(parent);
    self
  }

  pub fn cancel_enabled(mut self, enabled: bool) -> Self {
    self.cancel_enabled = enabled;
    self
  }
}

impl Default for AsyncTaskConfig {
  fn default() -> Self {
    Self::indeterminate()
  }
}

struct LatchState<O> {
  future: Option<ResultFuture<O>>,
  cancel_requested: bool,
}

/// Cancellation target of one invocation. A cancel requested before the
/// future exists is replayed when it is installed.
struct CancelLatch<O> {
  state: Mutex<LatchState<O>>,
}

impl<O: Clone + Send + 'static> CancelLatch<O> {
  fn new() -> Self {
    Self {
      state: Mutex::new(LatchState {
        future: None,
        cancel_requested: false,
      }),
    }
  }

  fn future(&self) -> Option<ResultFuture<O>> {
    self.state.lock().future.clone()
  }

  /// Returns `true` if this call published the cancellation or latched it.
  fn cancel(&self) -> bool {
    let mut state = self.state.lock();
    match state.future.clone() {
      Some(future) => {
        drop(state);
        future.cancel()
      }
      None => !std::mem::replace(&mut state.cancel_requested, true),
    }
  }

  fn install(&self, future: ResultFuture<O>) {
    let replay = {
      let mut state = self.state.lock();
      state.future = Some(future.clone());
      state.cancel_requested
    };
    if replay && future.cancel() {
      debug!(task_id = %future.id(), "Replayed a cancellation requested before submission.");
    }
  }
}

/// The latest invocation of a task.
struct Invocation<O> {
  current: Mutex<Option<Arc<CancelLatch<O>>>>,
}

impl<O: Clone + Send + 'static> Invocation<O> {
  fn new() -> Self {
    Self {
      current: Mutex::new(None),
    }
  }

  /// Starts a new invocation; cancellation requests target it from now on.
  fn begin(&self) -> Arc<CancelLatch<O>> {
    let latch = Arc::new(CancelLatch::new());
    *self.current.lock() = Some(latch.clone());
    latch
  }

  fn future(&self) -> Option<ResultFuture<O>> {
    self.current.lock().as_ref().and_then(|latch| latch.future())
  }

  fn current(&self) -> Result<ResultFuture<O>, TaskError> {
    self.future().ok_or(TaskError::NotStarted)
  }

  fn get(&self) -> Result<Option<O>, TaskError> {
    self.current()?.get()
  }

  fn get_timeout(&self, timeout: Duration) -> Result<Option<O>, TaskError> {
    self.current()?.get_timeout(timeout)
  }

  fn is_done(&self) -> bool {
    self.future().is_some_and(|future| future.is_done())
  }

  fn is_cancelled(&self) -> bool {
    self.future().is_some_and(|future| future.is_cancelled())
  }

  fn cancel(&self) -> bool {
    let latch = self.current.lock().clone();
    latch.is_some_and(|latch| latch.cancel())
  }
}

/// A cancellable, value-returning task that runs behind a modal indicator.
///
/// [`execute`](Self::execute) shows the indicator and keeps the UI thread in
/// a modal pump until the invocation finishes or is cancelled. The result is
/// then available through [`get`](Self::get) without blocking.
pub struct AsyncTask<B: BackgroundTask> {
  runner: TaskRunner<B>,
  factory: Arc<dyn IndicatorFactory>,
  config: AsyncTaskConfig,
  labels: IndicatorLabels,
  invocation: Invocation<B::Output>,
}

impl<B: BackgroundTask> AsyncTask<B> {
  pub fn new(pool: TaskPool, factory: Arc<dyn IndicatorFactory>, task: B, config: AsyncTaskConfig) -> Self {
    Self {
      runner: TaskRunner::new(pool, task),
      factory,
      config,
      labels: IndicatorLabels::default(),
      invocation: Invocation::new(),
    }
  }

  pub fn with_labels(mut self, labels: IndicatorLabels) -> Self {
    self.labels = labels;
    self
  }

  pub fn task(&self) -> &B {
    self.runner.task()
  }

  pub fn parent(&self) -> Option<&ParentContext> {
    self.config.parent.as_ref()
  }

  /// Runs the task with `inputs` and returns once its indicator is closed.
  pub fn execute(&self, ui: &UiLoop, inputs: Vec<B::Input>) -> Result<ResultFuture<B::Output>, TaskError> {
    let handle = ui.handle();
    let title = match &self.config.title {
      Some(title) => title.clone(),
      None if self.config.indeterminate => self.labels.loading_title.clone(),
      None => self.labels.progress_title.clone(),
    };
    let body = if self.config.indeterminate {
      IndicatorBody::Waiting {
        message: self.labels.loading_message.clone(),
      }
    } else {
      IndicatorBody::Progress { message: String::new() }
    };

    let latch = self.invocation.begin();
    let cancel = self.config.cancel_enabled.then(|| {
      let latch = latch.clone();
      CancelAffordance::new(move || {
        if latch.cancel() {
          info!("AsyncTask: cancelled from the indicator.");
        }
      })
    });

    let slot = IndicatorSlot::show(
      self.factory.as_ref(),
      handle.clone(),
      self.config.parent.as_ref(),
      &title,
      body,
      cancel,
    )?;
    let progress = ProgressLink {
      slot: slot.clone(),
      step: self.config.step,
      indeterminate: self.config.indeterminate,
    };
    let finish_slot = slot.clone();
    let submitted = self.runner.execute_with(
      &handle,
      inputs,
      Some(progress),
      Some(Box::new(move |_: &ResultFuture<B::Output>| {
        let _ = finish_slot.dispose();
      })),
    );
    let future = match submitted {
      Ok(future) => future,
      Err(e) => {
        slot.dispose()?;
        return Err(e);
      }
    };

    latch.install(future.clone());
    debug!(task_id = %future.id(), "AsyncTask: entering modal wait.");
    ui.run_until(|| slot.is_disposed());
    debug!(task_id = %future.id(), cancelled = future.is_cancelled(), "AsyncTask: modal wait finished.");
    Ok(future)
  }

  /// The latest invocation's value, or `None` if it was cancelled.
  pub fn get(&self) -> Result<Option<B::Output>, TaskError> {
    self.invocation.get()
  }

  pub fn get_timeout(&self, timeout: Duration) -> Result<Option<B::Output>, TaskError> {
    self.invocation.get_timeout(timeout)
  }

  pub fn is_done(&self) -> bool {
    self.invocation.is_done()
  }

  pub fn is_cancelled(&self) -> bool {
    self.invocation.is_cancelled()
  }

  /// Cancels the latest invocation. Safe to call from any thread.
  pub fn cancel(&self) -> bool {
    self.invocation.cancel()
  }
}

/// Hook of a [`CustomAsyncTask`] that sets up its own loading UI.
pub trait PreExecute: BackgroundTask {
  /// Runs on the UI thread right before the computation is submitted.
  fn before_execution(&self);
}

/// A task without a built-in indicator. `execute` returns immediately and
/// `done` runs the next time the UI loop pumps.
pub struct CustomAsyncTask<B: PreExecute> {
  runner: TaskRunner<B>,
  invocation: Invocation<B::Output>,
}

impl<B: PreExecute> CustomAsyncTask<B> {
  pub fn new(pool: TaskPool, task: B) -> Self {
    Self {
      runner: TaskRunner::new(pool, task),
      invocation: Invocation::new(),
    }
  }

  pub fn task(&self) -> &B {
    self.runner.task()
  }

  pub fn execute(&self, ui: &UiLoop, inputs: Vec<B::Input>) -> Result<ResultFuture<B::Output>, TaskError> {
    let latch = self.invocation.begin();
    self.runner.task().before_execution();
    let future = self.runner.execute(&ui.handle(), inputs)?;
    latch.install(future.clone());
    Ok(future)
  }

  pub fn get(&self) -> Result<Option<B::Output>, TaskError> {
    self.invocation.get()
  }

  pub fn get_timeout(&self, timeout: Duration) -> Result<Option<B::Output>, TaskError> {
    self.invocation.get_timeout(timeout)
  }

  pub fn is_done(&self) -> bool {
    self.invocation.is_done()
  }

  pub fn is_cancelled(&self) -> bool {
    self.invocation.is_cancelled()
  }

  pub fn cancel(&self) -> bool {
    self.invocation.cancel()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cancel_before_install_is_replayed() {
    let latch = CancelLatch::<u32>::new();
    assert!(latch.cancel());
    assert!(!latch.cancel(), "a second request is a no-op");

    let future = ResultFuture::new(1);
    latch.install(future.clone());
    assert!(future.is_cancelled());
    assert!(future.cancellation_token().is_cancelled());
    assert_eq!(future.get().unwrap(), None);
  }

  #[test]
  fn test_install_without_request_leaves_future_running() {
    let latch = CancelLatch::<u32>::new();
    let future = ResultFuture::new(2);
    latch.install(future.clone());
    assert!(!future.is_done());

    assert!(latch.cancel());
    assert!(future.is_cancelled());
    assert!(!latch.cancel());
  }

  #[test]
  fn test_invocation_cancel_targets_pending_invocation() {
    let invocation = Invocation::<u32>::new();
    assert!(!invocation.cancel());
    assert!(matches!(invocation.get(), Err(TaskError::NotStarted)));

    let latch = invocation.begin();
    assert!(invocation.cancel());
    assert!(!invocation.is_done());

    let future = ResultFuture::new(3);
    latch.install(future);
    assert!(invocation.is_cancelled());
    assert_eq!(invocation.get().unwrap(), None);
  }
}

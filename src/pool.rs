use crate::context::{ProgressLink, TaskContext};
use crate::error::{BoxError, Failure, TaskError};
use crate::future::ResultFuture;

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder as RuntimeBuilder, Handle as TokioHandle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops accepting work and waits up to the grace period for running jobs.
  Graceful,
  /// Cancels every active job first, then shuts down as `Graceful`.
  ForcefulCancel,
}

/// Construction parameters for a [`TaskPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Used for thread names and log fields.
  pub name: String,
  /// Threads driving async jobs and timers.
  pub async_worker_threads: usize,
  /// Upper bound on concurrently running blocking jobs. Further jobs queue
  /// inside the pool until a worker frees up.
  pub max_blocking_threads: usize,
  /// How long an idle blocking worker is kept before being reclaimed.
  pub thread_keep_alive: Duration,
  /// How long [`TaskPool::shutdown`] waits for running jobs.
  pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "modal-tasks".to_string(),
      async_worker_threads: 1,
      max_blocking_threads: 64,
      thread_keep_alive: Duration::from_secs(10),
      shutdown_grace: Duration::from_secs(5),
    }
  }
}

impl PoolConfig {
  pub fn named(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Self::default()
    }
  }
}

struct PoolInner {
  pool_name: Arc<String>,
  tokio_handle: TokioHandle,
  runtime: Mutex<Option<Runtime>>,
  active_tasks: Arc<DashMap<u64, CancellationToken>>,
  shutdown_token: CancellationToken,
  shutdown_grace: Duration,
}

/// Shared pool of worker threads that runs computations and captures their
/// outcome into a [`ResultFuture`].
///
/// Cloning is cheap; all clones drive the same workers. The pool lives until
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct TaskPool {
  inner: Arc<PoolInner>,
}

impl TaskPool {
  pub fn new(config: PoolConfig) -> Result<Self, TaskError> {
    let thread_name = config.name.clone();
    let runtime = RuntimeBuilder::new_multi_thread()
      .worker_threads(config.async_worker_threads.max(1))
      .max_blocking_threads(config.max_blocking_threads.max(1))
      .thread_keep_alive(config.thread_keep_alive)
      .thread_name(thread_name)
      .enable_time()
      .build()
      .map_err(|e| TaskError::PoolBuild(e.to_string()))?;

    info!(
      pool_name = %config.name,
      max_blocking_threads = config.max_blocking_threads,
      "Task pool started."
    );

    Ok(Self {
      inner: Arc::new(PoolInner {
        pool_name: Arc::new(config.name),
        tokio_handle: runtime.handle().clone(),
        runtime: Mutex::new(Some(runtime)),
        active_tasks: Arc::new(DashMap::new()),
        shutdown_token: CancellationToken::new(),
        shutdown_grace: config.shutdown_grace,
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.pool_name
  }

  pub fn active_task_count(&self) -> usize {
    self.inner.active_tasks.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.shutdown_token.is_cancelled()
  }

  /// Submits a blocking computation. Never blocks the caller.
  ///
  /// Errors returned by the computation and panics escaping it are stored in
  /// the returned future as a normalized [`Failure`].
  pub fn submit<T, F>(&self, job: F) -> Result<ResultFuture<T>, TaskError>
  where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
  {
    self.submit_blocking(job, None)
  }

  /// Submits an async computation built from its [`TaskContext`].
  ///
  /// Cancelling the task drops the future at its next suspension point.
  pub fn submit_async<T, F, Fut>(&self, make_future: F) -> Result<ResultFuture<T>, TaskError>
  where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
  {
    let (future, ctx, execution) = self.register::<T>(None)?;
    let task_id = future.id();
    let token = ctx.cancellation_token().clone();
    let task_future = make_future(ctx);

    self.inner.tokio_handle.spawn(
      async move {
        tokio::select! {
          biased;
          _ = token.cancelled() => {
            debug!(%task_id, "Async task cancelled by its token.");
            execution.cancelled();
          },
          task_result = AssertUnwindSafe(task_future).catch_unwind() => {
            execution.finish(task_result);
          }
        }
      }
      .instrument(info_span!("managed_task", pool_name = %*self.inner.pool_name, %task_id)),
    );
    Ok(future)
  }

  /// Requests cancellation of every active job.
  pub fn cancel_all(&self) {
    info!(pool_name = %*self.inner.pool_name, "Requesting cancellation of all active tasks.");
    for entry in self.inner.active_tasks.iter() {
      let (task_id, token) = entry.pair();
      debug!(pool_name = %*self.inner.pool_name, %task_id, "Signaling cancellation for active task.");
      token.cancel();
    }
  }

  /// Stops the pool. Blocks for up to the configured grace period; must not
  /// be called from inside an async context.
  ///
  /// Jobs that never started resolve to [`Failure::Unknown`].
  pub fn shutdown(&self, mode: ShutdownMode) {
    if self.inner.shutdown_token.is_cancelled() {
      info!(pool_name = %*self.inner.pool_name, "Shutdown already in progress or completed.");
    } else {
      info!(pool_name = %*self.inner.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      // Task tokens first, so cooperative jobs resolve as cancelled rather
      // than failing on the pool's own shutdown signal.
      if mode == ShutdownMode::ForcefulCancel {
        self.cancel_all();
      }
      self.inner.shutdown_token.cancel();
    }

    let runtime = self.inner.runtime.lock().take();
    if let Some(runtime) = runtime {
      info!(
        pool_name = %*self.inner.pool_name,
        grace = ?self.inner.shutdown_grace,
        "Waiting for running tasks."
      );
      runtime.shutdown_timeout(self.inner.shutdown_grace);
      info!(
        pool_name = %*self.inner.pool_name,
        "Pool shutdown completed. Tasks still active: {}",
        self.inner.active_tasks.len()
      );
    }
  }

  pub(crate) fn submit_blocking<T, F>(
    &self,
    job: F,
    progress: Option<ProgressLink>,
  ) -> Result<ResultFuture<T>, TaskError>
  where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
  {
    let (future, ctx, execution) = self.register::<T>(progress)?;
    let span = info_span!("managed_task", pool_name = %*self.inner.pool_name, task_id = %future.id());

    // Dropped unrun if the runtime is gone; the execution guard then fails the future.
    let _ = self.inner.tokio_handle.spawn_blocking(move || {
      let _entered = span.enter();
      let result = catch_unwind(AssertUnwindSafe(|| job(&ctx)));
      execution.finish(result);
    });
    Ok(future)
  }

  /// Allocates the id, future, context and execution guard of a new job.
  pub(crate) fn register<T: Send + 'static>(
    &self,
    progress: Option<ProgressLink>,
  ) -> Result<(ResultFuture<T>, TaskContext, Execution<T>), TaskError> {
    if self.inner.shutdown_token.is_cancelled() {
      warn!(
        pool_name = %*self.inner.pool_name,
        "Submit: Attempted to submit task to a pool that is shutting down."
      );
      return Err(TaskError::PoolShuttingDown);
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let token = CancellationToken::new();
    let future = ResultFuture::with_token(task_id, token.clone());
    let ctx = TaskContext::new(
      task_id,
      token.clone(),
      self.inner.shutdown_token.clone(),
      self.inner.tokio_handle.clone(),
      progress,
    );

    self.inner.active_tasks.insert(task_id, token);
    debug!(pool_name = %*self.inner.pool_name, %task_id, "Task registered.");

    let execution = Execution {
      future: future.clone(),
      active_tasks: self.inner.active_tasks.clone(),
      pool_name: self.inner.pool_name.clone(),
      finished: false,
    };
    Ok((future, ctx, execution))
  }
}

impl Drop for PoolInner {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.get_mut().take() {
      info!(pool_name = %*self.pool_name, "TaskPool dropped. Shutting down in the background.");
      self.shutdown_token.cancel();
      runtime.shutdown_background();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already completed.");
    }
  }
}

/// Publishes the outcome of one job exactly once. If the job is dropped
/// without running, the future is failed with [`Failure::Unknown`].
pub(crate) struct Execution<T: Send + 'static> {
  future: ResultFuture<T>,
  active_tasks: Arc<DashMap<u64, CancellationToken>>,
  pool_name: Arc<String>,
  finished: bool,
}

impl<T: Send + 'static> Execution<T> {
  pub(crate) fn finish(mut self, result: thread::Result<Result<T, BoxError>>) {
    self.finished = true;
    let task_id = self.future.id();
    let published = match result {
      Ok(Ok(value)) => {
        trace!(pool_name = %*self.pool_name, %task_id, "Task executed successfully.");
        self.future.complete(value)
      }
      Ok(Err(_)) if self.future.cancellation_token().is_cancelled() => {
        debug!(pool_name = %*self.pool_name, %task_id, "Task stopped after a cancellation request.");
        self.future.mark_cancelled()
      }
      Ok(Err(e)) => {
        let failure = Failure::normalize(e);
        debug!(
          pool_name = %*self.pool_name,
          %task_id,
          label = failure.as_label(),
          "Task returned an error: {}",
          failure
        );
        self.future.fail(failure)
      }
      Err(panic_payload) => {
        error!(pool_name = %*self.pool_name, %task_id, "Task panicked during execution.");
        self.future.fail(Failure::from_panic(panic_payload))
      }
    };

    if published.is_err() {
      debug!(
        pool_name = %*self.pool_name,
        %task_id,
        "Task finished after its outcome was already published; result discarded."
      );
    }
  }

  pub(crate) fn cancelled(mut self) {
    self.finished = true;
    let _ = self.future.mark_cancelled();
  }
}

impl<T: Send + 'static> Drop for Execution<T> {
  fn drop(&mut self) {
    let task_id = self.future.id();
    if !self.finished && self.future.fail(Failure::Unknown).is_ok() {
      warn!(pool_name = %*self.pool_name, %task_id, "Task was dropped before it could run.");
    }
    self.active_tasks.remove(&task_id);
    trace!(pool_name = %*self.pool_name, %task_id, "Task finished processing, removed active info.");
  }
}

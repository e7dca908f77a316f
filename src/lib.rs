//! Runs long computations off the UI thread while the UI thread waits behind
//! a modal indicator, with progress reporting, cooperative cancellation,
//! timed result retrieval and propagation of background failures back to the
//! initiating thread.

mod context;
mod error;
mod future;
mod indicator;
mod pool;
mod process;
mod runner;
mod task;
mod ui;

pub use context::TaskContext;
pub use error::{AsyncProcessError, BoxError, Failure, PanicError, TaskError};
pub use future::{Outcome, ResultFuture};
pub use indicator::{
  BlockingIndicator, CancelAffordance, IndicatorBody, IndicatorFactory, IndicatorLabels, ParentContext,
  ProgressSurface, TracingIndicatorFactory, PROGRESS_MAX,
};
pub use pool::{PoolConfig, ShutdownMode, TaskPool};
pub use process::{AsyncProcess, FailureHandler, Process, ProcessJob};
pub use runner::{BackgroundTask, FinishHook, TaskRunner};
pub use task::{AsyncTask, AsyncTaskConfig, CustomAsyncTask, PreExecute};
pub use ui::{UiHandle, UiLoop};

//! The designated UI thread and the channel used to marshal work onto it.
//!
//! A [`UiLoop`] is bound to the thread that creates it and is not `Send`, so
//! only that thread can run queued jobs. Any thread may hold a [`UiHandle`]
//! and post closures to it. Modal waits are implemented by pumping this queue
//! until a condition holds, blocking on the channel in between.

use crate::error::TaskError;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

type UiJob = Box<dyn FnOnce() + Send + 'static>;

/// Owner side of the UI job queue. Lives on, and pins itself to, the UI thread.
pub struct UiLoop {
  thread_id: ThreadId,
  rx: RefCell<mpsc::UnboundedReceiver<UiJob>>,
  tx: mpsc::UnboundedSender<UiJob>,
  _not_send: PhantomData<Rc<()>>,
}

/// Cloneable, thread-safe handle used to post jobs to the UI thread.
#[derive(Clone, Debug)]
pub struct UiHandle {
  thread_id: ThreadId,
  tx: mpsc::UnboundedSender<UiJob>,
}

impl UiLoop {
  /// Binds a new UI loop to the calling thread.
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let thread_id = thread::current().id();
    debug!(?thread_id, "UiLoop: bound to current thread.");
    Self {
      thread_id,
      rx: RefCell::new(rx),
      tx,
      _not_send: PhantomData,
    }
  }

  pub fn handle(&self) -> UiHandle {
    UiHandle {
      thread_id: self.thread_id,
      tx: self.tx.clone(),
    }
  }

  /// Runs queued jobs until `done` returns `true`.
  ///
  /// `done` is evaluated before blocking and after every job, so the loop
  /// only wakes up when something is posted. Nested pumping is not supported.
  pub fn run_until(&self, mut done: impl FnMut() -> bool) {
    let mut rx = self.rx.borrow_mut();
    while !done() {
      // The loop keeps its own sender alive, so the channel never closes here.
      match rx.blocking_recv() {
        Some(job) => Self::run_job(job),
        None => break,
      }
    }
  }

  /// Runs every job already queued without blocking. Returns how many ran.
  pub fn pump_pending(&self) -> usize {
    let mut rx = self.rx.borrow_mut();
    let mut ran = 0;
    while let Ok(job) = rx.try_recv() {
      Self::run_job(job);
      ran += 1;
    }
    if ran > 0 {
      trace!(ran, "UiLoop: drained pending jobs.");
    }
    ran
  }

  fn run_job(job: UiJob) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
      error!("UiLoop: a UI job panicked; continuing with the next job.");
    }
  }
}

impl Default for UiLoop {
  fn default() -> Self {
    Self::new()
  }
}

impl UiHandle {
  /// Queues `job` to run on the UI thread.
  pub fn invoke(&self, job: impl FnOnce() + Send + 'static) -> Result<(), TaskError> {
    self.tx.send(Box::new(job)).map_err(|_| {
      debug!("UiHandle: UI loop dropped, job discarded.");
      TaskError::UiClosed
    })
  }

  pub fn is_ui_thread(&self) -> bool {
    thread::current().id() == self.thread_id
  }

  /// Fails with [`TaskError::NotOnUiThread`] when called from any other thread.
  pub fn ensure_ui_thread(&self) -> Result<(), TaskError> {
    if self.is_ui_thread() {
      Ok(())
    } else {
      Err(TaskError::NotOnUiThread)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn test_jobs_posted_from_other_threads_run_on_ui_thread() {
    let ui = UiLoop::new();
    let handle = ui.handle();
    let ui_thread = thread::current().id();
    let ran_on_ui = Arc::new(AtomicBool::new(false));

    let flag = ran_on_ui.clone();
    let poster = thread::spawn(move || {
      assert!(!handle.is_ui_thread());
      assert!(matches!(handle.ensure_ui_thread(), Err(TaskError::NotOnUiThread)));
      thread::sleep(Duration::from_millis(10));
      handle
        .invoke(move || flag.store(thread::current().id() == ui_thread, Ordering::SeqCst))
        .unwrap();
    });

    ui.run_until(|| ran_on_ui.load(Ordering::SeqCst));
    poster.join().unwrap();
    assert!(ui.handle().ensure_ui_thread().is_ok());
  }

  #[test]
  fn test_panicking_job_does_not_stop_the_loop() {
    let ui = UiLoop::new();
    let handle = ui.handle();
    let count = Arc::new(AtomicUsize::new(0));

    handle.invoke(|| panic!("job failure")).unwrap();
    let c = count.clone();
    handle.invoke(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();

    assert_eq!(ui.pump_pending(), 2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_invoke_after_loop_dropped() {
    let ui = UiLoop::new();
    let handle = ui.handle();
    drop(ui);
    assert!(matches!(handle.invoke(|| {}), Err(TaskError::UiClosed)));
  }
}

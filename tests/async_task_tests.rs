mod common;

use common::{setup_tracing_for_test, test_pool, IndicatorEvent, RecordingFactory, RuntimeFailure};
use modal_tasks::{
  AsyncTask, AsyncTaskConfig, BackgroundTask, BoxError, CustomAsyncTask, IndicatorBody, ParentContext,
  PreExecute, TaskContext, TaskError, UiLoop,
};

use rand::Rng;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// What a [`Scripted`] computation does once started.
#[derive(Clone, Copy)]
enum Script {
  /// Sleeps cooperatively, then returns the sum of its inputs.
  SleepThenSum(Duration),
  /// Walks through every progress mutator, then returns the sum.
  ReportProgress,
  FailWith(&'static str),
  PanicSilently,
}

struct Scripted {
  script: Script,
  ui_thread: ThreadId,
  done_calls: Arc<Mutex<Vec<(u64, bool)>>>,
  before_calls: Arc<Mutex<Vec<bool>>>,
}

impl Scripted {
  fn new(script: Script) -> Self {
    Self {
      script,
      ui_thread: thread::current().id(),
      done_calls: Arc::new(Mutex::new(Vec::new())),
      before_calls: Arc::new(Mutex::new(Vec::new())),
    }
  }

  fn done_calls(&self) -> Vec<(u64, bool)> {
    self.done_calls.lock().unwrap().clone()
  }
}

impl BackgroundTask for Scripted {
  type Input = u64;
  type Output = u64;

  fn do_in_background(&self, inputs: Vec<u64>, ctx: &TaskContext) -> Result<u64, BoxError> {
    match self.script {
      Script::SleepThenSum(duration) => ctx.sleep(duration)?,
      Script::ReportProgress => {
        ctx.add_step();
        ctx.add_step();
        ctx.add_step();
        ctx.update_message("phase 2");
        ctx.add_delta(-10);
        ctx.set_progress(150);
      }
      Script::FailWith(message) => return Err(Box::new(RuntimeFailure(message.to_string()))),
      Script::PanicSilently => std::panic::panic_any(()),
    }
    Ok(inputs.iter().sum())
  }

  fn done(&self, output: &u64) {
    let on_ui_thread = thread::current().id() == self.ui_thread;
    self.done_calls.lock().unwrap().push((*output, on_ui_thread));
  }
}

impl PreExecute for Scripted {
  fn before_execution(&self) {
    let on_ui_thread = thread::current().id() == self.ui_thread;
    self.before_calls.lock().unwrap().push(on_ui_thread);
  }
}

#[test]
fn test_indeterminate_task_returns_value() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_indeterminate_task_returns_value"),
    Arc::new(factory.clone()),
    Scripted::new(Script::SleepThenSum(Duration::from_millis(30))),
    AsyncTaskConfig::indeterminate(),
  );

  assert!(matches!(task.get(), Err(TaskError::NotStarted)));
  assert!(!task.is_done());

  let future = task.execute(&ui, vec![1, 2, 3]).unwrap();
  assert!(future.is_done());
  assert!(task.is_done());
  assert_eq!(task.get().unwrap(), Some(6));
  assert_eq!(task.get_timeout(Duration::ZERO).unwrap(), Some(6));

  assert_eq!(
    factory.events(),
    vec![
      IndicatorEvent::Shown {
        title: "Loading".to_string(),
        body: IndicatorBody::Waiting {
          message: "Please wait...".to_string()
        },
        cancellable: true,
        has_parent: false,
      },
      IndicatorEvent::Disposed,
    ]
  );

  // `done` is queued behind the dispose on the same UI loop.
  ui.run_until(|| !task.task().done_calls().is_empty());
  assert_eq!(task.task().done_calls(), vec![(6, true)]);
}

#[test]
fn test_progress_updates_reach_indicator_in_order() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_progress_updates_reach_indicator_in_order"),
    Arc::new(factory.clone()),
    Scripted::new(Script::ReportProgress),
    AsyncTaskConfig::with_step(25).title("Importing"),
  );

  task.execute(&ui, vec![4]).unwrap();
  assert_eq!(task.get().unwrap(), Some(4));

  assert_eq!(factory.values(), vec![25, 50, 75, 65, 100]);
  assert_eq!(factory.messages(), vec!["phase 2".to_string()]);
  match factory.events().first() {
    Some(IndicatorEvent::Shown { title, body, .. }) => {
      assert_eq!(title, "Importing");
      assert!(!body.is_indeterminate());
    }
    other => panic!("expected the indicator to be shown first, got {:?}", other),
  }
  assert_eq!(factory.events().last(), Some(&IndicatorEvent::Disposed));
}

#[test]
fn test_progress_calls_are_ignored_when_indeterminate() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_progress_calls_are_ignored_when_indeterminate"),
    Arc::new(factory.clone()),
    Scripted::new(Script::ReportProgress),
    AsyncTaskConfig::indeterminate().cancel_enabled(false),
  );

  task.execute(&ui, vec![1]).unwrap();
  assert_eq!(task.get().unwrap(), Some(1));
  assert!(factory.values().is_empty());
  assert!(factory.messages().is_empty());
  assert!(matches!(
    factory.events().first(),
    Some(IndicatorEvent::Shown { cancellable: false, .. })
  ));
  assert_eq!(factory.dispose_count(), 1);
}

#[test]
fn test_cancel_button_ends_modal_wait() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_cancel_button_ends_modal_wait"),
    Arc::new(factory.clone()),
    Scripted::new(Script::SleepThenSum(Duration::from_secs(5))),
    AsyncTaskConfig::indeterminate(),
  );

  let start = Instant::now();
  let presser = {
    let factory = factory.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(30));
      factory.press_cancel()
    })
  };

  task.execute(&ui, vec![1]).unwrap();
  assert!(presser.join().unwrap());
  assert!(start.elapsed() < Duration::from_secs(2));

  assert!(task.is_cancelled());
  assert!(task.is_done());
  assert_eq!(task.get().unwrap(), None);
  assert_eq!(factory.dispose_count(), 1);

  thread::sleep(Duration::from_millis(20));
  ui.pump_pending();
  assert!(task.task().done_calls().is_empty());
}

#[test]
fn test_cancel_from_another_thread() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_cancel_from_another_thread"),
    Arc::new(factory.clone()),
    Scripted::new(Script::SleepThenSum(Duration::from_secs(5))),
    AsyncTaskConfig::with_step(10),
  );

  thread::scope(|s| {
    s.spawn(|| {
      // The indicator is shown once the invocation has begun.
      while factory.shown_count() == 0 {
        thread::sleep(Duration::from_millis(1));
      }
      assert!(task.cancel());
    });
    task.execute(&ui, vec![1]).unwrap();
  });

  assert_eq!(task.get().unwrap(), None);
  assert!(!task.cancel(), "cancelling a finished invocation is a no-op");
  assert_eq!(factory.dispose_count(), 1);
}

#[test]
fn test_cancel_pressed_while_indicator_opens() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::cancelling_on_show();
  let task = AsyncTask::new(
    test_pool("test_cancel_pressed_while_indicator_opens"),
    Arc::new(factory.clone()),
    Scripted::new(Script::SleepThenSum(Duration::from_millis(500))),
    AsyncTaskConfig::indeterminate(),
  );

  let start = Instant::now();
  task.execute(&ui, vec![1]).unwrap();
  assert!(start.elapsed() < Duration::from_millis(400));
  assert!(task.is_cancelled());
  assert_eq!(task.get().unwrap(), None);
  assert_eq!(factory.dispose_count(), 1);

  thread::sleep(Duration::from_millis(20));
  ui.pump_pending();
  assert!(task.task().done_calls().is_empty());
}

#[test]
fn test_failure_is_rethrown_and_indicator_closed() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_failure_is_rethrown_and_indicator_closed"),
    Arc::new(factory.clone()),
    Scripted::new(Script::FailWith("disk full")),
    AsyncTaskConfig::indeterminate(),
  );

  task.execute(&ui, vec![1]).unwrap();
  match task.get() {
    Err(TaskError::Execution(failure)) => {
      assert_eq!(failure.downcast_ref::<RuntimeFailure>().map(|e| e.0.as_str()), Some("disk full"));
    }
    other => panic!("expected the background failure, got {:?}", other),
  }
  assert_eq!(factory.dispose_count(), 1);

  thread::sleep(Duration::from_millis(20));
  ui.pump_pending();
  assert!(task.task().done_calls().is_empty());
}

#[test]
fn test_silent_panic_becomes_unknown_failure() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let task = AsyncTask::new(
    test_pool("test_silent_panic_becomes_unknown_failure"),
    Arc::new(factory.clone()),
    Scripted::new(Script::PanicSilently),
    AsyncTaskConfig::indeterminate(),
  );

  task.execute(&ui, vec![]).unwrap();
  match task.get() {
    Err(TaskError::Execution(failure)) => assert!(failure.is_unknown()),
    other => panic!("expected an unknown failure, got {:?}", other),
  }
  assert_eq!(factory.dispose_count(), 1);
}

#[test]
fn test_sequential_executions_show_fresh_indicators() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let factory = RecordingFactory::new();
  let parent = ParentContext::new("main-window");
  let task = AsyncTask::new(
    test_pool("test_sequential_executions_show_fresh_indicators"),
    Arc::new(factory.clone()),
    Scripted::new(Script::SleepThenSum(Duration::from_millis(5))),
    AsyncTaskConfig::indeterminate().parent(parent),
  );
  assert_eq!(task.parent().and_then(|p| p.downcast_ref::<&str>()), Some(&"main-window"));

  let first = task.execute(&ui, vec![1]).unwrap();
  let second = task.execute(&ui, vec![2]).unwrap();
  assert_ne!(first.id(), second.id());
  assert_eq!(first.get().unwrap(), Some(1));
  assert_eq!(task.get().unwrap(), Some(2));

  assert_eq!(factory.shown_count(), 2);
  assert_eq!(factory.dispose_count(), 2);
  assert!(factory
    .events()
    .iter()
    .all(|e| !matches!(e, IndicatorEvent::Shown { has_parent: false, .. })));
}

#[test]
fn test_completion_cancel_race_disposes_once() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let pool = test_pool("test_completion_cancel_race_disposes_once");
  let mut rng = rand::rng();

  for iteration in 0..40 {
    let factory = RecordingFactory::new();
    let work = Duration::from_millis(rng.random_range(0..8));
    let cancel_after = Duration::from_millis(rng.random_range(0..8));
    let task = AsyncTask::new(
      pool.clone(),
      Arc::new(factory.clone()),
      Scripted::new(Script::SleepThenSum(work)),
      AsyncTaskConfig::with_step(1),
    );

    thread::scope(|s| {
      s.spawn(|| {
        thread::sleep(cancel_after);
        task.cancel();
      });
      task.execute(&ui, vec![iteration]).unwrap();
    });

    match task.get() {
      Ok(Some(value)) => assert_eq!(value, iteration),
      Ok(None) => assert!(task.is_cancelled()),
      Err(e) => panic!("iteration {} failed unexpectedly: {}", iteration, e),
    }
    assert_eq!(factory.shown_count(), 1, "iteration {}", iteration);
    assert_eq!(factory.dispose_count(), 1, "iteration {}", iteration);
  }
}

#[test]
fn test_ui_handle_is_bound_to_its_loop_thread() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let local = ui.handle();
  assert!(local.is_ui_thread());

  let foreign = thread::spawn(|| UiLoop::new().handle()).join().unwrap();
  assert!(!foreign.is_ui_thread());
  assert!(matches!(foreign.ensure_ui_thread(), Err(TaskError::NotOnUiThread)));
  // The loop behind the foreign handle is gone with its thread.
  assert!(matches!(foreign.invoke(|| {}), Err(TaskError::UiClosed)));

  let from_worker = thread::spawn(move || local.ensure_ui_thread()).join().unwrap();
  assert!(matches!(from_worker, Err(TaskError::NotOnUiThread)));
}

#[test]
fn test_custom_task_returns_immediately() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let task = CustomAsyncTask::new(
    test_pool("test_custom_task_returns_immediately"),
    Scripted::new(Script::SleepThenSum(Duration::from_millis(100))),
  );

  let start = Instant::now();
  task.execute(&ui, vec![20, 22]).unwrap();
  assert!(start.elapsed() < Duration::from_millis(100));
  assert_eq!(*task.task().before_calls.lock().unwrap(), vec![true]);
  assert!(!task.is_done());

  assert!(matches!(
    task.get_timeout(Duration::from_millis(20)),
    Err(TaskError::Timeout(_))
  ));
  assert_eq!(task.get().unwrap(), Some(42));

  ui.run_until(|| !task.task().done_calls().is_empty());
  assert_eq!(task.task().done_calls(), vec![(42, true)]);
}

#[test]
fn test_custom_task_cancel() {
  setup_tracing_for_test();
  let ui = UiLoop::new();
  let task = CustomAsyncTask::new(
    test_pool("test_custom_task_cancel"),
    Scripted::new(Script::SleepThenSum(Duration::from_secs(5))),
  );

  task.execute(&ui, vec![1]).unwrap();
  assert!(task.cancel());
  assert!(task.is_cancelled());
  assert_eq!(task.get().unwrap(), None);
}

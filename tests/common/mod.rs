#![allow(dead_code)]

use modal_tasks::{
  BlockingIndicator, CancelAffordance, IndicatorBody, IndicatorFactory, ParentContext, PoolConfig,
  ProgressSurface, TaskPool,
};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Helper to initialize tracing for tests (call once per test run, not per test function)
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,modal_tasks=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

pub fn test_pool(pool_name: &str) -> TaskPool {
  TaskPool::new(PoolConfig {
    shutdown_grace: Duration::from_secs(2),
    ..PoolConfig::named(pool_name)
  })
  .expect("pool should build")
}

/// Error type used by computations that fail on purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure(pub String);

impl fmt::Display for RuntimeFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for RuntimeFailure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorEvent {
  Shown {
    title: String,
    body: IndicatorBody,
    cancellable: bool,
    has_parent: bool,
  },
  Message(String),
  Value(u32),
  Disposed,
}

/// Indicator factory recording everything the crate does to its indicators.
#[derive(Clone, Default)]
pub struct RecordingFactory {
  events: Arc<Mutex<Vec<IndicatorEvent>>>,
  cancel: Arc<Mutex<Option<CancelAffordance>>>,
  cancel_on_show: bool,
}

impl RecordingFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// A factory whose cancel button is pressed while the indicator is shown.
  pub fn cancelling_on_show() -> Self {
    Self {
      cancel_on_show: true,
      ..Self::default()
    }
  }

  pub fn events(&self) -> Vec<IndicatorEvent> {
    self.events.lock().unwrap().clone()
  }

  pub fn shown_count(&self) -> usize {
    self.count(|e| matches!(e, IndicatorEvent::Shown { .. }))
  }

  pub fn dispose_count(&self) -> usize {
    self.count(|e| matches!(e, IndicatorEvent::Disposed))
  }

  pub fn values(&self) -> Vec<u32> {
    self
      .events()
      .into_iter()
      .filter_map(|e| match e {
        IndicatorEvent::Value(v) => Some(v),
        _ => None,
      })
      .collect()
  }

  pub fn messages(&self) -> Vec<String> {
    self
      .events()
      .into_iter()
      .filter_map(|e| match e {
        IndicatorEvent::Message(m) => Some(m),
        _ => None,
      })
      .collect()
  }

  /// Simulates a press on the cancel button of the latest indicator.
  pub fn press_cancel(&self) -> bool {
    let cancel = self.cancel.lock().unwrap().clone();
    match cancel {
      Some(cancel) => {
        cancel.trigger();
        true
      }
      None => false,
    }
  }

  fn count(&self, predicate: impl Fn(&IndicatorEvent) -> bool) -> usize {
    self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
  }
}

struct RecordingIndicator {
  events: Arc<Mutex<Vec<IndicatorEvent>>>,
}

impl ProgressSurface for RecordingIndicator {
  fn set_message(&mut self, message: &str) {
    self.events.lock().unwrap().push(IndicatorEvent::Message(message.to_string()));
  }

  fn set_value(&mut self, value: u32) {
    self.events.lock().unwrap().push(IndicatorEvent::Value(value));
  }
}

impl BlockingIndicator for RecordingIndicator {
  fn dispose(&mut self) {
    self.events.lock().unwrap().push(IndicatorEvent::Disposed);
  }
}

impl IndicatorFactory for RecordingFactory {
  fn show(
    &self,
    parent: Option<&ParentContext>,
    title: &str,
    body: IndicatorBody,
    cancel: Option<CancelAffordance>,
  ) -> Box<dyn BlockingIndicator> {
    self.events.lock().unwrap().push(IndicatorEvent::Shown {
      title: title.to_string(),
      body,
      cancellable: cancel.is_some(),
      has_parent: parent.is_some(),
    });
    *self.cancel.lock().unwrap() = cancel.clone();
    if let Some(cancel) = cancel.filter(|_| self.cancel_on_show) {
      cancel.trigger();
    }
    Box::new(RecordingIndicator {
      events: self.events.clone(),
    })
  }
}

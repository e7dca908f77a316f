//! Modal indicator collaborators and the slot that owns a live indicator.
//!
//! The toolkit-specific surface is supplied through [`IndicatorFactory`].
//! The crate only ever touches an indicator from the UI thread and disposes it
//! exactly once, through [`IndicatorSlot`].

use crate::error::TaskError;
use crate::ui::UiHandle;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

/// Upper bound of the progress range, matching a standard progress bar.
pub const PROGRESS_MAX: u32 = 100;

/// Opaque display context an indicator is parented to.
#[derive(Clone)]
pub struct ParentContext(Arc<dyn Any + Send + Sync>);

impl ParentContext {
  pub fn new<P: Any + Send + Sync>(parent: P) -> Self {
    Self(Arc::new(parent))
  }

  pub fn downcast_ref<P: Any>(&self) -> Option<&P> {
    self.0.downcast_ref::<P>()
  }
}

impl fmt::Debug for ParentContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ParentContext").finish_non_exhaustive()
  }
}

/// What the indicator renders while the task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorBody {
  /// Indeterminate spinner with a fixed message.
  Waiting { message: String },
  /// Progress bar in `0..=PROGRESS_MAX` with an updatable message.
  Progress { message: String },
}

impl IndicatorBody {
  pub fn is_indeterminate(&self) -> bool {
    matches!(self, IndicatorBody::Waiting { .. })
  }
}

/// Cancel button wiring handed to the factory. Pressing the button must call
/// [`trigger`](Self::trigger); extra presses are harmless.
#[derive(Clone)]
pub struct CancelAffordance {
  on_cancel: Arc<dyn Fn() + Send + Sync>,
}

impl CancelAffordance {
  pub fn new(on_cancel: impl Fn() + Send + Sync + 'static) -> Self {
    Self {
      on_cancel: Arc::new(on_cancel),
    }
  }

  pub fn trigger(&self) {
    (self.on_cancel)();
  }
}

impl fmt::Debug for CancelAffordance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelAffordance").finish_non_exhaustive()
  }
}

/// Mutators of a progress display. Only ever invoked on the UI thread.
pub trait ProgressSurface {
  fn set_message(&mut self, message: &str);

  /// Sets the absolute progress value, already clamped to `0..=PROGRESS_MAX`.
  fn set_value(&mut self, value: u32);
}

/// A live modal indicator.
pub trait BlockingIndicator: ProgressSurface + Send {
  fn dispose(&mut self);
}

/// Creates indicators for the toolkit in use.
pub trait IndicatorFactory: Send + Sync {
  fn show(
    &self,
    parent: Option<&ParentContext>,
    title: &str,
    body: IndicatorBody,
    cancel: Option<CancelAffordance>,
  ) -> Box<dyn BlockingIndicator>;
}

/// Default strings used when the caller does not provide its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorLabels {
  pub loading_title: String,
  pub loading_message: String,
  pub progress_title: String,
}

impl Default for IndicatorLabels {
  fn default() -> Self {
    Self {
      loading_title: "Loading".to_string(),
      loading_message: "Please wait...".to_string(),
      progress_title: "Progress".to_string(),
    }
  }
}

struct SlotState {
  indicator: Option<Box<dyn BlockingIndicator>>,
  value: u32,
}

struct SlotShared {
  state: Mutex<SlotState>,
  disposed: AtomicBool,
  ui: UiHandle,
}

/// Owns the indicator of one invocation and guarantees a single disposal.
#[derive(Clone)]
pub(crate) struct IndicatorSlot {
  shared: Arc<SlotShared>,
}

impl IndicatorSlot {
  /// Shows a new indicator. Must be called on the UI thread.
  pub(crate) fn show(
    factory: &dyn IndicatorFactory,
    ui: UiHandle,
    parent: Option<&ParentContext>,
    title: &str,
    body: IndicatorBody,
    cancel: Option<CancelAffordance>,
  ) -> Result<Self, TaskError> {
    ui.ensure_ui_thread()?;
    debug!(
      title,
      indeterminate = body.is_indeterminate(),
      cancellable = cancel.is_some(),
      "Showing blocking indicator."
    );
    let indicator = factory.show(parent, title, body, cancel);
    Ok(Self {
      shared: Arc::new(SlotShared {
        state: Mutex::new(SlotState {
          indicator: Some(indicator),
          value: 0,
        }),
        disposed: AtomicBool::new(false),
        ui,
      }),
    })
  }

  pub(crate) fn ui(&self) -> &UiHandle {
    &self.shared.ui
  }

  pub(crate) fn is_disposed(&self) -> bool {
    self.shared.disposed.load(Ordering::Acquire)
  }

  /// Disposes the indicator. Returns `true` only for the call that did it.
  pub(crate) fn dispose(&self) -> Result<bool, TaskError> {
    self.shared.ui.ensure_ui_thread()?;
    let taken = self.shared.state.lock().indicator.take();
    match taken {
      Some(mut indicator) => {
        indicator.dispose();
        self.shared.disposed.store(true, Ordering::Release);
        debug!("Blocking indicator disposed.");
        Ok(true)
      }
      None => {
        trace!("Blocking indicator already disposed, ignoring.");
        Ok(false)
      }
    }
  }

  /// Adds `delta` to the progress value, clamping to the progress range.
  pub(crate) fn grow(&self, delta: i64) -> Result<(), TaskError> {
    self.shared.ui.ensure_ui_thread()?;
    let mut state = self.shared.state.lock();
    let value = (i64::from(state.value) + delta).clamp(0, i64::from(PROGRESS_MAX)) as u32;
    state.value = value;
    if let Some(indicator) = state.indicator.as_mut() {
      indicator.set_value(value);
    }
    Ok(())
  }

  pub(crate) fn set_progress(&self, value: u32) -> Result<(), TaskError> {
    self.shared.ui.ensure_ui_thread()?;
    let mut state = self.shared.state.lock();
    state.value = value.min(PROGRESS_MAX);
    let value = state.value;
    if let Some(indicator) = state.indicator.as_mut() {
      indicator.set_value(value);
    }
    Ok(())
  }

  pub(crate) fn set_message(&self, message: &str) -> Result<(), TaskError> {
    self.shared.ui.ensure_ui_thread()?;
    if let Some(indicator) = self.shared.state.lock().indicator.as_mut() {
      indicator.set_message(message);
    }
    Ok(())
  }
}

/// Headless factory whose indicators report their activity through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingIndicatorFactory;

struct TracingIndicator {
  title: String,
}

impl ProgressSurface for TracingIndicator {
  fn set_message(&mut self, message: &str) {
    info!(title = %self.title, message, "Indicator message updated.");
  }

  fn set_value(&mut self, value: u32) {
    debug!(title = %self.title, value, "Indicator progress updated.");
  }
}

impl BlockingIndicator for TracingIndicator {
  fn dispose(&mut self) {
    info!(title = %self.title, "Indicator closed.");
  }
}

impl IndicatorFactory for TracingIndicatorFactory {
  fn show(
    &self,
    _parent: Option<&ParentContext>,
    title: &str,
    body: IndicatorBody,
    cancel: Option<CancelAffordance>,
  ) -> Box<dyn BlockingIndicator> {
    info!(title, ?body, cancellable = cancel.is_some(), "Indicator opened.");
    Box::new(TracingIndicator {
      title: title.to_string(),
    })
  }
}

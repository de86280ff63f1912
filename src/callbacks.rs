//! Lifecycle callbacks around every adapter step.
//!
//! Each attempt of an invocation emits six ordered events:
//!
//! ```text
//! format_start → format_end → call_start → call_end → parse_start → parse_end
//! ```
//!
//! All attempts of one invocation share a [`CallId`]. When a phase fails its
//! closing event still fires (with `"ok": false`) and the remaining phases of
//! that attempt are skipped.
//!
//! Callbacks are observers. A callback that returns an error or panics is
//! logged and skipped; it never changes the outcome of the invocation and
//! never prevents the callbacks after it from running.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle phase of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    FormatStart,
    FormatEnd,
    CallStart,
    CallEnd,
    ParseStart,
    ParseEnd,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::FormatStart => "format_start",
            Phase::FormatEnd => "format_end",
            Phase::CallStart => "call_start",
            Phase::CallEnd => "call_end",
            Phase::ParseStart => "parse_start",
            Phase::ParseEnd => "parse_end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier shared by every event of one top-level invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    /// A fresh random (v4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Context attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventMeta {
    pub adapter: &'static str,
    pub signature: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub model: String,
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackEvent {
    pub call_id: CallId,
    pub phase: Phase,
    pub meta: EventMeta,
    /// Phase-specific data; closing phases carry `"ok"` and, on failure,
    /// `"error_kind"` and `"error"`.
    pub payload: Value,
}

/// Observer of lifecycle events.
///
/// # Example
///
/// ```
/// use signature_pipeline::callbacks::{Callback, CallbackEvent, Phase};
///
/// struct PrintPhases;
///
/// impl Callback for PrintPhases {
///     fn on_event(&self, event: &CallbackEvent) -> anyhow::Result<()> {
///         if event.phase == Phase::CallEnd {
///             println!("[{}] attempt {} done", event.call_id, event.meta.attempt);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Callback: Send + Sync {
    fn on_event(&self, event: &CallbackEvent) -> anyhow::Result<()>;
}

/// A [`Callback`] backed by a closure.
///
/// ```
/// use signature_pipeline::callbacks::{CallbackEvent, FnCallback};
/// use std::sync::Arc;
///
/// let cb = Arc::new(FnCallback(|event: &CallbackEvent| -> anyhow::Result<()> {
///     println!("{}", event.phase);
///     Ok(())
/// }));
/// ```
pub struct FnCallback<F>(pub F)
where
    F: Fn(&CallbackEvent) -> anyhow::Result<()> + Send + Sync;

impl<F> Callback for FnCallback<F>
where
    F: Fn(&CallbackEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &CallbackEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// A callback that keeps every event it sees.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<CallbackEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events.lock().iter().map(|e| e.phase).collect()
    }
}

impl Callback for EventRecorder {
    fn on_event(&self, event: &CallbackEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Ordered list of callbacks for one invocation.
#[derive(Clone, Default)]
pub struct CallbackChain {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge three configuration levels: global, then program, then
    /// per-call. Registration order is kept within each level.
    pub fn merge(
        global: &[Arc<dyn Callback>],
        program: &[Arc<dyn Callback>],
        per_call: &[Arc<dyn Callback>],
    ) -> Self {
        Self {
            callbacks: global
                .iter()
                .chain(program)
                .chain(per_call)
                .cloned()
                .collect(),
        }
    }

    pub fn push(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Deliver `event` to every callback in order.
    pub fn dispatch(&self, event: &CallbackEvent) {
        for (position, callback) in self.callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    call_id = %event.call_id,
                    phase = %event.phase,
                    position,
                    error = %e,
                    "callback failed"
                ),
                Err(panic) => tracing::error!(
                    call_id = %event.call_id,
                    phase = %event.phase,
                    position,
                    panic = panic_message(&*panic),
                    "callback panicked"
                ),
            }
        }
    }
}

impl fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

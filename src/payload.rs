//! Object-safe trait for executable programs.
//!
//! A payload takes [`Inputs`], runs against an [`ExecCtx`], and returns
//! [`Outputs`]. The trait is object-safe so programs can be stored as
//! `Box<dyn Payload>` and composed by the caller without generic
//! constraints. [`Predictor`](crate::Predictor) is the built-in
//! implementation.

use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::types::{Inputs, Outputs};
use std::future::Future;
use std::pin::Pin;

/// A boxed, pinned, Send future -- the return type of [`Payload::invoke`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe trait for executable programs.
pub trait Payload: Send + Sync {
    /// Stable identifier for the payload type (e.g. `"predictor"`).
    fn kind(&self) -> &'static str;

    /// Instance name (for logging/debugging/events).
    fn name(&self) -> &str;

    /// Execute the payload with default run options.
    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, inputs: Inputs) -> BoxFut<'a, Result<Outputs>>;
}

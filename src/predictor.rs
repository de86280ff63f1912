//! Program-level configuration around one signature.
//!
//! A [`Predictor`] owns a signature plus the settings a program fixes for it
//! (adapter, demos, callbacks, retry limit). Per-call [`RunOptions`] override
//! it field by field; anything neither sets falls back to the [`ExecCtx`].

use crate::adapter::Adapter;
use crate::callbacks::{Callback, CallbackChain};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::payload::{BoxFut, Payload};
use crate::pipeline::{execute, RunOptions};
use crate::retry::RetryConfig;
use crate::signature::Signature;
use crate::types::{Demo, Inputs, Outputs};
use std::sync::Arc;

/// A signature bound to program-level settings.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use signature_pipeline::{
///     types, ExecCtx, Field, JsonAdapter, MockLm, Predictor, RetryConfig, RunOptions, Signature,
/// };
///
/// # async fn demo() -> signature_pipeline::Result<()> {
/// let sig = Signature::builder("summarize")
///     .instructions("Summarize the text in one sentence.")
///     .input(Field::string("text"))
///     .output(Field::string("summary"))
///     .build()?;
///
/// let predictor = Predictor::new(sig)
///     .with_adapter(Arc::new(JsonAdapter))
///     .with_retry(RetryConfig::new(2));
///
/// let ctx = ExecCtx::builder(Arc::new(MockLm::fixed(r#"{"summary": "Short."}"#))).build();
/// let out = predictor
///     .run(&ctx, &types::inputs(json!({"text": "A long text."}))?, &RunOptions::new())
///     .await?;
/// assert_eq!(out.get_str("summary"), Some("Short."));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Predictor {
    signature: Arc<Signature>,
    adapter: Option<Arc<dyn Adapter>>,
    demos: Vec<Demo>,
    callbacks: Vec<Arc<dyn Callback>>,
    retry: Option<RetryConfig>,
}

impl Predictor {
    pub fn new(signature: impl Into<Arc<Signature>>) -> Self {
        Self {
            signature: signature.into(),
            adapter: None,
            demos: Vec::new(),
            callbacks: Vec::new(),
            retry: None,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn demos(&self) -> &[Demo] {
        &self.demos
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Few-shot demos, rendered in the order given.
    pub fn with_demos(mut self, demos: Vec<Demo>) -> Self {
        self.demos = demos;
        self
    }

    pub fn with_demo(mut self, demo: Demo) -> Self {
        self.demos.push(demo);
        self
    }

    /// Register a program-level callback.
    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Run once, resolving each setting per-call → program → context.
    pub async fn run(
        &self,
        ctx: &ExecCtx,
        inputs: &Inputs,
        options: &RunOptions,
    ) -> Result<Outputs> {
        let adapter = options
            .adapter
            .as_ref()
            .or(self.adapter.as_ref())
            .unwrap_or(&ctx.adapter);
        let demos = options.demos.as_deref().unwrap_or(&self.demos);
        let retry = match options.max_output_retries {
            Some(n) => RetryConfig::new(n),
            None => self.retry.unwrap_or_default(),
        };
        let chain = CallbackChain::merge(&ctx.callbacks, &self.callbacks, &options.callbacks);

        execute(
            ctx,
            &self.signature,
            inputs,
            adapter.as_ref(),
            demos,
            retry,
            &chain,
        )
        .await
    }
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("signature", &self.signature.name())
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .field("demos", &self.demos.len())
            .field("callbacks", &self.callbacks.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Payload for Predictor {
    fn kind(&self) -> &'static str {
        "predictor"
    }

    fn name(&self) -> &str {
        self.signature.name()
    }

    fn invoke<'a>(&'a self, ctx: &'a ExecCtx, inputs: Inputs) -> BoxFut<'a, Result<Outputs>> {
        Box::pin(async move { self.run(ctx, &inputs, &RunOptions::default()).await })
    }
}

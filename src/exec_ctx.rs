//! Execution context shared across invocations.
//!
//! [`ExecCtx`] carries the language model, its configuration, transport
//! backoff, the default adapter, global callbacks, a cancellation handle and
//! an optional per-call timeout. Build it once and share it (by reference)
//! across every predictor and concurrent invocation.

use crate::adapter::{Adapter, ChatAdapter};
use crate::backend::{with_backoff, BackoffConfig, LanguageModel, LmConfig, LmRequest, LmResponse};
use crate::callbacks::Callback;
use crate::error::Result;
use crate::PipelineError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Shared execution context.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use signature_pipeline::{ExecCtx, JsonAdapter, LmConfig, MockLm};
///
/// let ctx = ExecCtx::builder(Arc::new(MockLm::fixed("{}")))
///     .lm_config(LmConfig::new("gpt-4o-mini").with_temperature(0.0))
///     .adapter(Arc::new(JsonAdapter))
///     .build();
/// assert_eq!(ctx.adapter.name(), "json");
/// ```
pub struct ExecCtx {
    /// Model used for every main call.
    pub lm: Arc<dyn LanguageModel>,
    pub lm_config: LmConfig,
    /// Transport retry configuration. Default: [`BackoffConfig::none()`].
    pub backoff: BackoffConfig,
    /// Adapter used when neither the predictor nor the call picks one.
    /// Default: [`ChatAdapter`].
    pub adapter: Arc<dyn Adapter>,
    /// Global callbacks, dispatched before program and per-call ones.
    pub callbacks: Vec<Arc<dyn Callback>>,
    /// Optional cancellation flag, checked before every LM call.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Upper bound on one LM call, transport retries included.
    pub timeout: Option<Duration>,
}

impl ExecCtx {
    /// Start a context around the main model; everything else defaults.
    pub fn builder(lm: Arc<dyn LanguageModel>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            lm,
            lm_config: None,
            backoff: None,
            adapter: None,
            callbacks: Vec::new(),
            cancellation: None,
            timeout: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check_cancelled(&self) -> Result<()> {
        match self.is_cancelled() {
            true => Err(PipelineError::Cancelled),
            false => Ok(()),
        }
    }

    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.cancellation.as_deref()
    }

    /// Run one LM call with this context's backoff, cancellation and timeout.
    ///
    /// `lm` and `config` are explicit so that secondary models (the
    /// two-step extraction model) share the same transport policy.
    pub async fn call(
        &self,
        lm: &Arc<dyn LanguageModel>,
        config: &LmConfig,
        request: &LmRequest,
    ) -> Result<LmResponse> {
        self.check_cancelled()?;

        let call = with_backoff(lm, config, request, &self.backoff, self.cancel_flag());
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| PipelineError::Timeout(limit))??,
            None => call.await?,
        };

        if response.choices.is_empty() {
            return Err(PipelineError::Transport("LM returned no choices".into()));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("lm", &self.lm.name())
            .field("model", &self.lm_config.model)
            .field("backoff", &self.backoff)
            .field("adapter", &self.adapter.name())
            .field("callbacks", &self.callbacks.len())
            .field("has_cancellation", &self.cancellation.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    lm: Arc<dyn LanguageModel>,
    lm_config: Option<LmConfig>,
    backoff: Option<BackoffConfig>,
    adapter: Option<Arc<dyn Adapter>>,
    callbacks: Vec<Arc<dyn Callback>>,
    cancellation: Option<Arc<AtomicBool>>,
    timeout: Option<Duration>,
}

impl ExecCtxBuilder {
    /// Default: [`LmConfig::default()`].
    pub fn lm_config(mut self, config: LmConfig) -> Self {
        self.lm_config = Some(config);
        self
    }

    /// Transport retry policy. Default: [`BackoffConfig::none()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Fallback adapter. Default: [`ChatAdapter`].
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Add a global callback; global callbacks run in registration order.
    pub fn callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Share a flag that aborts in-flight and future calls once raised.
    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    /// Bound each LM call. Default: no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ExecCtx {
        ExecCtx {
            lm: self.lm,
            lm_config: self.lm_config.unwrap_or_default(),
            backoff: self.backoff.unwrap_or_else(BackoffConfig::none),
            adapter: self.adapter.unwrap_or_else(|| Arc::new(ChatAdapter)),
            callbacks: self.callbacks,
            cancellation: self.cancellation,
            timeout: self.timeout,
        }
    }
}

//! The adapter pipeline: format → call → parse, with bounded output retry.
//!
//! One invocation runs up to `max_output_retries + 1` attempts. Each attempt
//! renders a request with the chosen adapter, calls the model through
//! [`ExecCtx::call`] (transport backoff lives there), and parses the reply.
//! A retryable output error with budget left feeds its error list back into
//! the next attempt; anything else ends the invocation.
//!
//! ```text
//! preflight ─► [format ─► call ─► parse] ─► Success ──────► Outputs
//!                  ▲                   │
//!                  └─ RetryFeedback ◄──┴─ Attempting(n+1)
//!                                      └─ Exhausted ──────► PipelineError
//! ```

use crate::adapter::{Adapter, AdapterOptions};
use crate::callbacks::{Callback, CallbackChain, CallbackEvent, CallId, EventMeta, Phase};
use crate::error::{PipelineError, Result};
use crate::exec_ctx::ExecCtx;
use crate::retry::{feedback_prompt, RetryConfig, RetryFeedback, RetryState};
use crate::signature::Signature;
use crate::types::{Demo, Inputs, Outputs};
use serde_json::{json, Value};
use std::sync::Arc;

/// Per-call options. Anything left unset falls back to the program level,
/// then to the [`ExecCtx`].
///
/// ```
/// use std::sync::Arc;
/// use signature_pipeline::{JsonAdapter, RunOptions};
///
/// let opts = RunOptions::new()
///     .with_adapter(Arc::new(JsonAdapter))
///     .with_max_output_retries(2);
/// assert_eq!(opts.max_output_retries, Some(2));
/// ```
#[derive(Clone, Default)]
pub struct RunOptions {
    pub adapter: Option<Arc<dyn Adapter>>,
    pub demos: Option<Vec<Demo>>,
    pub max_output_retries: Option<u32>,
    /// Per-call callbacks, dispatched after global and program ones.
    pub callbacks: Vec<Arc<dyn Callback>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_demos(mut self, demos: Vec<Demo>) -> Self {
        self.demos = Some(demos);
        self
    }

    /// Extra attempts on retryable output errors (capped at 5).
    pub fn with_max_output_retries(mut self, retries: u32) -> Self {
        self.max_output_retries = Some(retries);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .field("demos", &self.demos.as_ref().map(Vec::len))
            .field("max_output_retries", &self.max_output_retries)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Run a signature once against the context's model.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use signature_pipeline::{pipeline, types, ExecCtx, Field, MockLm, RunOptions, Signature};
///
/// # async fn demo() -> signature_pipeline::Result<()> {
/// let sig = Signature::builder("qa")
///     .input(Field::string("question"))
///     .output(Field::string("answer"))
///     .build()?;
/// let ctx = ExecCtx::builder(Arc::new(MockLm::fixed(
///     "[[ ## answer ## ]]\n4\n\n[[ ## completed ## ]]",
/// )))
/// .build();
///
/// let inputs = types::inputs(json!({"question": "2+2?"}))?;
/// let out = pipeline::run(&ctx, &sig, &inputs, &RunOptions::new()).await?;
/// assert_eq!(out.get_str("answer"), Some("4"));
/// # Ok(())
/// # }
/// ```
pub async fn run(
    ctx: &ExecCtx,
    signature: &Signature,
    inputs: &Inputs,
    options: &RunOptions,
) -> Result<Outputs> {
    let adapter = options.adapter.as_ref().unwrap_or(&ctx.adapter);
    let demos = options.demos.as_deref().unwrap_or_default();
    let retry = RetryConfig::new(options.max_output_retries.unwrap_or(0));
    let chain = CallbackChain::merge(&ctx.callbacks, &[], &options.callbacks);
    execute(ctx, signature, inputs, adapter.as_ref(), demos, retry, &chain).await
}

/// Run with already-resolved configuration.
pub(crate) async fn execute(
    ctx: &ExecCtx,
    signature: &Signature,
    inputs: &Inputs,
    adapter: &dyn Adapter,
    demos: &[Demo],
    retry: RetryConfig,
    chain: &CallbackChain,
) -> Result<Outputs> {
    adapter.preflight()?;

    let invocation = Invocation {
        ctx,
        signature,
        inputs,
        adapter,
        demos,
        chain,
        call_id: CallId::new(),
    };
    tracing::debug!(
        call_id = %invocation.call_id,
        adapter = adapter.name(),
        signature = signature.name(),
        max_output_retries = retry.max_output_retries,
        "invocation start"
    );

    let mut opts = AdapterOptions {
        retry: None,
        attempt: 1,
    };
    let mut state = RetryState::start();
    loop {
        let (outcome, raw) = invocation.attempt(&opts).await;
        state = state.advance(&outcome, &retry);
        match (state, outcome) {
            (RetryState::Attempting(next), Err(err)) => {
                tracing::warn!(
                    call_id = %invocation.call_id,
                    attempt = opts.attempt,
                    adapter = adapter.name(),
                    error_kind = %err.kind(),
                    error = %err,
                    "output retry"
                );
                opts = AdapterOptions {
                    retry: Some(RetryFeedback {
                        previous_response: raw,
                        prompt: feedback_prompt(
                            signature,
                            &err,
                            &adapter.format_instructions(signature, &opts),
                        ),
                    }),
                    attempt: next,
                };
            }
            (_, outcome) => {
                match outcome {
                    Ok(_) => tracing::debug!(
                        call_id = %invocation.call_id,
                        attempts = opts.attempt,
                        "invocation succeeded"
                    ),
                    Err(ref e) => tracing::debug!(
                        call_id = %invocation.call_id,
                        attempts = opts.attempt,
                        error_kind = %e.kind(),
                        "invocation failed"
                    ),
                }
                return outcome;
            }
        }
    }
}

struct Invocation<'a> {
    ctx: &'a ExecCtx,
    signature: &'a Signature,
    inputs: &'a Inputs,
    adapter: &'a dyn Adapter,
    demos: &'a [Demo],
    chain: &'a CallbackChain,
    call_id: CallId,
}

impl Invocation<'_> {
    fn emit(&self, phase: Phase, attempt: u32, payload: Value) {
        if self.chain.is_empty() {
            return;
        }
        self.chain.dispatch(&CallbackEvent {
            call_id: self.call_id,
            phase,
            meta: EventMeta {
                adapter: self.adapter.name(),
                signature: self.signature.name().to_string(),
                attempt,
                model: self.ctx.lm_config.model.clone(),
            },
            payload,
        });
    }

    fn fail(&self, phase: Phase, attempt: u32, error: &PipelineError) {
        self.emit(
            phase,
            attempt,
            json!({
                "ok": false,
                "error_kind": error.kind().as_str(),
                "error": error.to_string(),
            }),
        );
    }

    /// One format → call → parse pass. Also returns the raw reply text, when
    /// the model produced one, for retry feedback.
    async fn attempt(&self, opts: &AdapterOptions) -> (Result<Outputs>, Option<String>) {
        let attempt = opts.attempt;

        self.emit(
            Phase::FormatStart,
            attempt,
            json!({ "inputs": self.inputs.keys().collect::<Vec<_>>() }),
        );
        let request = match self
            .adapter
            .format_request(self.signature, self.inputs, self.demos, opts)
        {
            Ok(request) => request,
            Err(e) => {
                self.fail(Phase::FormatEnd, attempt, &e);
                return (Err(e), None);
            }
        };
        self.emit(
            Phase::FormatEnd,
            attempt,
            json!({ "ok": true, "request": request.summary() }),
        );

        self.emit(Phase::CallStart, attempt, json!({ "request": request.summary() }));
        let response = match self
            .ctx
            .call(&self.ctx.lm, &self.ctx.lm_config, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.fail(Phase::CallEnd, attempt, &e);
                return (Err(e), None);
            }
        };
        self.emit(
            Phase::CallEnd,
            attempt,
            json!({
                "ok": true,
                "request": request.summary(),
                "usage": response.usage,
                "finish_reason": response.finish_reason(),
            }),
        );

        let raw = response.content().map(str::to_string);
        self.emit(
            Phase::ParseStart,
            attempt,
            json!({
                "content_length": raw.as_ref().map_or(0, String::len),
                "has_tool_calls": response.has_tool_calls(),
            }),
        );
        let outcome = self
            .adapter
            .parse_response(self.ctx, self.signature, &response, opts)
            .await;
        match outcome {
            Ok(ref outputs) => self.emit(
                Phase::ParseEnd,
                attempt,
                json!({
                    "ok": true,
                    "outputs": outputs.iter().map(|(name, _)| name).collect::<Vec<_>>(),
                }),
            ),
            Err(ref e) => self.fail(Phase::ParseEnd, attempt, e),
        }
        (outcome, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{inputs, qa, qa_with_history};
    use crate::adapter::{JsonAdapter, TwoStepAdapter};
    use crate::backend::{
        Choice, LmConfig, LmResponse, MockLm, MockReply, ResponseMessage, Role, WireFunction,
        WireToolCall,
    };
    use crate::callbacks::{EventRecorder, FnCallback};
    use crate::signature::Field;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    const CHAT_OK: &str = "[[ ## answer ## ]]\n4\n\n[[ ## completed ## ]]";

    fn ctx(mock: &Arc<MockLm>) -> ExecCtx {
        ExecCtx::builder(mock.clone())
            .lm_config(LmConfig::new("mock-model"))
            .build()
    }

    fn question() -> Inputs {
        inputs(json!({"question": "2+2?"}))
    }

    const ATTEMPT_PHASES: [Phase; 6] = [
        Phase::FormatStart,
        Phase::FormatEnd,
        Phase::CallStart,
        Phase::CallEnd,
        Phase::ParseStart,
        Phase::ParseEnd,
    ];

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let recorder = Arc::new(EventRecorder::new());
        let opts = RunOptions::new().with_callback(recorder.clone());

        let out = run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap();
        assert_eq!(out.get_str("answer"), Some("4"));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(recorder.phases(), ATTEMPT_PHASES.to_vec());

        let events = recorder.events();
        assert_eq!(events[0].meta.model, "mock-model");
        assert_eq!(events[0].meta.adapter, "chat");
        assert_eq!(events[3].payload["ok"], true);
        assert_eq!(events[3].payload["finish_reason"], "stop");
        assert_eq!(events[3].payload["request"]["message_count"], 2);
        assert_eq!(events[5].payload["outputs"], json!(["answer"]));
    }

    #[tokio::test]
    async fn test_phases_repeat_per_attempt_with_shared_call_id() {
        let mock = Arc::new(MockLm::texts(["no markers here", CHAT_OK]));
        let recorder = Arc::new(EventRecorder::new());
        let opts = RunOptions::new()
            .with_max_output_retries(2)
            .with_callback(recorder.clone());

        run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap();

        let expected: Vec<Phase> = ATTEMPT_PHASES.iter().chain(&ATTEMPT_PHASES).copied().collect();
        assert_eq!(recorder.phases(), expected);

        let events = recorder.events();
        assert!(events.iter().all(|e| e.call_id == events[0].call_id));
        assert_eq!(events[5].payload["ok"], false);
        assert_eq!(events[5].payload["error_kind"], "missing_required_outputs");
        assert_eq!(events[6].meta.attempt, 2);
    }

    #[tokio::test]
    async fn test_separate_invocations_get_separate_call_ids() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let recorder = Arc::new(EventRecorder::new());
        let ctx = ExecCtx::builder(mock.clone()).callback(recorder.clone()).build();

        run(&ctx, &qa(), &question(), &RunOptions::new()).await.unwrap();
        run(&ctx, &qa(), &question(), &RunOptions::new()).await.unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 12);
        assert_ne!(events[0].call_id, events[6].call_id);
    }

    #[tokio::test]
    async fn test_global_callbacks_precede_per_call() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| -> Arc<dyn Callback> {
            let log = log.clone();
            Arc::new(FnCallback(move |e: &CallbackEvent| -> anyhow::Result<()> {
                if e.phase == Phase::FormatStart {
                    log.lock().push(name);
                }
                Ok(())
            }))
        };
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let ctx = ExecCtx::builder(mock.clone())
            .callback(tag("global-1"))
            .callback(tag("global-2"))
            .build();
        let opts = RunOptions::new().with_callback(tag("call"));

        run(&ctx, &qa(), &question(), &opts).await.unwrap();
        assert_eq!(*log.lock(), vec!["global-1", "global-2", "call"]);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_change_outcome() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let recorder = Arc::new(EventRecorder::new());
        let opts = RunOptions::new()
            .with_callback(Arc::new(FnCallback(|_e: &CallbackEvent| -> anyhow::Result<()> {
                panic!("observer bug")
            })))
            .with_callback(Arc::new(FnCallback(|_e: &CallbackEvent| -> anyhow::Result<()> {
                anyhow::bail!("observer error")
            })))
            .with_callback(recorder.clone());

        let out = run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap();
        assert_eq!(out.get_str("answer"), Some("4"));
        assert_eq!(recorder.phases().len(), 6);
    }

    #[tokio::test]
    async fn test_retry_feeds_back_previous_reply_and_errors() {
        let mock = Arc::new(MockLm::texts(["The answer is four.", CHAT_OK]));
        let opts = RunOptions::new().with_max_output_retries(1);

        let out = run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap();
        assert_eq!(out.get_str("answer"), Some("4"));

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), requests[0].messages.len() + 2);
        let replay = &requests[1].messages[requests[1].messages.len() - 2];
        assert_eq!(replay.role, Role::Assistant);
        assert_eq!(replay.content, "The answer is four.");
        let feedback = &requests[1].messages.last().unwrap().content;
        assert!(feedback.contains("- $.answer: missing required output"));
        assert!(feedback.contains("[[ ## completed ## ]]"));
        assert!(feedback.contains("Output schema:"));
    }

    #[tokio::test]
    async fn test_json_retry_restates_json_instruction() {
        let mock = Arc::new(MockLm::texts(["[1, 2]", r#"{"answer": "4"}"#]));
        let opts = RunOptions::new()
            .with_adapter(Arc::new(JsonAdapter))
            .with_max_output_retries(1);

        run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap();
        let feedback = mock.last_request().unwrap().messages.last().unwrap().content.clone();
        assert!(feedback.contains("top_level_array_not_allowed"));
        assert!(feedback.contains("Return JSON only"));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error_unchanged() {
        let mock = Arc::new(MockLm::fixed("nothing useful"));
        let opts = RunOptions::new().with_max_output_retries(2);

        let err = run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredOutputs { ref fields } if fields == &["answer"]));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let mock = Arc::new(MockLm::fixed("nothing useful"));
        let err = run(&ctx(&mock), &qa(), &question(), &RunOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "missing_required_outputs");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_history_fails_before_any_call() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let recorder = Arc::new(EventRecorder::new());
        let values = inputs(json!({"question": "q", "history": [{"question": "x"}, 3]}));
        let opts = RunOptions::new()
            .with_max_output_retries(3)
            .with_callback(recorder.clone());

        let err = run(&ctx(&mock), &qa_with_history(), &values, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidHistoryElement { index: 0, .. }));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(recorder.phases(), vec![Phase::FormatStart, Phase::FormatEnd]);
        assert_eq!(recorder.events()[1].payload["error_kind"], "invalid_history_element");
    }

    fn malformed_tool_call(arguments: &str) -> LmResponse {
        LmResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(vec![WireToolCall {
                        id: Some("c1".into()),
                        function: WireFunction {
                            name: "search".into(),
                            arguments: arguments.into(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        }
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_are_not_retried() {
        let sig = Signature::builder("agent")
            .input(Field::string("task"))
            .input(Field::tools("tools"))
            .output(Field::string("answer"))
            .output(Field::tool_calls("calls"))
            .build()
            .unwrap();
        let response = malformed_tool_call("{'q': 'rust',}");
        let mock = Arc::new(MockLm::new(vec![MockReply::Response(response)]));
        let opts = RunOptions::new().with_max_output_retries(3);

        let err = run(&ctx(&mock), &sig, &inputs(json!({"task": "find"})), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidToolCallArguments { ref name, .. } if name == "search"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_fail_without_tool_calls_output() {
        let sig = Signature::builder("agent")
            .input(Field::string("task"))
            .input(Field::tools("tools"))
            .output(Field::string("answer"))
            .build()
            .unwrap();
        let mock = Arc::new(MockLm::new(vec![MockReply::Response(malformed_tool_call(
            "{not json",
        ))]));
        let opts = RunOptions::new().with_max_output_retries(2);

        let err = run(&ctx(&mock), &sig, &inputs(json!({"task": "find"})), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "invalid_tool_call_arguments");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let recorder = Arc::new(EventRecorder::new());
        let ctx = ExecCtx::builder(mock.clone())
            .cancellation(Some(Arc::new(AtomicBool::new(true))))
            .callback(recorder.clone())
            .build();

        let err = run(&ctx, &qa(), &question(), &RunOptions::new().with_max_output_retries(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(recorder.phases().last(), Some(&Phase::CallEnd));
    }

    #[tokio::test]
    async fn test_two_step_end_to_end_with_retry() {
        let main = Arc::new(MockLm::fixed("Two plus two makes four."));
        let extractor = Arc::new(MockLm::texts(["[\"4\"]", r#"{"answer": "4"}"#]));
        let adapter = TwoStepAdapter::new().with_extraction_lm(extractor.clone(), LmConfig::new("small"));
        let opts = RunOptions::new()
            .with_adapter(Arc::new(adapter))
            .with_max_output_retries(1);

        let out = run(&ctx(&main), &qa(), &question(), &opts).await.unwrap();
        assert_eq!(out.get_str("answer"), Some("4"));
        assert_eq!(main.call_count(), 2);
        assert_eq!(extractor.call_count(), 2);

        for request in main.requests() {
            assert!(request.messages.iter().all(|m| !m.content.contains("Return JSON only")));
        }
        let second = &extractor.requests()[1];
        assert!(second.messages[1].content.starts_with("Text:\nTwo plus two makes four."));
        assert!(second.messages[1].content.contains("top_level_array_not_allowed"));
    }

    #[tokio::test]
    async fn test_two_step_without_extraction_lm_makes_no_call() {
        let mock = Arc::new(MockLm::fixed("x"));
        let recorder = Arc::new(EventRecorder::new());
        let opts = RunOptions::new()
            .with_adapter(Arc::new(TwoStepAdapter::new()))
            .with_callback(recorder.clone());

        let err = run(&ctx(&mock), &qa(), &question(), &opts).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionLmNotConfigured));
        assert_eq!(mock.call_count(), 0);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_invocations_share_context() {
        let mock = Arc::new(MockLm::fixed(CHAT_OK));
        let ctx = ctx(&mock);
        let sig = qa();
        let values: Vec<Inputs> = (0..8)
            .map(|i| inputs(json!({"question": format!("q{i}")})))
            .collect();

        let opts = RunOptions::new();
        let results =
            futures::future::join_all(values.iter().map(|v| run(&ctx, &sig, v, &opts))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(mock.call_count(), 8);
    }
}

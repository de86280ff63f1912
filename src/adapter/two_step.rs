//! Two-call adapter: free-form main call, then structured extraction.
//!
//! The main model answers in whatever form it likes; its prompt carries the
//! task and field descriptions but no output-format instructions. A second,
//! separately configured extraction model then re-expresses that text as the
//! JSON object the JSON adapter expects, and the JSON adapter's strict parser
//! reads it. Output-retry feedback goes into the extraction request only.

use super::default::render_lines;
use super::json::{json_instructions, parse_json_outputs};
use super::{clean_reply, prepare, split_tool_calls, Adapter, AdapterOptions};
use crate::backend::{ChatMessage, LanguageModel, LmConfig, LmRequest, LmResponse};
use crate::error::{PipelineError, Result};
use crate::exec_ctx::ExecCtx;
use crate::prompt::{describe_fields, join_blocks};
use crate::signature::Signature;
use crate::types::{Demo, Inputs, Outputs};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

const EXTRACTION_PREAMBLE: &str = "You extract structured data. Read the text you are given and restate its content as the requested fields. Do not add information that is not in the text.";

#[derive(Clone)]
struct Extraction {
    lm: Arc<dyn LanguageModel>,
    config: LmConfig,
}

/// Adapter issuing a main call and an extraction call per attempt.
///
/// ```
/// use std::sync::Arc;
/// use signature_pipeline::adapter::{Adapter, TwoStepAdapter};
/// use signature_pipeline::backend::{LmConfig, MockLm};
///
/// let unconfigured = TwoStepAdapter::new();
/// assert!(unconfigured.preflight().is_err());
///
/// let adapter = TwoStepAdapter::new()
///     .with_extraction_lm(Arc::new(MockLm::fixed("{}")), LmConfig::new("small-model"));
/// assert!(adapter.preflight().is_ok());
/// ```
#[derive(Clone, Default)]
pub struct TwoStepAdapter {
    extraction: Option<Extraction>,
}

impl TwoStepAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model (and its config) used for the extraction call.
    pub fn with_extraction_lm(mut self, lm: Arc<dyn LanguageModel>, config: LmConfig) -> Self {
        self.extraction = Some(Extraction { lm, config });
        self
    }

    /// The request sent to the extraction model.
    pub fn extraction_request(
        &self,
        signature: &Signature,
        main_text: &str,
        opts: &AdapterOptions,
    ) -> LmRequest {
        let system = join_blocks([
            EXTRACTION_PREAMBLE.to_string(),
            format!("Fields to extract:\n{}", describe_fields(signature.text_outputs())),
            json_instructions(signature),
        ]);
        let mut user = format!("Text:\n{main_text}");
        if let Some(ref feedback) = opts.retry {
            user.push_str("\n\n");
            user.push_str(&feedback.prompt);
        }
        LmRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
    }

    async fn extract(
        &self,
        ctx: &ExecCtx,
        signature: &Signature,
        main_text: &str,
        opts: &AdapterOptions,
    ) -> Result<Outputs> {
        let extraction = self
            .extraction
            .as_ref()
            .ok_or(PipelineError::ExtractionLmNotConfigured)?;
        let main_text = clean_reply(main_text)?;
        let request = self.extraction_request(signature, &main_text, opts);

        tracing::debug!(
            adapter = "two_step",
            lm = extraction.lm.name(),
            attempt = opts.attempt,
            "extraction call"
        );
        let reply = ctx.call(&extraction.lm, &extraction.config, &request).await?;

        self.parse_outputs(signature, reply.content().unwrap_or_default(), opts)
            .map_err(|inner| PipelineError::ExtractionParseFailed {
                inner: Box::new(inner),
            })
    }
}

impl fmt::Debug for TwoStepAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoStepAdapter")
            .field(
                "extraction_lm",
                &self.extraction.as_ref().map(|e| e.lm.name()),
            )
            .finish()
    }
}

#[async_trait]
impl Adapter for TwoStepAdapter {
    fn name(&self) -> &'static str {
        "two_step"
    }

    fn preflight(&self) -> Result<()> {
        match self.extraction {
            Some(_) => Ok(()),
            None => Err(PipelineError::ExtractionLmNotConfigured),
        }
    }

    /// Format instructions of the extraction call.
    fn format_instructions(&self, signature: &Signature, _opts: &AdapterOptions) -> String {
        json_instructions(signature)
    }

    fn format_request(
        &self,
        signature: &Signature,
        inputs: &Inputs,
        demos: &[Demo],
        _opts: &AdapterOptions,
    ) -> Result<LmRequest> {
        let prepared = prepare(signature, inputs)?;

        let system = join_blocks([
            signature.instructions().to_string(),
            format!("You are given:\n{}", describe_fields(signature.text_inputs())),
            format!("Work out:\n{}", describe_fields(signature.text_outputs())),
        ]);

        let mut messages = Vec::with_capacity(1 + 2 * (demos.len() + prepared.turns.len()) + 1);
        messages.push(ChatMessage::system(system));
        for demo in demos {
            messages.push(ChatMessage::user(render_lines(signature.text_inputs(), &demo.inputs)));
            messages.push(ChatMessage::assistant(render_lines(
                signature.text_outputs(),
                &demo.outputs,
            )));
        }
        for turn in &prepared.turns {
            messages.push(ChatMessage::user(render_lines(signature.text_inputs(), &turn.inputs)));
            messages.push(ChatMessage::assistant(render_lines(
                signature.text_outputs(),
                &turn.outputs,
            )));
        }
        messages.push(ChatMessage::user(render_lines(
            signature.text_inputs(),
            &prepared.current,
        )));

        Ok(LmRequest {
            messages,
            tools: prepared.tools,
        })
    }

    /// Parse the extraction model's reply.
    fn parse_outputs(
        &self,
        signature: &Signature,
        raw: &str,
        _opts: &AdapterOptions,
    ) -> Result<Outputs> {
        parse_json_outputs(signature, raw)
    }

    async fn parse_response(
        &self,
        ctx: &ExecCtx,
        signature: &Signature,
        response: &LmResponse,
        opts: &AdapterOptions,
    ) -> Result<Outputs> {
        let split = split_tool_calls(signature, response)?;
        let outputs = if split.skip_text {
            Outputs::new()
        } else {
            self.extract(ctx, signature, response.content().unwrap_or_default(), opts)
                .await?
        };
        Ok(split.finish(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{inputs, qa, qa_with_history};
    use crate::backend::{MockLm, MockReply};
    use crate::retry::RetryFeedback;
    use crate::signature::Field;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx(main: Arc<MockLm>) -> ExecCtx {
        ExecCtx::builder(main).build()
    }

    fn with_rationale() -> Signature {
        Signature::builder("qa")
            .instructions("Answer the question.")
            .input(Field::string("question"))
            .output(Field::string("answer"))
            .output(Field::string("rationale"))
            .build()
            .unwrap()
    }

    #[test]
    fn main_prompt_has_no_format_instructions() {
        let sig = with_rationale();
        let adapter = TwoStepAdapter::new();
        let opts = AdapterOptions {
            retry: Some(RetryFeedback {
                previous_response: Some("bad".into()),
                prompt: "Return JSON only, please".into(),
            }),
            attempt: 2,
        };
        let req = adapter
            .format_request(&sig, &inputs(json!({"question": "why?"})), &[], &opts)
            .unwrap();
        let instructions = adapter.format_instructions(&sig, &opts);
        for message in &req.messages {
            assert!(!message.content.contains(&instructions));
            assert!(!message.content.contains("Return JSON only"));
            assert!(!message.content.contains("[[ ##"));
        }
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[1].content, "Question: why?");
    }

    #[test]
    fn history_absent_matches_no_history_field() {
        let adapter = TwoStepAdapter::new();
        let plain = adapter
            .format_request(&qa(), &inputs(json!({"question": "q"})), &[], &AdapterOptions::default())
            .unwrap();
        let empty = adapter
            .format_request(
                &qa_with_history(),
                &inputs(json!({"question": "q", "history": null})),
                &[],
                &AdapterOptions::default(),
            )
            .unwrap();
        assert_eq!(plain, empty);
    }

    #[test]
    fn extraction_request_carries_retry_prompt() {
        let opts = AdapterOptions {
            retry: Some(RetryFeedback {
                previous_response: None,
                prompt: "Errors:\n- $.answer: missing required output".into(),
            }),
            attempt: 2,
        };
        let req = TwoStepAdapter::new().extraction_request(&qa(), "It is 4.", &opts);
        assert_eq!(req.messages.len(), 2);
        assert!(req.messages[0].content.contains("Return JSON only"));
        assert!(req.messages[1].content.starts_with("Text:\nIt is 4."));
        assert!(req.messages[1].content.contains("$.answer: missing required output"));
    }

    #[tokio::test]
    async fn extraction_reply_is_parsed() {
        let main = Arc::new(MockLm::fixed("unused"));
        let extractor = Arc::new(MockLm::fixed(r#"{"answer": "4"}"#));
        let adapter = TwoStepAdapter::new().with_extraction_lm(extractor.clone(), LmConfig::default());

        let out = adapter
            .parse_response(&ctx(main), &qa(), &LmResponse::text("It is 4."), &AdapterOptions::default())
            .await
            .unwrap();
        assert_eq!(out.get_str("answer"), Some("4"));
        assert_eq!(extractor.call_count(), 1);
        assert!(extractor.requests()[0].messages[1].content.contains("It is 4."));
    }

    #[tokio::test]
    async fn extraction_failure_is_wrapped() {
        let extractor = Arc::new(MockLm::fixed("[1, 2]"));
        let adapter = TwoStepAdapter::new().with_extraction_lm(extractor, LmConfig::default());
        let err = adapter
            .parse_response(
                &ctx(Arc::new(MockLm::fixed(""))),
                &qa(),
                &LmResponse::text("It is 4."),
                &AdapterOptions::default(),
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::ExtractionParseFailed { inner } => {
                assert_eq!(inner.kind().as_str(), "output_decode_failed")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn extraction_transport_error_is_not_wrapped() {
        let extractor = Arc::new(MockLm::new(vec![MockReply::error(400, "bad")]));
        let adapter = TwoStepAdapter::new().with_extraction_lm(extractor, LmConfig::default());
        let err = adapter
            .parse_response(
                &ctx(Arc::new(MockLm::fixed(""))),
                &qa(),
                &LmResponse::text("It is 4."),
                &AdapterOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "http_error");
    }
}

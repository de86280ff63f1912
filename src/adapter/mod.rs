//! Adapters: signature + inputs → LM request, LM reply → typed outputs.
//!
//! Four variants share one trait and are selected by value
//! (`Arc<dyn Adapter>`):
//!
//! | Adapter | Prompt style | Reply format |
//! |---------|--------------|--------------|
//! | [`DefaultAdapter`] | one prompt of `Name: value` lines, numbered examples | `Name: value` lines |
//! | [`ChatAdapter`] | system message, demos and history as message pairs | `[[ ## field ## ]]` sections |
//! | [`JsonAdapter`] | system message with the output schema | one JSON object, every key present |
//! | [`TwoStepAdapter`] | free-form main call, then an extraction call | JSON, via the extraction LM |
//!
//! Every adapter renders history as user/assistant pairs before the current
//! turn and declared tools into [`LmRequest::tools`]. An absent, `null` or
//! empty history renders exactly like a signature without a history field.

pub mod chat;
pub mod default;
pub mod json;
pub mod two_step;

pub use chat::ChatAdapter;
pub use default::DefaultAdapter;
pub use json::JsonAdapter;
pub use two_step::TwoStepAdapter;

use crate::backend::{ChatMessage, LmRequest, LmResponse};
use crate::error::{PipelineError, Result};
use crate::exec_ctx::ExecCtx;
use crate::history::{parse_history, Turn};
use crate::output_parser::{cast_text, preprocess, DecodeFailure};
use crate::retry::RetryFeedback;
use crate::signature::{Field, Signature};
use crate::tools::{declarations_from_input, extract_tool_calls, ToolCall, ToolSpec};
use crate::types::{Demo, FieldValue, Inputs, Outputs};
use async_trait::async_trait;
use serde_json::Value;

/// Per-attempt options handed to an adapter by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Feedback from the previous failed attempt, if this is a retry.
    pub retry: Option<RetryFeedback>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Renders requests for, and parses replies from, one prompt convention.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identifier used in events and logs.
    fn name(&self) -> &'static str;

    /// Configuration checks that must pass before any LM call.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// The instruction telling the model how to lay out its reply.
    fn format_instructions(&self, signature: &Signature, opts: &AdapterOptions) -> String;

    /// Build the LM request for one attempt.
    fn format_request(
        &self,
        signature: &Signature,
        inputs: &Inputs,
        demos: &[Demo],
        opts: &AdapterOptions,
    ) -> Result<LmRequest>;

    /// Parse raw reply text into the signature's text outputs.
    ///
    /// Pure: the same text always yields the same outcome.
    fn parse_outputs(
        &self,
        signature: &Signature,
        raw: &str,
        opts: &AdapterOptions,
    ) -> Result<Outputs>;

    /// Turn a full LM response into outputs: structured tool calls first,
    /// then the reply text.
    async fn parse_response(
        &self,
        _ctx: &ExecCtx,
        signature: &Signature,
        response: &LmResponse,
        opts: &AdapterOptions,
    ) -> Result<Outputs> {
        with_tool_calls(signature, response, |text| {
            self.parse_outputs(signature, text, opts)
        })
    }
}

/// Inputs checked and split for rendering.
#[derive(Debug, Clone, Default)]
pub(crate) struct Prepared {
    pub turns: Vec<Turn>,
    pub tools: Option<Vec<ToolSpec>>,
    /// Text input values present for the current turn, in signature order.
    pub current: Inputs,
}

/// Validate inputs, history and tool declarations before rendering.
pub(crate) fn prepare(signature: &Signature, inputs: &Inputs) -> Result<Prepared> {
    let turns = match signature.history_field() {
        Some(field) => parse_history(signature, inputs.get(&field.name))?,
        None => Vec::new(),
    };
    let tools = match signature.tool_declarations_field() {
        Some(field) => declarations_from_input(&field.name, inputs.get(&field.name))?,
        None => None,
    };

    let mut current = Inputs::new();
    for field in signature.text_inputs() {
        match inputs.get(&field.name) {
            Some(Value::Null) | None if field.required => {
                return Err(PipelineError::MissingInput {
                    field: field.name.clone(),
                })
            }
            Some(Value::Null) | None => {}
            Some(value) => {
                current.insert(field.name.clone(), value.clone());
            }
        }
    }

    Ok(Prepared {
        turns,
        tools,
        current,
    })
}

/// Values of `fields` present in `values`, in field order.
pub(crate) fn present<'a>(
    fields: impl Iterator<Item = &'a Field>,
    values: &'a Inputs,
) -> impl Iterator<Item = (&'a Field, &'a Value)> {
    fields.filter_map(move |f| match values.get(&f.name) {
        None | Some(Value::Null) => None,
        Some(v) => Some((f, v)),
    })
}

/// Append the previous reply and the corrective prompt after the current turn.
pub(crate) fn push_feedback(messages: &mut Vec<ChatMessage>, opts: &AdapterOptions) {
    if let Some(ref feedback) = opts.retry {
        if let Some(ref previous) = feedback.previous_response {
            messages.push(ChatMessage::assistant(previous.clone()));
        }
        messages.push(ChatMessage::user(feedback.prompt.clone()));
    }
}

/// Cast marker-delimited sections into outputs (text adapters).
///
/// Missing required fields are reported together; the first field (in
/// signature order) that fails to cast is reported alone.
pub(crate) fn outputs_from_sections(
    signature: &Signature,
    sections: &[(String, String)],
) -> Result<Outputs> {
    let lookup = |name: &str| {
        sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, text)| text.as_str())
            .filter(|text| !text.trim().is_empty())
    };

    let missing: Vec<String> = signature
        .text_outputs()
        .filter(|f| f.required && lookup(&f.name).is_none())
        .map(|f| f.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingRequiredOutputs { fields: missing });
    }

    let mut outputs = Outputs::new();
    for field in signature.text_outputs() {
        if let Some(text) = lookup(&field.name) {
            outputs.insert(field.name.clone(), cast_text(field, text)?);
        }
    }
    Ok(outputs)
}

/// Preprocess raw reply text, failing on an empty reply.
pub(crate) fn clean_reply(raw: &str) -> Result<String> {
    let cleaned = preprocess(raw);
    if cleaned.is_empty() {
        return Err(PipelineError::decode(DecodeFailure::EmptyResponse));
    }
    Ok(cleaned)
}

/// Tool calls read from a response, pending merge into the outputs.
pub(crate) struct ToolCallSplit<'a> {
    field: Option<&'a Field>,
    calls: Vec<ToolCall>,
    /// The reply carries tool calls and no text: text outputs are not parsed.
    pub skip_text: bool,
}

impl ToolCallSplit<'_> {
    /// Add the `tool_calls` output (an empty list when the model made none).
    pub fn finish(self, mut outputs: Outputs) -> Outputs {
        if let Some(field) = self.field {
            outputs.insert(field.name.clone(), FieldValue::ToolCalls(self.calls));
        }
        outputs
    }
}

/// Read structured tool calls from a response.
///
/// Arguments are always decoded, so a malformed call fails the invocation
/// even when the signature has no `tool_calls` output to receive it.
pub(crate) fn split_tool_calls<'a>(
    signature: &'a Signature,
    response: &LmResponse,
) -> Result<ToolCallSplit<'a>> {
    let calls = extract_tool_calls(response)?;
    let field = signature.tool_calls_field();
    let blank = response.content().unwrap_or_default().trim().is_empty();
    Ok(ToolCallSplit {
        skip_text: field.is_some() && !calls.is_empty() && blank,
        field,
        calls,
    })
}

/// Shared tool-call handling around a text parser.
pub(crate) fn with_tool_calls<F>(
    signature: &Signature,
    response: &LmResponse,
    parse_text: F,
) -> Result<Outputs>
where
    F: FnOnce(&str) -> Result<Outputs>,
{
    let split = split_tool_calls(signature, response)?;
    let outputs = if split.skip_text {
        Outputs::new()
    } else {
        parse_text(response.content().unwrap_or_default())?
    };
    Ok(split.finish(outputs))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::signature::{Field, Signature};

    pub fn qa() -> Signature {
        Signature::builder("qa")
            .instructions("Answer the question.")
            .input(Field::string("question").desc("The question"))
            .output(Field::string("answer").desc("A short answer"))
            .build()
            .unwrap()
    }

    pub fn qa_with_history() -> Signature {
        Signature::builder("qa")
            .instructions("Answer the question.")
            .input(Field::string("question").desc("The question"))
            .input(Field::history("history"))
            .output(Field::string("answer").desc("A short answer"))
            .build()
            .unwrap()
    }

    pub fn inputs(value: serde_json::Value) -> Inputs {
        crate::types::inputs(value).unwrap()
    }
}

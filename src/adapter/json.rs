//! JSON-object adapter.
//!
//! The model is told to return exactly one JSON object. Parsing is strict on
//! the keyset: every text output field must appear as a key, even fields
//! declared optional. Extra keys are dropped. A top-level array is rejected
//! as `top_level_array_not_allowed`.

use super::{clean_reply, prepare, present, push_feedback, Adapter, AdapterOptions};
use crate::backend::{ChatMessage, LmRequest};
use crate::error::{PipelineError, Result};
use crate::output_parser::{cast_value, decode_json_object};
use crate::prompt::{describe_fields, join_blocks, render_value};
use crate::signature::{Field, Signature};
use crate::types::{Demo, Inputs, Outputs};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Adapter exchanging a single JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

impl JsonAdapter {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn render_input_blocks<'a>(
    fields: impl Iterator<Item = &'a Field>,
    values: &'a Inputs,
) -> String {
    present(fields, values)
        .map(|(field, value)| format!("[[ ## {} ## ]]\n{}", field.name, render_value(value)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Output values as a compact JSON object in signature order.
fn render_object(signature: &Signature, outputs: &Inputs) -> String {
    let object: Map<String, Value> = present(signature.text_outputs(), outputs)
        .map(|(field, value)| (field.name.clone(), value.clone()))
        .collect();
    Value::Object(object).to_string()
}

/// "Return JSON only" instruction plus the output schema.
pub(crate) fn json_instructions(signature: &Signature) -> String {
    let keys: Vec<String> = signature
        .text_outputs()
        .map(|f| format!("`{}`", f.name))
        .collect();
    let schema = serde_json::to_string_pretty(&signature.output_schema())
        .unwrap_or_else(|_| signature.output_schema().to_string());
    format!(
        "Return JSON only: a single JSON object with the keys {}. Do not wrap it in markdown and do not add any other text.\nThe object must match this JSON schema:\n{}",
        keys.join(", "),
        schema
    )
}

/// Decode a reply into outputs with the strict keyset rule.
pub(crate) fn parse_json_outputs(signature: &Signature, raw: &str) -> Result<Outputs> {
    let text = clean_reply(raw)?;
    let object = decode_json_object(&text).map_err(PipelineError::decode)?;

    let missing: Vec<String> = signature
        .text_outputs()
        .filter(|f| !object.contains_key(&f.name))
        .map(|f| f.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingRequiredOutputs { fields: missing });
    }

    let mut outputs = Outputs::new();
    for field in signature.text_outputs() {
        match object.get(&field.name) {
            Some(Value::Null) if !field.required => {}
            Some(value) => outputs.insert(field.name.clone(), cast_value(field, value)?),
            None => {}
        }
    }
    Ok(outputs)
}

#[async_trait]
impl Adapter for JsonAdapter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn format_instructions(&self, signature: &Signature, _opts: &AdapterOptions) -> String {
        json_instructions(signature)
    }

    fn format_request(
        &self,
        signature: &Signature,
        inputs: &Inputs,
        demos: &[Demo],
        opts: &AdapterOptions,
    ) -> Result<LmRequest> {
        let prepared = prepare(signature, inputs)?;

        let system = join_blocks([
            format!("Your input fields are:\n{}", describe_fields(signature.text_inputs())),
            format!("Your output fields are:\n{}", describe_fields(signature.text_outputs())),
            signature.instructions().to_string(),
            self.format_instructions(signature, opts),
        ]);

        let mut messages = Vec::with_capacity(1 + 2 * (demos.len() + prepared.turns.len()) + 3);
        messages.push(ChatMessage::system(system));
        for demo in demos {
            messages.push(ChatMessage::user(render_input_blocks(
                signature.text_inputs(),
                &demo.inputs,
            )));
            messages.push(ChatMessage::assistant(render_object(signature, &demo.outputs)));
        }
        for turn in &prepared.turns {
            messages.push(ChatMessage::user(render_input_blocks(
                signature.text_inputs(),
                &turn.inputs,
            )));
            messages.push(ChatMessage::assistant(render_object(signature, &turn.outputs)));
        }
        messages.push(ChatMessage::user(render_input_blocks(
            signature.text_inputs(),
            &prepared.current,
        )));
        push_feedback(&mut messages, opts);

        Ok(LmRequest {
            messages,
            tools: prepared.tools,
        })
    }

    fn parse_outputs(
        &self,
        signature: &Signature,
        raw: &str,
        _opts: &AdapterOptions,
    ) -> Result<Outputs> {
        parse_json_outputs(signature, raw)
    }
}

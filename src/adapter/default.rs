//! `Name: value` line adapter.
//!
//! The whole current turn is one user message: instructions, field
//! descriptions, the reply format, numbered examples and finally the input
//! lines. History turns precede it as user/assistant pairs rendered with the
//! same `Name: value` lines.
//!
//! Replies are read line by line: a line starting with a field's marker
//! (`Final Answer:`) or name (`final_answer:`) opens that field, and the
//! value runs until the next such line.

use super::{
    clean_reply, outputs_from_sections, prepare, present, push_feedback, Adapter, AdapterOptions,
};
use crate::backend::{ChatMessage, LmRequest};
use crate::error::Result;
use crate::prompt::{describe_fields, join_blocks, render_value};
use crate::signature::{Field, FieldKind, Signature};
use crate::types::{Demo, Inputs, Outputs};
use async_trait::async_trait;

/// Adapter speaking plain `Name: value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAdapter;

impl DefaultAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// `Marker: value` lines for the fields present in `values`.
pub(crate) fn render_lines<'a>(
    fields: impl Iterator<Item = &'a Field>,
    values: &'a Inputs,
) -> String {
    present(fields, values)
        .map(|(field, value)| format!("{}: {}", field.marker(), render_value(value)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn type_hint(field: &Field) -> String {
    match (field.kind, &field.schema) {
        (FieldKind::Json, Some(schema)) => format!(
            "<JSON matching the schema {}>",
            schema.as_value()
        ),
        (kind, _) => format!("<{}>", kind.label()),
    }
}

/// Split a reply into `(field_name, text)` sections.
fn split_sections(signature: &Signature, text: &str) -> Vec<(String, String)> {
    let headers: Vec<(String, String, String)> = signature
        .text_outputs()
        .map(|f| {
            (
                f.name.clone(),
                f.marker().to_lowercase(),
                f.name.to_lowercase(),
            )
        })
        .collect();

    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in text.lines() {
        if let Some((name, first)) = match_header(&headers, line) {
            if let Some((done, body)) = current.take() {
                push_section(&mut sections, done, body);
            }
            current = Some((name, vec![first]));
        } else if let Some((_, ref mut body)) = current {
            body.push(line.to_string());
        }
    }
    if let Some((done, body)) = current {
        push_section(&mut sections, done, body);
    }
    sections
}

fn push_section(sections: &mut Vec<(String, String)>, name: String, body: Vec<String>) {
    if sections.iter().any(|(n, _)| *n == name) {
        return;
    }
    sections.push((name, body.join("\n").trim().to_string()));
}

/// Match `Marker: rest` / `name: rest`, case-insensitively, tolerating
/// markdown emphasis around the label.
fn match_header(headers: &[(String, String, String)], line: &str) -> Option<(String, String)> {
    let stripped = line.trim_start().trim_start_matches(['*', '#', ' ']);
    let colon = stripped.find(':')?;
    let label = stripped[..colon].trim().trim_end_matches('*').trim().to_lowercase();
    let rest = stripped[colon + 1..]
        .trim_start_matches('*')
        .trim()
        .to_string();
    headers
        .iter()
        .find(|(_, marker, name)| label == *marker || label == *name)
        .map(|(field, _, _)| (field.clone(), rest))
}

#[async_trait]
impl Adapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn format_instructions(&self, signature: &Signature, _opts: &AdapterOptions) -> String {
        let lines: Vec<String> = signature
            .text_outputs()
            .map(|f| format!("{}: {}", f.marker(), type_hint(f)))
            .collect();
        format!(
            "Respond with one line per output field, each starting with its marker:\n{}\nA value may continue on the following lines until the next marker.",
            lines.join("\n")
        )
    }

    fn format_request(
        &self,
        signature: &Signature,
        inputs: &Inputs,
        demos: &[Demo],
        opts: &AdapterOptions,
    ) -> Result<LmRequest> {
        let prepared = prepare(signature, inputs)?;

        let mut messages = Vec::with_capacity(prepared.turns.len() * 2 + 3);
        for turn in &prepared.turns {
            messages.push(ChatMessage::user(render_lines(
                signature.text_inputs(),
                &turn.inputs,
            )));
            messages.push(ChatMessage::assistant(render_lines(
                signature.text_outputs(),
                &turn.outputs,
            )));
        }

        let examples: Vec<String> = demos
            .iter()
            .enumerate()
            .map(|(i, demo)| {
                let body: Vec<String> = [
                    render_lines(signature.text_inputs(), &demo.inputs),
                    render_lines(signature.text_outputs(), &demo.outputs),
                ]
                .into_iter()
                .filter(|block| !block.is_empty())
                .collect();
                format!("Example {}:\n{}", i + 1, body.join("\n"))
            })
            .collect();

        let prompt = join_blocks([
            signature.instructions().to_string(),
            format!("Input fields:\n{}", describe_fields(signature.text_inputs())),
            format!("Output fields:\n{}", describe_fields(signature.text_outputs())),
            self.format_instructions(signature, opts),
            examples.join("\n\n"),
            render_lines(signature.text_inputs(), &prepared.current),
        ]);
        messages.push(ChatMessage::user(prompt));
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
        let text = clean_reply(raw)?;
        let mut sections = split_sections(signature, &text);

        // A lone output field may be answered without its marker.
        let mut outputs = signature.text_outputs();
        if let (Some(only), None) = (outputs.next(), outputs.next()) {
            if sections.is_empty() {
                sections.push((only.name.clone(), text.clone()));
            }
        }

        outputs_from_sections(signature, &sections)
    }
}

//! Chat-style adapter with `[[ ## field ## ]]` section markers.
//!
//! Request layout:
//!
//! ```text
//! system     instructions, field list, reply structure
//! user/asst  one pair per demo
//! user/asst  one pair per history turn
//! user       current inputs + reply reminder
//! ```

use super::{
    clean_reply, outputs_from_sections, prepare, present, push_feedback, Adapter, AdapterOptions,
};
use crate::backend::{ChatMessage, LmRequest};
use crate::error::Result;
use crate::prompt::{describe_fields, join_blocks, render_value};
use crate::signature::{Field, FieldKind, Signature};
use crate::types::{Demo, Inputs, Outputs};
use async_trait::async_trait;

const COMPLETED: &str = "completed";

/// Adapter using bracketed section markers and one message per turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatAdapter;

impl ChatAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn header(name: &str) -> String {
    format!("[[ ## {name} ## ]]")
}

fn render_sections<'a>(fields: impl Iterator<Item = &'a Field>, values: &'a Inputs) -> String {
    present(fields, values)
        .map(|(field, value)| format!("{}\n{}", header(&field.name), render_value(value)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_reply(signature: &Signature, outputs: &Inputs) -> String {
    join_blocks([
        render_sections(signature.text_outputs(), outputs),
        header(COMPLETED),
    ])
}

fn placeholder(field: &Field) -> String {
    match (field.kind, &field.schema) {
        (FieldKind::String, _) => format!("{{{}}}", field.name),
        (FieldKind::Json, Some(schema)) => format!(
            "{{{}}}        # must be JSON matching the schema: {}",
            field.name,
            schema.as_value()
        ),
        (kind, _) => format!("{{{}}}        # must be a single {} value", field.name, kind.label()),
    }
}

/// Name of the field a `[[ ## name ## ]]` line opens, if it is one.
fn parse_header(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("[[ ##")?
        .strip_suffix("## ]]")
        .map(str::trim)
}

fn split_sections(signature: &Signature, text: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    let mut flush = |current: &mut Option<(String, Vec<&str>)>| {
        if let Some((name, body)) = current.take() {
            if !sections.iter().any(|(n, _)| *n == name) {
                sections.push((name, body.join("\n").trim().to_string()));
            }
        }
    };

    for line in text.lines() {
        match parse_header(line) {
            Some(name) if name == COMPLETED => {
                flush(&mut current);
                break;
            }
            Some(name) => {
                flush(&mut current);
                // Unknown headers end the previous section and are dropped.
                if signature.text_outputs().any(|f| f.name == name) {
                    current = Some((name.to_string(), Vec::new()));
                }
            }
            None => {
                if let Some((_, ref mut body)) = current {
                    body.push(line);
                }
            }
        }
    }
    flush(&mut current);
    sections
}

#[async_trait]
impl Adapter for ChatAdapter {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn format_instructions(&self, signature: &Signature, _opts: &AdapterOptions) -> String {
        let order: Vec<String> = signature
            .text_outputs()
            .map(|f| format!("`{}`", header(&f.name)))
            .collect();
        format!(
            "Respond with the corresponding output fields, starting with the field {}, and then ending with the marker for `{}`.",
            order.join(", then "),
            header(COMPLETED)
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

        let structure: Vec<String> = signature
            .text_inputs()
            .map(|f| format!("{}\n{{{}}}", header(&f.name), f.name))
            .chain(
                signature
                    .text_outputs()
                    .map(|f| format!("{}\n{}", header(&f.name), placeholder(f))),
            )
            .chain(std::iter::once(header(COMPLETED)))
            .collect();

        let system = join_blocks([
            format!("Your input fields are:\n{}", describe_fields(signature.text_inputs())),
            format!("Your output fields are:\n{}", describe_fields(signature.text_outputs())),
            format!(
                "All interactions will be structured in the following way, with the appropriate values filled in.\n\n{}",
                structure.join("\n\n")
            ),
            signature.instructions().to_string(),
        ]);

        let mut messages = Vec::with_capacity(1 + 2 * (demos.len() + prepared.turns.len()) + 3);
        messages.push(ChatMessage::system(system));

        for demo in demos {
            messages.push(ChatMessage::user(render_sections(
                signature.text_inputs(),
                &demo.inputs,
            )));
            messages.push(ChatMessage::assistant(render_reply(signature, &demo.outputs)));
        }
        for turn in &prepared.turns {
            messages.push(ChatMessage::user(render_sections(
                signature.text_inputs(),
                &turn.inputs,
            )));
            messages.push(ChatMessage::assistant(render_reply(signature, &turn.outputs)));
        }

        messages.push(ChatMessage::user(join_blocks([
            render_sections(signature.text_inputs(), &prepared.current),
            self.format_instructions(signature, opts),
        ])));
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
        outputs_from_sections(signature, &split_sections(signature, &text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{inputs, qa, qa_with_history};
    use crate::backend::Role;
    use crate::signature::FieldSchema;
    use crate::tools::{ToolParameter, ToolSpec};
    use crate::types::FieldValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn system_message_leads_and_demos_are_pairs() {
        let demos = vec![Demo::new(
            inputs(json!({"question": "1+1?"})),
            inputs(json!({"answer": "2"})),
        )];
        let req = ChatAdapter
            .format_request(&qa(), &inputs(json!({"question": "q"})), &demos, &AdapterOptions::default())
            .unwrap();
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert!(req.messages[0].content.contains("Answer the question."));
        assert_eq!(req.messages[1].content, "[[ ## question ## ]]\n1+1?");
        assert_eq!(
            req.messages[2].content,
            "[[ ## answer ## ]]\n2\n\n[[ ## completed ## ]]"
        );
        assert!(req.messages[3].content.starts_with("[[ ## question ## ]]\nq\n\nRespond with"));
    }

    #[test]
    fn history_absent_matches_no_history_field() {
        let plain = ChatAdapter
            .format_request(&qa(), &inputs(json!({"question": "q"})), &[], &AdapterOptions::default())
            .unwrap();
        for history in [json!(null), json!([]), json!({"messages": []})] {
            let values = inputs(json!({"question": "q", "history": history}));
            let req = ChatAdapter
                .format_request(&qa_with_history(), &values, &[], &AdapterOptions::default())
                .unwrap();
            assert_eq!(req, plain);
        }
    }

    #[test]
    fn history_pairs_follow_demos_and_precede_current_turn() {
        let demos = vec![Demo::new(
            inputs(json!({"question": "demo q"})),
            inputs(json!({"answer": "demo a"})),
        )];
        let values = inputs(json!({
            "question": "now",
            "history": [{"question": "earlier q", "answer": "earlier a"}]
        }));
        let req = ChatAdapter
            .format_request(&qa_with_history(), &values, &demos, &AdapterOptions::default())
            .unwrap();
        assert_eq!(req.messages.len(), 6);
        assert!(req.messages[1].content.contains("demo q"));
        assert!(req.messages[3].content.contains("earlier q"));
        assert!(req.messages[4].content.contains("earlier a"));
        let current = &req.messages[5].content;
        assert!(current.contains("now"));
        assert!(!current.contains("earlier"));
    }

    #[test]
    fn tools_render_into_request() {
        let sig = Signature::builder("agent")
            .input(Field::string("task"))
            .input(Field::tools("tools"))
            .output(Field::string("answer"))
            .build()
            .unwrap();
        let tools = vec![ToolSpec::new("search", "Search").param(ToolParameter::new("q", "string").required())];
        let values = inputs(json!({"task": "t", "tools": tools}));
        let req = ChatAdapter
            .format_request(&sig, &values, &[], &AdapterOptions::default())
            .unwrap();
        assert_eq!(req.tools.as_ref().unwrap()[0].name, "search");
        assert!(!req.messages[0].content.contains("tools"));

        let bare = ChatAdapter
            .format_request(&sig, &inputs(json!({"task": "t", "tools": []})), &[], &AdapterOptions::default())
            .unwrap();
        assert!(bare.tools.is_none());
        assert!(bare.to_wire().get("tools").is_none());
    }

    #[test]
    fn parses_sections_and_ignores_unknown_headers() {
        let sig = Signature::builder("s")
            .output(Field::string("reasoning"))
            .output(Field::json("plan").with_schema(FieldSchema::new(json!({
                "type": "object", "required": ["steps"]
            }))))
            .build()
            .unwrap();
        let raw = "[[ ## reasoning ## ]]\nThink.\nHard.\n\n[[ ## scratch ## ]]\nignored\n\n[[ ## plan ## ]]\n```json\n{\"steps\": [1,],}\n```\n\n[[ ## completed ## ]]\ntrailing";
        let out = ChatAdapter
            .parse_outputs(&sig, raw, &AdapterOptions::default())
            .unwrap();
        assert_eq!(out.get_str("reasoning"), Some("Think.\nHard."));
        assert_eq!(out.get("plan"), Some(&FieldValue::Json(json!({"steps": [1]}))));
    }

    #[test]
    fn schema_violation_surfaces_all_errors() {
        let sig = Signature::builder("s")
            .output(Field::json("plan").with_schema(FieldSchema::new(json!({
                "type": "object",
                "required": ["steps", "owner"]
            }))))
            .build()
            .unwrap();
        let err = ChatAdapter
            .parse_outputs(&sig, "[[ ## plan ## ]]\n{}", &AdapterOptions::default())
            .unwrap_err();
        match err {
            crate::PipelineError::OutputValidationFailed { field, errors } => {
                assert_eq!(field, "plan");
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_section_is_missing_output() {
        let err = ChatAdapter
            .parse_outputs(&qa(), "The answer is 4.", &AdapterOptions::default())
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "missing_required_outputs");
    }
}

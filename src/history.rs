//! Conversation history carried by a `history` input field.
//!
//! A history value is an ordered list of turns. Each turn is a JSON object
//! keyed by the signature's field names; its input-field entries become the
//! user side of the turn, its output-field entries the assistant side.
//! Adapters decide how each side is rendered.
//!
//! Accepted shapes:
//!
//! - absent or `null` (no history)
//! - `[{...}, {...}]`
//! - `{"messages": [{...}, {...}]}`

use crate::error::{PipelineError, Result};
use crate::output_parser::json_type_name;
use crate::signature::{Field, Signature};
use crate::types::Inputs;
use serde_json::Value;

/// One prior turn, split by the signature into its two sides.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Values of text input fields, in signature order.
    pub inputs: Inputs,
    /// Values of text output fields, in signature order.
    pub outputs: Inputs,
}

/// Validate and split a history value.
///
/// Every turn is checked before anything is rendered, so a malformed history
/// fails before the LM is ever called.
///
/// ```
/// use serde_json::json;
/// use signature_pipeline::history::parse_history;
/// use signature_pipeline::signature::{Field, Signature};
///
/// let sig = Signature::builder("qa")
///     .input(Field::string("question"))
///     .input(Field::history("history"))
///     .output(Field::string("answer"))
///     .build()
///     .unwrap();
///
/// let turns = parse_history(&sig, Some(&json!([{"question": "hi", "answer": "hello"}]))).unwrap();
/// assert_eq!(turns.len(), 1);
/// assert_eq!(turns[0].outputs["answer"], "hello");
/// ```
pub fn parse_history(signature: &Signature, value: Option<&Value>) -> Result<Vec<Turn>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(Value::Object(obj)) => match obj.get("messages") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(PipelineError::InvalidHistoryValue {
                    reason: format!(
                        "\"messages\" must be an array, got {}",
                        json_type_name(other)
                    ),
                })
            }
            None => {
                return Err(PipelineError::InvalidHistoryValue {
                    reason: "object history must carry a \"messages\" array".into(),
                })
            }
        },
        Some(other) => {
            return Err(PipelineError::InvalidHistoryValue {
                reason: format!(
                    "expected a list of turns, got {}",
                    json_type_name(other)
                ),
            })
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let obj = item
                .as_object()
                .ok_or_else(|| PipelineError::InvalidHistoryElement {
                    index,
                    reason: format!("expected an object, got {}", json_type_name(item)),
                })?;
            Ok(Turn {
                inputs: side(obj, signature.text_inputs(), index, "input")?,
                outputs: side(obj, signature.text_outputs(), index, "output")?,
            })
        })
        .collect()
}

fn side<'a>(
    turn: &Inputs,
    fields: impl Iterator<Item = &'a Field>,
    index: usize,
    which: &str,
) -> Result<Inputs> {
    let mut values = Inputs::new();
    for field in fields {
        match turn.get(&field.name) {
            Some(Value::Null) | None if field.required => {
                return Err(PipelineError::InvalidHistoryElement {
                    index,
                    reason: format!("missing required {} field '{}'", which, field.name),
                })
            }
            Some(Value::Null) | None => {}
            Some(value) => {
                values.insert(field.name.clone(), value.clone());
            }
        }
    }
    Ok(values)
}

//! Prompt rendering helpers shared by the adapters.

use crate::signature::Field;
use serde_json::Value;

/// Render an input or output value as prompt text.
///
/// Strings render raw; everything else renders as compact JSON.
///
/// ```
/// use serde_json::json;
/// use signature_pipeline::prompt::render_value;
///
/// assert_eq!(render_value(&json!("hello")), "hello");
/// assert_eq!(render_value(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
/// ```
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numbered field descriptions: ``1. `question` (string): The question``.
pub fn describe_fields<'a>(fields: impl IntoIterator<Item = &'a Field>) -> String {
    let mut out = String::new();
    for (n, field) in fields.into_iter().enumerate() {
        if n > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{}. `{}` ({})", n + 1, field.name, field.kind.label()));
        if !field.required {
            out.push_str(" [optional]");
        }
        if !field.description.is_empty() {
            out.push_str(": ");
            out.push_str(&field.description);
        }
    }
    out
}

/// Join non-empty blocks with a blank line between them.
pub fn join_blocks(blocks: impl IntoIterator<Item = String>) -> String {
    blocks
        .into_iter()
        .filter(|b| !b.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

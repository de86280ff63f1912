//! Type checks, schema validation and casting into [`FieldValue`].
//!
//! Two entry points: [`cast_text`] for text adapters, where a value arrives
//! as the raw text following a field marker, and [`cast_value`] for JSON
//! adapters, where it arrives as an already-decoded JSON value.

use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::output_parser::decode::decode_json_value;
use crate::output_parser::error::{json_type_name, truncate, ValidationIssue};
use crate::signature::{Field, FieldKind};
use crate::types::FieldValue;

/// Validate `value` against a JSON Schema, collecting every violation.
///
/// Paths are rooted at the field: `$.plan.steps[0]`.
///
/// ```
/// use serde_json::json;
/// use signature_pipeline::output_parser::validate_schema;
///
/// let schema = json!({"type": "object", "required": ["n"], "properties": {"n": {"type": "integer"}}});
/// assert!(validate_schema("item", &schema, &json!({"n": 1})).is_empty());
/// let issues = validate_schema("item", &schema, &json!({"n": "x"}));
/// assert_eq!(issues[0].path, "$.item.n");
/// ```
pub fn validate_schema(field: &str, schema: &Value, value: &Value) -> Vec<ValidationIssue> {
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => {
            return vec![ValidationIssue::new(
                format!("$.{field}"),
                format!("schema does not compile: {e}"),
            )]
        }
    };
    // Bound first: the error iterator borrows `compiled` and must drop before it.
    let issues = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                ValidationIssue::new(
                    pointer_to_path(field, &e.instance_path.to_string()),
                    e.to_string(),
                )
            })
            .collect(),
    };
    issues
}

/// `/steps/0/name` under field `plan` → `$.plan.steps[0].name`.
fn pointer_to_path(field: &str, pointer: &str) -> String {
    let mut path = format!("$.{field}");
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
            path.push('[');
            path.push_str(&segment);
            path.push(']');
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}

fn type_error(field: &Field, expected: &str, got: &Value) -> PipelineError {
    PipelineError::OutputValidationFailed {
        field: field.name.clone(),
        errors: vec![ValidationIssue::new(
            format!("$.{}", field.name),
            format!("expected {}, got {}", expected, json_type_name(got)),
        )],
    }
}

fn text_error(field: &Field, expected: &str, text: &str) -> PipelineError {
    PipelineError::OutputValidationFailed {
        field: field.name.clone(),
        errors: vec![ValidationIssue::new(
            format!("$.{}", field.name),
            format!("expected {}, got {:?}", expected, truncate(text, 80)),
        )],
    }
}

/// Cast a decoded JSON value into the field's declared type.
///
/// Scalars are type-checked strictly: a string never becomes an integer.
/// A `json` field given a string tries to decode that string first, since
/// models often double-encode nested objects.
pub fn cast_value(field: &Field, value: &Value) -> Result<FieldValue> {
    match field.kind {
        FieldKind::String => match value {
            Value::String(s) => Ok(FieldValue::String(s.clone())),
            other => Err(type_error(field, "string", other)),
        },
        FieldKind::Integer => {
            if let Some(n) = value.as_i64() {
                return Ok(FieldValue::Integer(n));
            }
            match value.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(FieldValue::Integer(f as i64))
                }
                _ => Err(type_error(field, "integer", value)),
            }
        }
        FieldKind::Float => value
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| type_error(field, "number", value)),
        FieldKind::Boolean => value
            .as_bool()
            .map(FieldValue::Boolean)
            .ok_or_else(|| type_error(field, "boolean", value)),
        FieldKind::Json => {
            let value = match (value, &field.schema) {
                (Value::String(s), Some(schema))
                    if schema.as_value().get("type") != Some(&Value::from("string")) =>
                {
                    decode_json_value(s)
                        .map(|d| d.value)
                        .unwrap_or_else(|_| value.clone())
                }
                _ => value.clone(),
            };
            if let Some(ref schema) = field.schema {
                let errors = validate_schema(&field.name, schema.as_value(), &value);
                if !errors.is_empty() {
                    return Err(PipelineError::OutputValidationFailed {
                        field: field.name.clone(),
                        errors,
                    });
                }
            }
            Ok(FieldValue::Json(value))
        }
        FieldKind::ToolDeclarations | FieldKind::ToolCalls | FieldKind::History => {
            Err(PipelineError::InvalidSignature(format!(
                "field '{}' of kind {} is not parsed from model output",
                field.name,
                field.kind.label()
            )))
        }
    }
}

/// Parse the raw text of a field (text adapters) into its declared type.
pub fn cast_text(field: &Field, text: &str) -> Result<FieldValue> {
    let trimmed = text.trim();
    match field.kind {
        FieldKind::String => Ok(FieldValue::String(trimmed.to_string())),
        FieldKind::Integer => {
            let token = scalar_token(trimmed);
            if let Ok(n) = token.parse::<i64>() {
                return Ok(FieldValue::Integer(n));
            }
            match token.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(FieldValue::Integer(f as i64))
                }
                _ => Err(text_error(field, "integer", trimmed)),
            }
        }
        FieldKind::Float => scalar_token(trimmed)
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float)
            .ok_or_else(|| text_error(field, "number", trimmed)),
        FieldKind::Boolean => match scalar_token(trimmed).to_ascii_lowercase().as_str() {
            "true" => Ok(FieldValue::Boolean(true)),
            "false" => Ok(FieldValue::Boolean(false)),
            _ => Err(text_error(field, "boolean", trimmed)),
        },
        FieldKind::Json => {
            let decoded = decode_json_value(trimmed).map_err(PipelineError::decode)?;
            cast_value(field, &decoded.value)
        }
        FieldKind::ToolDeclarations | FieldKind::ToolCalls | FieldKind::History => {
            cast_value(field, &Value::Null)
        }
    }
}

/// Strip wrapping quotes and a trailing period from a scalar answer.
fn scalar_token(text: &str) -> &str {
    let text = text.trim_end_matches('.').trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
        .trim()
}

//! Raw LM text → JSON value.
//!
//! The decode pipeline, in order:
//!
//! 1. strip think blocks and markdown code fences
//! 2. parse as-is
//! 3. cut out the outermost `[...]` when a list opens first, else the
//!    outermost `{...}`
//! 4. apply [`try_repair_json`] to whatever candidate is left
//!
//! Each step runs only when the previous one failed to produce JSON.

use serde_json::{Map, Value};

use crate::output_parser::error::{json_type_name, truncate, DecodeFailure};
use crate::output_parser::extract::{first_opening, find_outermost, preprocess, strip_code_fence};
use crate::output_parser::repair::try_repair_json;

/// A successfully decoded value plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    /// `true` when a textual repair was needed.
    pub repaired: bool,
}

/// Decode any JSON value (object, array or scalar) from raw LM text.
pub fn decode_json_value(raw: &str) -> Result<Decoded, DecodeFailure> {
    let cleaned = preprocess(raw);
    if cleaned.is_empty() {
        return Err(DecodeFailure::EmptyResponse);
    }
    let candidate = strip_code_fence(&cleaned).unwrap_or(&cleaned);

    let first_err = match serde_json::from_str::<Value>(candidate) {
        Ok(value) => {
            return Ok(Decoded {
                value,
                repaired: false,
            })
        }
        Err(e) => e.to_string(),
    };
    let not_json = || DecodeFailure::NotJson {
        detail: truncate(&first_err, 200),
    };

    // An array-shaped payload is judged as a whole: cutting an object out
    // of it would hide the fact that the model answered with a list.
    if candidate.trim_start().starts_with('[') {
        return repair_candidate(candidate).ok_or_else(not_json);
    }
    if first_opening(candidate) == Some('[') {
        let array = find_outermost(candidate, '[', ']').and_then(parse_or_repair);
        if let Some(decoded) = array.filter(|d| d.value.is_array()) {
            return Ok(decoded);
        }
    }
    if let Some(decoded) = find_outermost(candidate, '{', '}').and_then(parse_or_repair) {
        return Ok(decoded);
    }
    repair_candidate(candidate).ok_or_else(not_json)
}

fn parse_or_repair(text: &str) -> Option<Decoded> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(Decoded {
            value,
            repaired: false,
        }),
        Err(_) => repair_candidate(text),
    }
}

fn repair_candidate(text: &str) -> Option<Decoded> {
    let repaired = try_repair_json(text)?;
    let value = serde_json::from_str::<Value>(&repaired).ok()?;
    Some(Decoded {
        value,
        repaired: true,
    })
}

/// Decode raw LM text that must hold a single top-level JSON object.
///
/// A top-level array is always [`DecodeFailure::TopLevelArrayNotAllowed`],
/// distinct from text that is not JSON at all.
///
/// # Examples
///
/// ```
/// use signature_pipeline::output_parser::{decode_json_object, DecodeFailure};
///
/// let obj = decode_json_object("```json\n{\"answer\": \"hi\",}\n```").unwrap();
/// assert_eq!(obj["answer"], "hi");
///
/// let err = decode_json_object("[{\"answer\": \"hi\"}]").unwrap_err();
/// assert_eq!(err, DecodeFailure::TopLevelArrayNotAllowed);
/// ```
pub fn decode_json_object(raw: &str) -> Result<Map<String, Value>, DecodeFailure> {
    let decoded = decode_json_value(raw)?;
    match decoded.value {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(DecodeFailure::TopLevelArrayNotAllowed),
        other => Err(DecodeFailure::NotAnObject {
            found: json_type_name(&other),
        }),
    }
}

//! Error types for output decoding and validation.

use std::fmt;

/// Why raw LM text could not be turned into a usable JSON value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeFailure {
    /// The LM response was empty or whitespace-only.
    #[error("empty LM response")]
    EmptyResponse,

    /// No JSON could be decoded, even after fence stripping, object
    /// extraction and repair.
    #[error("not valid JSON: {detail}")]
    NotJson {
        /// The serde error (or a short description) from the last attempt.
        detail: String,
    },

    /// The payload decoded to a JSON array where an object is required.
    #[error("top-level JSON array is not allowed; expected an object")]
    TopLevelArrayNotAllowed,

    /// The payload decoded to a scalar where an object is required.
    #[error("expected a JSON object, found {found}")]
    NotAnObject {
        /// JSON type name of what was found.
        found: &'static str,
    },
}

impl DecodeFailure {
    /// Stable snake_case reason tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeFailure::EmptyResponse => "empty_response",
            DecodeFailure::NotJson { .. } => "not_json",
            DecodeFailure::TopLevelArrayNotAllowed => "top_level_array_not_allowed",
            DecodeFailure::NotAnObject { .. } => "not_an_object",
        }
    }
}

/// One schema or type violation, addressed by a `$.path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSONPath-style location, e.g. `$.answer.items[0]`.
    pub path: String,
    /// Human-readable description of the violation.
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((idx, _)) => format!("{}...", &s[..idx]),
    }
}

/// JSON type name used in error messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

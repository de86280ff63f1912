use crate::output_parser::{DecodeFailure, ValidationIssue};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
///
/// Each variant maps to a stable tag via [`PipelineError::kind`]. The first
/// group is the output taxonomy the retry controller reasons about; the rest
/// are pre-flight, configuration and transport failures.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The history input is not a list of turns (or `{"messages": [...]}`).
    #[error("invalid history value: {reason}")]
    InvalidHistoryValue { reason: String },

    /// A history turn is malformed or misses a required field.
    #[error("invalid history element at index {index}: {reason}")]
    InvalidHistoryElement { index: usize, reason: String },

    /// Raw text could not be turned into valid JSON, even after repair.
    #[error("output decode failed ({}): {reason}", .reason.as_str())]
    OutputDecodeFailed { reason: DecodeFailure },

    /// Declared output fields are absent from the response.
    #[error("missing required outputs: {}", .fields.join(", "))]
    MissingRequiredOutputs { fields: Vec<String> },

    /// A field decoded but failed type or schema validation.
    #[error("output field '{field}' failed validation: {}", join_issues(.errors))]
    OutputValidationFailed {
        field: String,
        errors: Vec<ValidationIssue>,
    },

    /// A structured tool call carried an `arguments` string that is not JSON.
    #[error("invalid arguments for tool call '{name}': {reason}")]
    InvalidToolCallArguments { name: String, reason: String },

    /// The two-step adapter has no extraction model.
    #[error("two-step adapter has no extraction LM configured")]
    ExtractionLmNotConfigured,

    /// The extraction call of the two-step adapter produced unusable output.
    #[error("extraction parse failed: {inner}")]
    ExtractionParseFailed { inner: Box<PipelineError> },

    /// A required input field was not supplied.
    #[error("missing input field '{field}'")]
    MissingInput { field: String },

    /// An input field was supplied with an unusable value.
    #[error("invalid value for input field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    /// The signature declaration is malformed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The transport returned a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` hint, if the transport supplied one.
        retry_after: Option<Duration>,
    },

    /// Connection-level transport failure.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The LM call did not finish within the configured timeout.
    #[error("LM call timed out after {0:?}")]
    Timeout(Duration),

    /// The invocation was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// The stable tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidHistoryValue { .. } => ErrorKind::InvalidHistoryValue,
            PipelineError::InvalidHistoryElement { .. } => ErrorKind::InvalidHistoryElement,
            PipelineError::OutputDecodeFailed { .. } => ErrorKind::OutputDecodeFailed,
            PipelineError::MissingRequiredOutputs { .. } => ErrorKind::MissingRequiredOutputs,
            PipelineError::OutputValidationFailed { .. } => ErrorKind::OutputValidationFailed,
            PipelineError::InvalidToolCallArguments { .. } => ErrorKind::InvalidToolCallArguments,
            PipelineError::ExtractionLmNotConfigured => ErrorKind::ExtractionLmNotConfigured,
            PipelineError::ExtractionParseFailed { .. } => ErrorKind::ExtractionParseFailed,
            PipelineError::MissingInput { .. } => ErrorKind::MissingInput,
            PipelineError::InvalidInput { .. } => ErrorKind::InvalidInput,
            PipelineError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            PipelineError::HttpError { .. } => ErrorKind::HttpError,
            PipelineError::Transport(_) => ErrorKind::Transport,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Json(_) => ErrorKind::Json,
            PipelineError::Other(_) => ErrorKind::Other,
        }
    }

    /// Shorthand for an `OutputDecodeFailed` error.
    pub fn decode(reason: DecodeFailure) -> Self {
        PipelineError::OutputDecodeFailed { reason }
    }
}

/// Tag of a [`PipelineError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHistoryValue,
    InvalidHistoryElement,
    OutputDecodeFailed,
    MissingRequiredOutputs,
    OutputValidationFailed,
    InvalidToolCallArguments,
    ExtractionLmNotConfigured,
    ExtractionParseFailed,
    MissingInput,
    InvalidInput,
    InvalidSignature,
    HttpError,
    Transport,
    Timeout,
    Cancelled,
    Json,
    Other,
}

impl ErrorKind {
    /// snake_case tag, as reported in callback payloads and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidHistoryValue => "invalid_history_value",
            ErrorKind::InvalidHistoryElement => "invalid_history_element",
            ErrorKind::OutputDecodeFailed => "output_decode_failed",
            ErrorKind::MissingRequiredOutputs => "missing_required_outputs",
            ErrorKind::OutputValidationFailed => "output_validation_failed",
            ErrorKind::InvalidToolCallArguments => "invalid_tool_call_arguments",
            ErrorKind::ExtractionLmNotConfigured => "extraction_lm_not_configured",
            ErrorKind::ExtractionParseFailed => "extraction_parse_failed",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::HttpError => "http_error",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Json => "json",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_message_carries_reason_tag() {
        let err = PipelineError::decode(DecodeFailure::TopLevelArrayNotAllowed);
        assert_eq!(err.kind(), ErrorKind::OutputDecodeFailed);
        assert!(err.to_string().contains("top_level_array_not_allowed"));
    }

    #[test]
    fn test_validation_error_lists_every_issue() {
        let err = PipelineError::OutputValidationFailed {
            field: "plan".into(),
            errors: vec![
                ValidationIssue::new("$.plan.steps", "\"steps\" is a required property"),
                ValidationIssue::new("$.plan.owner", "1 is not of type \"string\""),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("$.plan.steps"));
        assert!(msg.contains("$.plan.owner"));
    }

    #[test]
    fn test_extraction_error_wraps_inner() {
        let err = PipelineError::ExtractionParseFailed {
            inner: Box::new(PipelineError::MissingRequiredOutputs {
                fields: vec!["answer".into()],
            }),
        };
        assert_eq!(err.kind().as_str(), "extraction_parse_failed");
        assert!(err.to_string().contains("answer"));
    }
}

//! Bounded output retry with error feedback.
//!
//! When a reply arrives but cannot be turned into valid outputs, the
//! pipeline may re-ask the model with a feedback prompt built here: the
//! errors by path, the adapter's output-format instruction restated, and the
//! output schema. The number of such retries is bounded by [`RetryConfig`]
//! and is entirely separate from transport backoff.

use crate::error::{PipelineError, Result};
use crate::output_parser::truncate;
use crate::signature::Signature;

/// Upper bound on `max_output_retries`.
pub const MAX_OUTPUT_RETRIES: u32 = 5;

const MAX_LISTED_ERRORS: usize = 20;
const MAX_ERROR_CHARS: usize = 200;
const MAX_INLINE_SCHEMA_CHARS: usize = 1500;

/// Configuration for output retries.
///
/// # Example
///
/// ```
/// use signature_pipeline::retry::RetryConfig;
///
/// assert_eq!(RetryConfig::default().max_output_retries, 0);
/// assert_eq!(RetryConfig::new(2).max_output_retries, 2);
/// assert_eq!(RetryConfig::new(10).max_output_retries, 5);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts after the first, on retryable output errors. Range: 0-5.
    pub max_output_retries: u32,
}

impl RetryConfig {
    pub fn new(max_output_retries: u32) -> Self {
        Self {
            max_output_retries: max_output_retries.min(MAX_OUTPUT_RETRIES),
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_output_retries + 1
    }
}

/// Whether an error may be answered with another model attempt.
///
/// Only output-shape failures qualify. Input, history, tool-argument,
/// configuration and transport errors are final.
pub fn is_retryable_output_error(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::OutputDecodeFailed { .. }
            | PipelineError::MissingRequiredOutputs { .. }
            | PipelineError::OutputValidationFailed { .. }
            | PipelineError::ExtractionParseFailed { .. }
    )
}

/// State of the retry loop for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (1-based) is about to run.
    Attempting(u32),
    Success,
    /// The last attempt failed and no further attempt is allowed.
    Exhausted,
}

impl RetryState {
    pub fn start() -> Self {
        RetryState::Attempting(1)
    }

    /// Transition after an attempt finished with `outcome`.
    ///
    /// ```
    /// use signature_pipeline::retry::{RetryConfig, RetryState};
    /// use signature_pipeline::PipelineError;
    ///
    /// let config = RetryConfig::new(1);
    /// let missing: Result<(), _> = Err(PipelineError::MissingRequiredOutputs { fields: vec!["a".into()] });
    ///
    /// let state = RetryState::start().advance(&missing, &config);
    /// assert_eq!(state, RetryState::Attempting(2));
    /// assert_eq!(state.advance(&missing, &config), RetryState::Exhausted);
    /// ```
    pub fn advance<T>(self, outcome: &Result<T>, config: &RetryConfig) -> RetryState {
        match (self, outcome) {
            (RetryState::Attempting(_), Ok(_)) => RetryState::Success,
            (RetryState::Attempting(n), Err(e))
                if is_retryable_output_error(e) && n < config.max_attempts() =>
            {
                RetryState::Attempting(n + 1)
            }
            (RetryState::Attempting(_), Err(_)) => RetryState::Exhausted,
            (done, _) => done,
        }
    }
}

/// What the next attempt is told about the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFeedback {
    /// The model's previous raw reply, replayed as an assistant message.
    pub previous_response: Option<String>,
    /// The corrective user message.
    pub prompt: String,
}

/// Build the corrective prompt for a failed attempt.
///
/// Holds a short header, the errors as a path-oriented list (each entry
/// truncated, the list capped), the adapter's output-format instruction and
/// the output schema. A schema too large to repeat is replaced by a stable
/// reference to the signature.
pub fn feedback_prompt(
    signature: &Signature,
    error: &PipelineError,
    format_instructions: &str,
) -> String {
    let lines = error_lines(error);
    let mut listed: Vec<String> = lines
        .iter()
        .take(MAX_LISTED_ERRORS)
        .map(|line| format!("- {}", truncate(line, MAX_ERROR_CHARS)))
        .collect();
    if lines.len() > MAX_LISTED_ERRORS {
        listed.push(format!("- ... and {} more", lines.len() - MAX_LISTED_ERRORS));
    }

    let schema = serde_json::to_string_pretty(&signature.output_schema())
        .unwrap_or_else(|_| signature.output_schema().to_string());
    let schema_block = if schema.chars().count() <= MAX_INLINE_SCHEMA_CHARS {
        format!("Output schema:\n{schema}")
    } else {
        let fields: Vec<&str> = signature.text_outputs().map(|f| f.name.as_str()).collect();
        format!(
            "Output schema: the schema of signature '{}' given above (fields: {}).",
            signature.name(),
            fields.join(", ")
        )
    };

    let mut sections = vec![
        "Your previous response could not be used. Fix the following errors and answer again."
            .to_string(),
        format!("Errors:\n{}", listed.join("\n")),
    ];
    if !format_instructions.trim().is_empty() {
        sections.push(format_instructions.trim().to_string());
    }
    sections.push(schema_block);
    sections.join("\n\n")
}

fn error_lines(error: &PipelineError) -> Vec<String> {
    match error {
        PipelineError::OutputValidationFailed { field, errors } => {
            if errors.is_empty() {
                vec![format!("$.{field}: invalid value")]
            } else {
                errors.iter().map(|e| e.to_string()).collect()
            }
        }
        PipelineError::MissingRequiredOutputs { fields } => fields
            .iter()
            .map(|f| format!("$.{f}: missing required output"))
            .collect(),
        PipelineError::OutputDecodeFailed { reason } => {
            vec![format!("$: {} ({})", reason, reason.as_str())]
        }
        PipelineError::ExtractionParseFailed { inner } => error_lines(inner),
        other => vec![format!("$: {other}")],
    }
}

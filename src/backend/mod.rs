//! LM transport contract and normalized request/response types.
//!
//! The [`LanguageModel`] trait is the only seam between the adapter pipeline
//! and a concrete model provider. Requests are a list of chat messages plus
//! optional tool declarations; responses follow the OpenAI-style
//! `choices[].message` shape so provider JSON deserializes directly.
//!
//! ```text
//! Adapter ──► LmRequest ──► with_backoff ──► LanguageModel::generate() ──► LmResponse
//!                               │
//!                        BackoffConfig (transport retries only)
//! ```

pub mod backoff;
pub mod mock;

pub use backoff::{with_backoff, BackoffConfig, JitterStrategy};
pub use mock::{MockLm, MockReply};

use crate::error::Result;
use crate::tools::ToolSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Who wrote a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One rendered chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A rendered, provider-agnostic LM request.
///
/// Adapters build this from a signature; transports translate it into their
/// own wire format. `tools` is `None` whenever no tools are declared, so a
/// request without tools is identical whether or not the signature could
/// carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

impl LmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: None,
        }
    }

    /// Compact description used in callback payloads.
    pub fn summary(&self) -> Value {
        json!({
            "message_count": self.messages.len(),
            "tool_count": self.tools.as_ref().map_or(0, Vec::len),
        })
    }

    /// OpenAI-style body: `{"messages": [...], "tools": [...]}`.
    pub fn to_wire(&self) -> Value {
        let mut body = json!({ "messages": self.messages });
        if let Some(ref tools) = self.tools {
            body["tools"] = Value::Array(tools.iter().map(ToolSpec::to_wire).collect());
        }
        body
    }
}

/// Sampling settings handed to the transport untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct LmConfig {
    pub model: String,
    pub temperature: f64,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Extra provider keys; the transport decides how to merge them.
    pub options: Option<Value>,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2048,
            options: None,
        }
    }
}

impl LmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// A function call as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    #[serde(default)]
    pub arguments: String,
}

/// A tool call as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub function: WireFunction,
}

/// The message of one response choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default = "default_assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

/// One response choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A normalized LM response.
///
/// ```
/// use signature_pipeline::backend::LmResponse;
///
/// let resp: LmResponse = serde_json::from_str(r#"{
///     "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
///     "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
/// }"#).unwrap();
/// assert_eq!(resp.content(), Some("hi"));
/// assert_eq!(resp.usage.unwrap().total_tokens, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl LmResponse {
    /// A single-choice text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ResponseMessage {
                    role: default_assistant_role(),
                    content: Some(content.into()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    /// Text content of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }

    /// Finish reason of the first choice.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first()?.finish_reason.as_deref()
    }

    /// Whether the first choice carries structured tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.choices
            .first()
            .and_then(|c| c.message.tool_calls.as_ref())
            .is_some_and(|calls| !calls.is_empty())
    }
}

/// One model provider, held as `Arc<dyn LanguageModel>`.
///
/// Transient failures must surface as
/// [`PipelineError::HttpError`](crate::PipelineError::HttpError) or
/// [`PipelineError::Transport`](crate::PipelineError::Transport); those are
/// the only errors [`with_backoff`] retries.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One completion for `request`.
    async fn generate(&self, config: &LmConfig, request: &LmRequest) -> Result<LmResponse>;

    /// Short name for log fields.
    fn name(&self) -> &'static str;
}

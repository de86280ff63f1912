//! Scripted language model for tests and demos.
//!
//! [`MockLm`] replays pre-configured replies in order and records every
//! request it receives, so tests can assert on exactly what an adapter
//! rendered.
//!
//! # Example
//!
//! ```
//! use signature_pipeline::backend::{MockLm, MockReply};
//!
//! let mock = MockLm::new(vec![
//!     MockReply::error(503, "busy"),
//!     MockReply::text("Answer: 4"),
//! ]);
//! assert_eq!(mock.call_count(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LanguageModel, LmConfig, LmRequest, LmResponse};
use crate::error::Result;
use crate::PipelineError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A plain text completion.
    Text(String),
    /// A full response (tool calls, usage, finish reason).
    Response(LmResponse),
    /// A transport failure with the given status.
    Error { status: u16, body: String },
}

impl MockReply {
    pub fn text(content: impl Into<String>) -> Self {
        MockReply::Text(content.into())
    }

    pub fn error(status: u16, body: impl Into<String>) -> Self {
        MockReply::Error {
            status,
            body: body.into(),
        }
    }
}

/// A test model that returns scripted replies in order.
///
/// Cycles back to the beginning when all replies have been consumed.
#[derive(Debug)]
pub struct MockLm {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<LmRequest>>,
}

impl MockLm {
    /// Create a mock with the given scripted replies.
    ///
    /// An empty script behaves like a model that always answers with an
    /// empty string.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Text replies, in order.
    pub fn texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(MockReply::text).collect())
    }

    /// A mock that always returns the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(response)])
    }

    /// Number of `generate` calls so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<LmRequest> {
        self.requests.lock().clone()
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<LmRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_reply(&self) -> MockReply {
        if self.replies.is_empty() {
            return MockReply::text("");
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        self.replies[idx].clone()
    }
}

#[async_trait]
impl LanguageModel for MockLm {
    async fn generate(&self, _config: &LmConfig, request: &LmRequest) -> Result<LmResponse> {
        self.requests.lock().push(request.clone());
        match self.next_reply() {
            MockReply::Text(text) => Ok(LmResponse::text(text)),
            MockReply::Response(response) => Ok(response),
            MockReply::Error { status, body } => Err(PipelineError::HttpError {
                status,
                body,
                retry_after: None,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;

    fn request(text: &str) -> LmRequest {
        LmRequest::new(vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn test_mock_cycles_replies() {
        let mock = MockLm::texts(["first", "second"]);
        let config = LmConfig::default();
        let r1 = mock.generate(&config, &request("a")).await.unwrap();
        let r2 = mock.generate(&config, &request("b")).await.unwrap();
        let r3 = mock.generate(&config, &request("c")).await.unwrap();
        assert_eq!(r1.content(), Some("first"));
        assert_eq!(r2.content(), Some("second"));
        assert_eq!(r3.content(), Some("first"));
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let mock = MockLm::fixed("ok");
        mock.generate(&LmConfig::default(), &request("hello"))
            .await
            .unwrap();
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.last_request().unwrap().messages[0].content, "hello");
    }

    #[tokio::test]
    async fn test_mock_error_reply() {
        let mock = MockLm::new(vec![MockReply::error(429, "slow down")]);
        let err = mock
            .generate(&LmConfig::default(), &request("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 429, .. }));
    }

    #[test]
    fn test_mock_usable_from_sync_tests() {
        let mock = MockLm::fixed("ok");
        let resp = tokio_test::block_on(mock.generate(&LmConfig::default(), &request("x"))).unwrap();
        assert_eq!(resp.content(), Some("ok"));
    }

    #[tokio::test]
    async fn test_empty_script_answers_empty() {
        let mock = MockLm::new(Vec::new());
        let resp = mock
            .generate(&LmConfig::default(), &request("x"))
            .await
            .unwrap();
        assert_eq!(resp.content(), Some(""));
    }
}

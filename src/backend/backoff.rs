//! Transport retry: exponential backoff with jitter around one LM call.
//!
//! Only transport failures are retried here (rate limits, 5xx, dropped
//! connections). A reply that arrived but failed to parse belongs to the
//! output retry controller, which keeps its own counter.

use super::{LanguageModel, LmConfig, LmRequest, LmResponse};
use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Transport retry policy.
///
/// ```
/// use signature_pipeline::backend::BackoffConfig;
///
/// assert_eq!(BackoffConfig::default().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().with_max_retries(4).max_retries, 4);
/// assert!(BackoffConfig::interactive().max_delay < BackoffConfig::batch().max_delay);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Transport retries after the first call. `0` disables retry.
    pub max_retries: u32,
    /// Delay before the first retry; later delays grow by `multiplier`.
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Cap on any single delay, `Retry-After` hints included.
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
    /// Statuses treated as transient.
    pub retryable_statuses: Vec<u16>,
    /// Prefer the provider's `Retry-After` hint over the computed delay.
    pub respect_retry_after: bool,
}

/// How the computed delay is randomized, so concurrent callers sharing a
/// rate limit do not retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// The exact computed delay.
    None,
    /// Uniform in `[0, delay]`.
    #[default]
    Full,
    /// Uniform in `[delay / 2, delay]`.
    Equal,
}

impl JitterStrategy {
    fn apply(self, secs: f64) -> f64 {
        match self {
            JitterStrategy::None => secs,
            JitterStrategy::Full => fastrand::f64() * secs,
            JitterStrategy::Equal => secs * (0.5 + fastrand::f64() * 0.5),
        }
    }
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self::standard().with_max_retries(0)
    }

    /// 3 retries from 1s, doubling, capped at 60s, full jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: RETRYABLE_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }

    /// A user is waiting on the answer: 2 quick retries, capped at 10s.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::Equal,
            ..Self::standard()
        }
    }

    /// Batch runs against shared rate limits: 5 retries, capped at 120s.
    pub fn batch() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
            ..Self::standard()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `error` is transient under this policy.
    ///
    /// Listed HTTP statuses and connection failures are; output errors,
    /// cancellation and timeouts never are.
    pub fn should_retry(&self, error: &PipelineError) -> bool {
        match error {
            PipelineError::HttpError { status, .. } => self.retryable_statuses.contains(status),
            PipelineError::Transport(_) => true,
            _ => false,
        }
    }

    /// Delay before retry number `retry` (1-based) that follows `error`.
    ///
    /// `initial_delay * multiplier^(retry - 1)`, jittered, or the error's
    /// `Retry-After` hint when honoured. Never above `max_delay`.
    pub fn delay_before(&self, retry: u32, error: &PipelineError) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        if let PipelineError::HttpError {
            retry_after: Some(hint),
            ..
        } = error
        {
            if self.respect_retry_after {
                return Duration::from_secs_f64(hint.as_secs_f64().min(cap));
            }
        }
        let exponent = retry.saturating_sub(1) as i32;
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(cap);
        Duration::from_secs_f64(self.jitter.apply(base))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Call `lm`, retrying transient transport failures per `config`.
///
/// Cancellation is checked before every call, including after each sleep.
/// Returns the first response, or the error that ended the loop.
pub async fn with_backoff(
    lm: &Arc<dyn LanguageModel>,
    lm_config: &LmConfig,
    request: &LmRequest,
    config: &BackoffConfig,
    cancel: Option<&AtomicBool>,
) -> Result<LmResponse> {
    let cancelled = || cancel.is_some_and(|flag| flag.load(Ordering::Relaxed));
    let mut retry = 0;

    loop {
        if cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let error = match lm.generate(lm_config, request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        if retry >= config.max_retries || !config.should_retry(&error) {
            return Err(error);
        }

        retry += 1;
        let delay = config.delay_before(retry, &error);
        tracing::warn!(
            lm = lm.name(),
            retry,
            max_retries = config.max_retries,
            ?delay,
            error = %error,
            "transport retry"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatMessage, MockLm, MockReply};

    fn fixed_delays() -> BackoffConfig {
        BackoffConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::None,
            retryable_statuses: vec![429],
            respect_retry_after: false,
        }
    }

    fn http(status: u16, retry_after: Option<Duration>) -> PipelineError {
        PipelineError::HttpError {
            status,
            body: String::new(),
            retry_after,
        }
    }

    fn request() -> LmRequest {
        LmRequest::new(vec![ChatMessage::user("hi")])
    }

    fn quick(max_retries: u32) -> BackoffConfig {
        BackoffConfig::standard()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_delays_grow_then_cap() {
        let config = fixed_delays();
        let err = http(429, None);
        let delays: Vec<u64> = (1..=5).map(|r| config.delay_before(r, &err).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let config = BackoffConfig {
            respect_retry_after: true,
            ..fixed_delays()
        };
        let hinted = http(429, Some(Duration::from_secs(3)));
        assert_eq!(config.delay_before(1, &hinted), Duration::from_secs(3));
        let huge = http(429, Some(Duration::from_secs(600)));
        assert_eq!(config.delay_before(1, &huge), Duration::from_secs(5));

        let ignored = BackoffConfig { respect_retry_after: false, ..config };
        assert_eq!(ignored.delay_before(1, &hinted), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let err = http(429, None);
        let equal = fixed_delays().with_jitter(JitterStrategy::Equal);
        let full = fixed_delays().with_jitter(JitterStrategy::Full);
        for _ in 0..100 {
            let d = equal.delay_before(2, &err);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "{d:?}");
            assert!(full.delay_before(1, &err) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_only_transport_failures_retry() {
        let config = BackoffConfig::batch();
        assert!(config.should_retry(&http(429, None)));
        assert!(config.should_retry(&http(503, None)));
        assert!(config.should_retry(&PipelineError::Transport("reset".into())));
        assert!(!config.should_retry(&http(400, None)));
        assert!(!config.should_retry(&PipelineError::Cancelled));
        assert!(!config.should_retry(&PipelineError::Timeout(Duration::from_secs(1))));
        assert!(!config.should_retry(&PipelineError::MissingRequiredOutputs {
            fields: vec!["answer".into()],
        }));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let mock = Arc::new(MockLm::new(vec![
            MockReply::error(503, "unavailable"),
            MockReply::text("ok"),
        ]));
        let lm: Arc<dyn LanguageModel> = mock.clone();

        let resp = with_backoff(&lm, &LmConfig::default(), &request(), &quick(2), None)
            .await
            .unwrap();
        assert_eq!(resp.content(), Some("ok"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let mock = Arc::new(MockLm::new(vec![MockReply::error(429, "slow down")]));
        let lm: Arc<dyn LanguageModel> = mock.clone();

        let err = with_backoff(&lm, &LmConfig::default(), &request(), &quick(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 429, .. }));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_final() {
        let mock = Arc::new(MockLm::new(vec![MockReply::error(400, "bad")]));
        let lm: Arc<dyn LanguageModel> = mock.clone();

        let err = with_backoff(&lm, &LmConfig::default(), &request(), &quick(3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::HttpError { status: 400, .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let mock = Arc::new(MockLm::fixed("unused"));
        let lm: Arc<dyn LanguageModel> = mock.clone();
        let cancel = AtomicBool::new(true);

        let err = with_backoff(&lm, &LmConfig::default(), &request(), &quick(3), Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(mock.call_count(), 0);
    }
}

//! Retry policy shared by LLM, embedding and store call sites.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time;

use crate::{LlmProvider, LlmRequest, LlmResponse};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Marker providers append to error messages for transient failures.
pub const RETRYABLE_MARKER: &str = "[retryable]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RateLimit,
    Timeout,
    ServerError,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::AuthError => "auth_error",
            Self::InvalidRequest => "invalid_request",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::ServerError)
    }
}

pub fn classify_failure(err_str: &str) -> FailureReason {
    let lower = err_str.to_lowercase();

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        return FailureReason::RateLimit;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return FailureReason::Timeout;
    }
    if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("internal server error")
        || lower.contains("service unavailable")
        || lower.contains("bad gateway")
    {
        return FailureReason::ServerError;
    }
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
    {
        return FailureReason::AuthError;
    }
    if lower.contains("400") || lower.contains("invalid request") {
        return FailureReason::InvalidRequest;
    }
    FailureReason::Unknown
}

/// Default predicate: the provider tagged the error, or its text classifies
/// as a transient failure.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let err_str = format!("{err:#}");
    err_str.contains(RETRYABLE_MARKER) || classify_failure(&err_str).is_transient()
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: 2,
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    retryable: RetryPredicate,
    retryable_stop_reasons: Vec<String>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable_stop_reasons", &self.retryable_stop_reasons)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Backoff::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: Arc::new(is_transient_error),
            retryable_stop_reasons: vec!["recitation".to_string()],
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::default())
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn with_retryable_stop_reasons(mut self, reasons: Vec<String>) -> Self {
        self.retryable_stop_reasons = reasons;
        self
    }

    pub fn is_retryable(&self, err: &anyhow::Error) -> bool {
        (self.retryable)(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    let backoff = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        "{label} retryable error (attempt {attempt}/{}), backing off {}ms: {err:#}",
                        self.max_attempts,
                        backoff.as_millis()
                    );
                    time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Chat with retries. Responses whose stop reason is listed as retryable
    /// (e.g. `recitation`) are treated as transient failures.
    pub async fn chat(&self, provider: &dyn LlmProvider, request: LlmRequest) -> Result<LlmResponse> {
        let label = format!("llm {}", request.model);
        self.run(&label, || {
            let request = request.clone();
            async move {
                let resp = provider.chat(request).await?;
                if let Some(reason) = resp.stop_reason.as_deref() {
                    if self.retryable_stop_reasons.iter().any(|r| r == reason) {
                        return Err(anyhow!(
                            "llm finish reason {reason} {RETRYABLE_MARKER}"
                        ));
                    }
                }
                Ok(resp)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentBlock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(2),
                multiplier: 2,
            },
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn classify_failure_reasons() {
        assert_eq!(classify_failure("HTTP 429 Too Many Requests"), FailureReason::RateLimit);
        assert_eq!(classify_failure("request timed out"), FailureReason::Timeout);
        assert_eq!(classify_failure("503 Service Unavailable"), FailureReason::ServerError);
        assert_eq!(classify_failure("401 Unauthorized"), FailureReason::AuthError);
        assert_eq!(classify_failure("something odd"), FailureReason::Unknown);
        assert!(is_transient_error(&anyhow!("gemini api error [retryable]: x")));
        assert!(!is_transient_error(&anyhow!("evidence missing")));
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result = fast_policy(3)
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("boom [retryable]"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = fast_policy(3)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("invalid api key")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = fast_policy(3)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("503 service unavailable")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = fast_policy(3)
            .with_predicate(|_| false)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("boom [retryable]")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct RecitationThenText {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for RecitationThenText {
        async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (text, reason) = if n == 0 {
                ("", "recitation")
            } else {
                ("{}", "end_turn")
            };
            Ok(LlmResponse {
                text: text.into(),
                content: vec![ContentBlock::Text { text: text.into() }],
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some(reason.into()),
            })
        }
    }

    #[tokio::test]
    async fn chat_retries_recitation_stop_reason() {
        let provider = RecitationThenText {
            calls: AtomicUsize::new(0),
        };
        let resp = fast_policy(3)
            .chat(&provider, LlmRequest::simple("m".into(), None, "x".into()))
            .await
            .unwrap();
        assert_eq!(resp.text, "{}");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}

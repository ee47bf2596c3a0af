use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::extract::ResponseExtractor;
use crate::llm::{CompletionError, GenerationConfig, LlmClient};
use crate::prompt::CompletionRequest;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`, plus up
/// to `jitter` of uniform random delay. Server retry hints are honoured up
/// to `retry_after_cap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
    pub retry_after_cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2_000),
            max: Duration::from_millis(8_000),
            jitter: Duration::from_millis(500),
            retry_after_cap: Duration::from_secs(20),
        }
    }
}

impl BackoffPolicy {
    pub fn from_millis(base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter: Duration::from_millis(jitter_ms),
            ..Self::default()
        }
    }

    pub fn with_retry_after_cap(mut self, cap: Duration) -> Self {
        self.retry_after_cap = cap;
        self
    }

    // Jitter is added separately so it stays within the configured bound.
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(self.base)
            .with_max_delay(self.max)
            .with_factor(2.0)
    }

    /// Deterministic delays following each of `attempts` failures on one model.
    pub fn schedule(&self, attempts: u32) -> ExponentialBackoff {
        self.builder().with_max_times(attempts as usize).build()
    }

    /// Deterministic part of the delay after a failed `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.builder().with_max_times(index + 1).build().nth(index).unwrap_or(self.max)
    }

    pub fn jitter(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }

    /// Stretches `delay` to a quota rejection's own wait. `None` means the
    /// model asked for longer than `retry_after_cap` and should be skipped.
    pub fn adjust_for_rate_limit(
        &self,
        error: &CompletionError,
        delay: Option<Duration>,
    ) -> Option<Duration> {
        match (error, delay) {
            (CompletionError::RateLimited { retry_after: Some(retry_after), .. }, _)
                if *retry_after > self.retry_after_cap =>
            {
                None
            }
            (CompletionError::RateLimited { retry_after: Some(retry_after), .. }, Some(delay)) => {
                Some(delay.max(*retry_after))
            }
            (_, delay) => delay,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The breaker is open; callers should answer with the overloaded message.
    CircuitOpen,
    /// Every attempt on every candidate failed.
    Exhausted,
    NoCandidates,
    /// Credentials were rejected; retrying cannot help.
    Unconfigured,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Exhausted => "exhausted",
            Self::NoCandidates => "no_candidates",
            Self::Unconfigured => "unconfigured",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionResult {
    Success { text: String, model: String, attempts: u32 },
    Failure { kind: FailureKind, attempts: u32, last_error: Option<CompletionError> },
}

impl CompletionResult {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text, .. } => Some(text),
            Self::Failure { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }
}

/// Two-level retry: transient retries per model, then the next candidate.
/// Attempts for one request are strictly sequential.
pub struct RetryEngine {
    client: Arc<dyn LlmClient>,
    breaker: Arc<CircuitBreaker>,
    extractor: ResponseExtractor,
    backoff: BackoffPolicy,
    generation: GenerationConfig,
}

impl RetryEngine {
    pub fn new(
        client: Arc<dyn LlmClient>,
        breaker: Arc<CircuitBreaker>,
        backoff: BackoffPolicy,
        generation: GenerationConfig,
    ) -> Self {
        Self { client, breaker, extractor: ResponseExtractor::default(), backoff, generation }
    }

    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn execute(
        &self,
        candidates: &[String],
        request: &CompletionRequest,
        max_retries_per_model: u32,
    ) -> CompletionResult {
        let max_retries = max_retries_per_model.max(1);
        let parts = request.parts();
        let mut attempts = 0u32;
        let mut last_error = None;

        for (index, model) in candidates.iter().enumerate() {
            let last_model = index + 1 == candidates.len();
            let mut schedule = self.backoff.schedule(max_retries);

            for attempt in 1..=max_retries {
                // Another request may have tripped the breaker while we slept.
                if self.breaker.is_open() {
                    return CompletionResult::Failure {
                        kind: FailureKind::CircuitOpen,
                        attempts,
                        last_error,
                    };
                }

                attempts += 1;
                let error = match self.client.invoke(model, &parts, &self.generation).await {
                    Ok(raw) => match self.extractor.extract_with_strategy(&raw) {
                        Some((text, strategy)) => {
                            self.breaker.record_success();
                            info!(
                                event_name = "agent.completion.attempt",
                                model = %model,
                                attempt,
                                outcome = "success",
                                strategy = strategy.label(),
                                "completion attempt succeeded"
                            );
                            return CompletionResult::Success {
                                text,
                                model: model.clone(),
                                attempts,
                            };
                        }
                        None => CompletionError::EmptyResult,
                    },
                    Err(error) => error,
                };

                warn!(
                    event_name = "agent.completion.attempt",
                    model = %model,
                    attempt,
                    outcome = error.kind(),
                    error = %error,
                    "completion attempt failed"
                );

                if !error.is_retryable() {
                    return CompletionResult::Failure {
                        kind: FailureKind::Unconfigured,
                        attempts,
                        last_error: Some(error),
                    };
                }

                let outcome = self.breaker.record_failure();
                if outcome.is_open() {
                    return CompletionResult::Failure {
                        kind: FailureKind::CircuitOpen,
                        attempts,
                        last_error: Some(error),
                    };
                }

                if last_model && attempt == max_retries {
                    return CompletionResult::Failure {
                        kind: FailureKind::Exhausted,
                        attempts,
                        last_error: Some(error),
                    };
                }

                let planned = schedule.next().map(|delay| delay + self.backoff.jitter());
                match self.backoff.adjust_for_rate_limit(&error, planned) {
                    Some(delay) => {
                        last_error = Some(error);
                        tokio::time::sleep(delay).await;
                    }
                    None if last_model => {
                        return CompletionResult::Failure {
                            kind: FailureKind::Exhausted,
                            attempts,
                            last_error: Some(error),
                        };
                    }
                    None => {
                        info!(
                            event_name = "agent.completion.failover",
                            model = %model,
                            attempt,
                            "retry hint exceeds cap, moving to next model"
                        );
                        last_error = Some(error);
                        break;
                    }
                }
            }
        }

        CompletionResult::Failure { kind: FailureKind::NoCandidates, attempts, last_error }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    use super::{BackoffPolicy, CompletionResult, FailureKind, RetryEngine};
    use crate::breaker::CircuitBreaker;
    use crate::llm::{CompletionError, GenerationConfig, LlmClient, PromptPart};
    use crate::prompt::CompletionRequest;

    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<Value, CompletionError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<Value, CompletionError>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) })
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn invoke(
            &self,
            model: &str,
            _parts: &[PromptPart],
            _config: &GenerationConfig,
        ) -> Result<Value, CompletionError> {
            self.calls.lock().await.push(model.to_string());
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".to_string())))
        }
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::from_millis(2_000, 8_000, 0)
    }

    fn request() -> CompletionRequest {
        CompletionRequest { prompt: "NGƯỜI DÙNG: Xin chào".to_string(), images: Vec::new() }
    }

    fn models(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn service_error() -> Result<Value, CompletionError> {
        Err(CompletionError::Service { status: 500, message: "boom".to_string() })
    }

    fn engine(client: Arc<ScriptedClient>, breaker: Arc<CircuitBreaker>) -> RetryEngine {
        RetryEngine::new(client, breaker, no_jitter(), GenerationConfig::default())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(4), Duration::from_secs(8));
        assert_eq!(policy.base_delay(12), Duration::from_secs(8));
        assert_eq!(
            policy.schedule(4).collect::<Vec<_>>(),
            [2, 4, 8, 8].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=4 {
            let delay = policy.delay(attempt);
            let base = policy.base_delay(attempt);
            assert!(delay >= base && delay <= base + Duration::from_millis(500));
        }
    }

    #[test]
    fn rate_limit_retry_after_extends_delay_up_to_cap() {
        let policy = no_jitter();
        let planned = Some(Duration::from_secs(2));
        let error =
            CompletionError::RateLimited { status: 429, retry_after: Some(Duration::from_secs(15)) };
        assert_eq!(policy.adjust_for_rate_limit(&error, planned), Some(Duration::from_secs(15)));

        let short =
            CompletionError::RateLimited { status: 429, retry_after: Some(Duration::from_secs(1)) };
        assert_eq!(policy.adjust_for_rate_limit(&short, planned), planned);

        let service = CompletionError::Service { status: 500, message: "boom".to_string() };
        assert_eq!(policy.adjust_for_rate_limit(&service, planned), planned);
    }

    #[test]
    fn retry_hint_beyond_cap_skips_the_model() {
        let policy = no_jitter().with_retry_after_cap(Duration::from_secs(20));
        let error = CompletionError::RateLimited {
            status: 429,
            retry_after: Some(Duration::from_secs(86_400)),
        };

        assert_eq!(policy.adjust_for_rate_limit(&error, Some(Duration::from_secs(2))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_never_sleeps() {
        let client = ScriptedClient::new(vec![Ok(json!({ "text": "Tại hạ xin chào" }))]);
        let breaker = Arc::new(CircuitBreaker::default());
        let engine = engine(Arc::clone(&client), Arc::clone(&breaker));
        let started = Instant::now();

        let result = engine.execute(&models(&["gemini-2.0-flash"]), &request(), 3).await;

        assert_eq!(result.text(), Some("Tại hạ xin chào"));
        assert_eq!(result.attempts(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(breaker.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_model_falls_through_to_next_candidate() {
        let client = ScriptedClient::new(vec![
            service_error(),
            Ok(json!({ "candidates": [] })),
            Err(CompletionError::Transport("timeout".to_string())),
            Ok(json!({ "candidates": [{ "content": { "parts": [{ "text": "ổn rồi" }] } }] })),
        ]);
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(30)));
        let engine = engine(Arc::clone(&client), Arc::clone(&breaker));
        let started = Instant::now();

        let result = engine.execute(&models(&["m-flash", "m-pro"]), &request(), 3).await;

        assert_eq!(
            result,
            CompletionResult::Success {
                text: "ổn rồi".to_string(),
                model: "m-pro".to_string(),
                attempts: 4,
            }
        );
        assert_eq!(client.calls().await, models(&["m-flash", "m-flash", "m-flash", "m-pro"]));
        // 2s + 4s + 8s between the three failures.
        assert_eq!(started.elapsed(), Duration::from_secs(14));
        assert_eq!(breaker.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payloads_count_as_failures() {
        let client = ScriptedClient::new(vec![
            Ok(json!({ "text": "" })),
            Ok(json!({ "promptFeedback": { "blockReason": "SAFETY" } })),
        ]);
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(30)));
        let engine = engine(client, Arc::clone(&breaker));

        let result = engine.execute(&models(&["only"]), &request(), 2).await;

        assert_eq!(
            result,
            CompletionResult::Failure {
                kind: FailureKind::Exhausted,
                attempts: 2,
                last_error: Some(CompletionError::EmptyResult),
            }
        );
        assert_eq!(breaker.state().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn opening_the_breaker_stops_retrying() {
        let client = ScriptedClient::new((0..10).map(|_| service_error()).collect());
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        let engine = engine(Arc::clone(&client), Arc::clone(&breaker));

        let result = engine.execute(&models(&["a", "b", "c"]), &request(), 3).await;

        assert!(matches!(
            result,
            CompletionResult::Failure { kind: FailureKind::CircuitOpen, attempts: 5, .. }
        ));
        assert_eq!(client.calls().await.len(), 5);
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_before_any_call() {
        let client = ScriptedClient::new(vec![Ok(json!({ "text": "không được gọi" }))]);
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(30)));
        breaker.record_failure();
        let engine = engine(Arc::clone(&client), breaker);

        let result = engine.execute(&models(&["a"]), &request(), 3).await;

        assert!(matches!(result, CompletionResult::Failure { kind: FailureKind::CircuitOpen, .. }));
        assert!(client.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_are_not_retried_or_counted() {
        let client = ScriptedClient::new(vec![Err(CompletionError::Configuration(
            "status 403".to_string(),
        ))]);
        let breaker = Arc::new(CircuitBreaker::default());
        let engine = engine(Arc::clone(&client), Arc::clone(&breaker));

        let result = engine.execute(&models(&["a", "b"]), &request(), 3).await;

        assert!(matches!(
            result,
            CompletionResult::Failure { kind: FailureKind::Unconfigured, attempts: 1, .. }
        ));
        assert_eq!(breaker.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn no_candidates_makes_no_calls() {
        let client = ScriptedClient::new(Vec::new());
        let engine = engine(Arc::clone(&client), Arc::new(CircuitBreaker::default()));

        let result = engine.execute(&[], &request(), 3).await;

        assert_eq!(
            result,
            CompletionResult::Failure { kind: FailureKind::NoCandidates, attempts: 0, last_error: None }
        );
        assert!(client.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn day_long_quota_hint_fails_over_without_sleeping() {
        let quota = || {
            Err(CompletionError::RateLimited {
                status: 429,
                retry_after: Some(Duration::from_secs(86_400)),
            })
        };
        let client = ScriptedClient::new(vec![quota(), quota(), quota()]);
        let breaker = Arc::new(CircuitBreaker::new(50, Duration::from_secs(30)));
        let engine = engine(Arc::clone(&client), breaker);
        let started = Instant::now();

        let result = engine.execute(&models(&["a-flash", "b-flash", "c-pro"]), &request(), 3).await;

        assert!(matches!(
            result,
            CompletionResult::Failure { kind: FailureKind::Exhausted, attempts: 3, .. }
        ));
        assert_eq!(client.calls().await, models(&["a-flash", "b-flash", "c-pro"]));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn short_quota_hint_is_waited_out_on_the_same_model() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::RateLimited {
                status: 429,
                retry_after: Some(Duration::from_secs(15)),
            }),
            Ok(json!({
                "candidates": [{ "content": { "parts": [{ "text": "đã có hạn mức" }] } }]
            })),
        ]);
        let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(30)));
        let engine = engine(Arc::clone(&client), breaker);
        let started = Instant::now();

        let result = engine.execute(&models(&["only"]), &request(), 3).await;

        assert_eq!(result.text(), Some("đã có hạn mức"));
        assert_eq!(client.calls().await, models(&["only", "only"]));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }
}

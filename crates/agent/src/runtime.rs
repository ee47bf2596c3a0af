use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use ekko_core::config::AppConfig;
use ekko_core::domain::conversation::ConversationTurn;
use ekko_core::domain::persona::PersonaDefinition;
use ekko_db::RepositoryError;

use crate::breaker::{BreakerGate, CircuitBreaker, CircuitSnapshot};
use crate::gate::{ConcurrencyGate, GateClosed};
use crate::llm::{CompletionError, GeminiClient, GenerationConfig, ImageBlob, LlmClient};
use crate::models::ModelSelector;
use crate::prompt::PromptBuilder;
use crate::retry::{BackoffPolicy, CompletionResult, FailureKind, RetryEngine};

/// Source of the bounded conversation history for one reply.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn recent_turns(&self, limit: usize) -> Result<Vec<ConversationTurn>, RepositoryError>;
}

/// Fixed history, mostly for one-shot calls and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticHistory(pub Vec<ConversationTurn>);

#[async_trait]
impl HistoryProvider for StaticHistory {
    async fn recent_turns(&self, limit: usize) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let start = self.0.len().saturating_sub(limit);
        Ok(self.0[start..].to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AiMode {
    Live,
    /// No usable credentials; every reply is the persona's unconfigured message.
    FallbackOnly,
}

impl AiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::FallbackOnly => "fallback_only",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub text_models: Vec<String>,
    pub vision_models: Vec<String>,
    pub max_retries_per_model: u32,
    pub concurrency: usize,
    pub generation: GenerationConfig,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub backoff: BackoffPolicy,
    pub history_window: usize,
    pub max_turn_chars: usize,
    /// Persona key to display name, for labelling stored assistant turns.
    pub persona_names: BTreeMap<String, String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            text_models: config.llm.text_models.clone(),
            vision_models: config.llm.vision_models.clone(),
            max_retries_per_model: config.llm.max_retries,
            concurrency: config.llm.concurrency,
            generation: GenerationConfig {
                max_output_tokens: config.llm.max_output_tokens,
                temperature: config.llm.temperature,
            },
            breaker_threshold: config.resilience.breaker_threshold,
            breaker_cooldown: Duration::from_secs(config.resilience.breaker_cooldown_secs),
            backoff: BackoffPolicy::from_millis(
                config.resilience.backoff_base_ms,
                config.resilience.backoff_max_ms,
                config.resilience.backoff_jitter_ms,
            )
            .with_retry_after_cap(Duration::from_secs(config.resilience.retry_after_cap_secs)),
            history_window: config.conversation.history_window,
            max_turn_chars: config.conversation.max_turn_chars,
            persona_names: config
                .personas
                .iter()
                .map(|persona| (persona.key.clone(), persona.name.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
enum ReplyError {
    #[error("nothing to send: request has neither text nor images")]
    EmptyRequest,
    #[error(transparent)]
    Gate(#[from] GateClosed),
}

/// Owns the shared resilience state and turns a chat request into reply text.
pub struct CompletionOrchestrator {
    mode: AiMode,
    engine: Option<RetryEngine>,
    breaker: Arc<CircuitBreaker>,
    gate: ConcurrencyGate,
    selector: ModelSelector,
    prompt: PromptBuilder,
    max_retries_per_model: u32,
}

impl CompletionOrchestrator {
    pub fn new(client: Arc<dyn LlmClient>, settings: OrchestratorSettings) -> Self {
        Self::build(Some(client), settings)
    }

    pub fn fallback_only(settings: OrchestratorSettings) -> Self {
        Self::build(None, settings)
    }

    /// Live mode when an API key is configured, fallback-only otherwise.
    pub fn from_config(config: &AppConfig) -> Result<Self, CompletionError> {
        let settings = OrchestratorSettings::from_config(config);
        match config.llm.api_key.clone().filter(|_| config.has_llm_credentials()) {
            Some(api_key) => {
                let client = GeminiClient::new(
                    config.llm.base_url.clone(),
                    api_key,
                    Duration::from_secs(config.llm.timeout_secs),
                )?;
                info!(
                    event_name = "agent.mode.live",
                    text_models = config.llm.text_models.len(),
                    vision_models = config.llm.vision_models.len(),
                    concurrency = config.llm.concurrency,
                    "completion backend configured"
                );
                Ok(Self::new(Arc::new(client), settings))
            }
            None => {
                error!(
                    event_name = "agent.mode.fallback_only",
                    "no completion api key configured; replies will use fallback messages only"
                );
                Ok(Self::fallback_only(settings))
            }
        }
    }

    fn build(client: Option<Arc<dyn LlmClient>>, settings: OrchestratorSettings) -> Self {
        let breaker =
            Arc::new(CircuitBreaker::new(settings.breaker_threshold, settings.breaker_cooldown));
        let engine = client.map(|client| {
            RetryEngine::new(client, Arc::clone(&breaker), settings.backoff, settings.generation)
        });
        let mode = if engine.is_some() { AiMode::Live } else { AiMode::FallbackOnly };

        Self {
            mode,
            engine,
            breaker,
            gate: ConcurrencyGate::new(settings.concurrency),
            selector: ModelSelector::new(settings.text_models, settings.vision_models),
            prompt: PromptBuilder::new(settings.history_window, settings.max_turn_chars)
                .with_persona_names(settings.persona_names),
            max_retries_per_model: settings.max_retries_per_model,
        }
    }

    pub fn ai_mode(&self) -> AiMode {
        self.mode
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn history_window(&self) -> usize {
        self.prompt.history_window()
    }

    /// Always returns displayable text. Internal failures, panics included,
    /// become the persona's fallback messages.
    pub async fn get_reply(
        &self,
        persona: &PersonaDefinition,
        user_text: &str,
        images: Vec<ImageBlob>,
        history: &dyn HistoryProvider,
    ) -> String {
        // Unwinding drops the gate permit, so capacity is returned either way.
        let outcome =
            AssertUnwindSafe(self.try_reply(persona, user_text, images, history)).catch_unwind();
        match outcome.await {
            Ok(Ok(text)) => text,
            Ok(Err(reply_error)) => {
                error!(
                    event_name = "agent.reply.unexpected",
                    persona = %persona.key,
                    error = %reply_error,
                    "reply pipeline failed"
                );
                persona.fallbacks.unexpected.clone()
            }
            Err(panic) => {
                error!(
                    event_name = "agent.reply.panicked",
                    persona = %persona.key,
                    panic = panic_message(panic.as_ref()),
                    "reply pipeline panicked"
                );
                persona.fallbacks.unexpected.clone()
            }
        }
    }

    async fn try_reply(
        &self,
        persona: &PersonaDefinition,
        user_text: &str,
        images: Vec<ImageBlob>,
        history: &dyn HistoryProvider,
    ) -> Result<String, ReplyError> {
        let Some(engine) = &self.engine else {
            return Ok(persona.fallbacks.unconfigured.clone());
        };

        if let BreakerGate::Reject { retry_in } = self.breaker.check() {
            info!(
                event_name = "agent.reply.short_circuit",
                retry_in_secs = retry_in.as_secs(),
                "circuit open, answering with fallback"
            );
            return Ok(persona.fallbacks.overloaded.clone());
        }

        if user_text.trim().is_empty() && images.is_empty() {
            return Err(ReplyError::EmptyRequest);
        }

        let turns = match history.recent_turns(self.prompt.history_window()).await {
            Ok(turns) => turns,
            Err(history_error) => {
                warn!(
                    event_name = "agent.history.unavailable",
                    error = %history_error,
                    "history fetch failed, continuing without it"
                );
                Vec::new()
            }
        };

        let request = self.prompt.request(
            &persona.system_instruction,
            &persona.name,
            &turns,
            user_text,
            images,
        );
        let candidates = self.selector.select_candidates(request.has_images());
        debug!(
            event_name = "agent.reply.prepared",
            history_turns = turns.len(),
            images = request.images.len(),
            candidates = candidates.len(),
            prompt_chars = request.prompt.chars().count(),
            "completion request prepared"
        );

        let result = {
            let _permit = self.gate.acquire().await?;
            engine.execute(&candidates, &request, self.max_retries_per_model).await
        };

        Ok(match result {
            CompletionResult::Success { text, .. } => text,
            CompletionResult::Failure { kind, attempts, last_error } => {
                warn!(
                    event_name = "agent.reply.fallback",
                    kind = kind.as_str(),
                    attempts,
                    last_error = last_error.as_ref().map(|error| error.kind()).unwrap_or("none"),
                    "completion failed, answering with fallback"
                );
                match kind {
                    FailureKind::CircuitOpen => persona.fallbacks.overloaded.clone(),
                    FailureKind::Unconfigured => persona.fallbacks.unconfigured.clone(),
                    FailureKind::Exhausted | FailureKind::NoCandidates => {
                        persona.fallbacks.unavailable.clone()
                    }
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

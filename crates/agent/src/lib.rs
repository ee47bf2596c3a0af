//! Agent runtime: outbound completion orchestration for the Ekko relay bot.
//!
//! Every eligible chat message ends up in [`conversation::ConversationService`],
//! which persists the turn and asks [`runtime::CompletionOrchestrator`] for a
//! reply. The orchestrator owns the resilience layer around the completion
//! service:
//!
//! 1. **Circuit check** (`breaker`) - short-circuit while the service is failing
//! 2. **Prompt assembly** (`prompt`) - persona instructions, bounded history, request
//! 3. **Model choice** (`models`) - cheap tiers first, vision-capable only for images
//! 4. **Admission** (`gate`) - one permit held across the whole retry sequence
//! 5. **Retries** (`retry`) - per-model retries with jittered backoff, then the next model
//! 6. **Extraction** (`extract`) - defensive probing of the raw response
//!
//! # Reply Principle
//!
//! `get_reply` always produces displayable text. Failures become the persona's
//! fallback messages and are never surfaced to chat users as raw errors.

pub mod breaker;
pub mod conversation;
pub mod cooldown;
pub mod extract;
pub mod gate;
pub mod guardrails;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod retry;
pub mod runtime;

pub use breaker::{BreakerGate, CircuitBreaker, CircuitSnapshot, CircuitStatus, FailureOutcome};
pub use conversation::ConversationService;
pub use extract::{ExtractionStrategy, ResponseExtractor};
pub use gate::{ConcurrencyGate, GateClosed, GatePermit};
pub use guardrails::{RelayDecision, RelayPolicy};
pub use llm::{CompletionError, GeminiClient, GenerationConfig, ImageBlob, LlmClient, PromptPart};
pub use models::ModelSelector;
pub use prompt::{CompletionRequest, PromptBuilder};
pub use retry::{BackoffPolicy, CompletionResult, FailureKind, RetryEngine};
pub use runtime::{AiMode, CompletionOrchestrator, HistoryProvider, OrchestratorSettings};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn, Instrument};

use ekko_core::domain::conversation::{
    ChannelId, ConversationKey, ConversationTurn, ParticipantRole, UserId,
};
use ekko_core::domain::persona::{PersonaCatalog, PersonaDefinition};
use ekko_core::errors::{ApplicationError, DomainError};
use ekko_db::{ConversationRepository, RepositoryError};

use crate::llm::ImageBlob;
use crate::runtime::{CompletionOrchestrator, HistoryProvider};

/// Number of most recent channel turns whose authors may delete bot replies.
pub const RECENT_PARTICIPANT_WINDOW: usize = 5;

/// History for the reply being generated. The user turn for this request was
/// already appended, so it is dropped from the tail when present.
struct RepositoryHistory<'a> {
    repository: &'a dyn ConversationRepository,
    key: &'a ConversationKey,
    current_text: &'a str,
}

#[async_trait]
impl HistoryProvider for RepositoryHistory<'_> {
    async fn recent_turns(&self, limit: usize) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let mut turns =
            self.repository.fetch_recent_turns(self.key, limit.saturating_add(1)).await?;

        let ends_with_current = turns
            .last()
            .is_some_and(|turn| turn.role == ParticipantRole::User && turn.text == self.current_text);
        if ends_with_current {
            turns.pop();
        }

        let start = turns.len().saturating_sub(limit);
        Ok(turns.split_off(start))
    }
}

/// Conversation-level operations behind the chat gateway: replies, resets,
/// persona selection and reply-deletion permissions.
pub struct ConversationService {
    orchestrator: Arc<CompletionOrchestrator>,
    repository: Arc<dyn ConversationRepository>,
    personas: PersonaCatalog,
    selections: RwLock<HashMap<UserId, String>>,
    request_counter: AtomicU64,
}

impl ConversationService {
    pub fn new(
        orchestrator: Arc<CompletionOrchestrator>,
        repository: Arc<dyn ConversationRepository>,
        personas: PersonaCatalog,
    ) -> Self {
        Self {
            orchestrator,
            repository,
            personas,
            selections: RwLock::new(HashMap::new()),
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn orchestrator(&self) -> &CompletionOrchestrator {
        &self.orchestrator
    }

    pub fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    /// Persists the user turn, generates a reply and persists it. Storage
    /// failures are logged and never replace the reply.
    pub async fn handle_incoming(
        &self,
        user_text: &str,
        images: Vec<ImageBlob>,
        persona_key: Option<&str>,
        key: &ConversationKey,
    ) -> String {
        let correlation_id =
            format!("req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let persona = self.personas.resolve(persona_key);
        let span = tracing::info_span!(
            "handle_incoming",
            correlation_id = %correlation_id,
            conversation = %key,
            persona = %persona.key,
        );

        async move {
            info!(
                event_name = "agent.message.received",
                text_chars = user_text.chars().count(),
                images = images.len(),
                "relaying chat message"
            );

            self.append(key, ConversationTurn::user(persona.key.clone(), user_text)).await;

            let history = RepositoryHistory {
                repository: self.repository.as_ref(),
                key,
                current_text: user_text,
            };
            let reply = self.orchestrator.get_reply(persona, user_text, images, &history).await;

            self.append(key, ConversationTurn::assistant(persona.key.clone(), reply.clone()))
                .await;
            info!(
                event_name = "agent.message.replied",
                reply_chars = reply.chars().count(),
                "reply ready"
            );
            reply
        }
        .instrument(span)
        .await
    }

    /// Replies with the persona the user selected, or the default persona.
    pub async fn handle_message(
        &self,
        key: &ConversationKey,
        user_text: &str,
        images: Vec<ImageBlob>,
    ) -> String {
        let persona_key = self.selected_persona_key(&key.user_id).await;
        self.handle_incoming(user_text, images, persona_key.as_deref(), key).await
    }

    async fn append(&self, key: &ConversationKey, turn: ConversationTurn) {
        let role = turn.role;
        if let Err(error) = self.repository.append_turn(key, turn).await {
            warn!(
                event_name = "agent.history.append_failed",
                role = role.as_storage_str(),
                error = %error,
                "could not persist conversation turn"
            );
        }
    }

    async fn selected_persona_key(&self, user_id: &UserId) -> Option<String> {
        self.selections.read().await.get(user_id).cloned()
    }

    pub async fn persona_for(&self, user_id: &UserId) -> PersonaDefinition {
        let selected = self.selected_persona_key(user_id).await;
        self.personas.resolve(selected.as_deref()).clone()
    }

    pub async fn set_persona(
        &self,
        user_id: &UserId,
        persona_key: &str,
    ) -> Result<PersonaDefinition, DomainError> {
        let persona_key = persona_key.trim();
        let Some(persona) = self.personas.get(persona_key) else {
            return Err(DomainError::UnknownPersona(persona_key.to_string()));
        };

        self.selections.write().await.insert(user_id.clone(), persona.key.clone());
        info!(
            event_name = "agent.persona.selected",
            user_id = %user_id.0,
            persona = %persona.key,
            "persona selection updated"
        );
        Ok(persona.clone())
    }

    /// Forgets the conversation history and the persona selection.
    pub async fn reset(&self, key: &ConversationKey) -> Result<u64, ApplicationError> {
        self.selections.write().await.remove(&key.user_id);
        let removed = self.repository.clear_conversation(key).await?;
        info!(
            event_name = "agent.conversation.reset",
            conversation = %key,
            removed_turns = removed,
            "conversation history cleared"
        );
        Ok(removed)
    }

    /// Moderators may always delete; otherwise only recent channel participants.
    pub async fn may_delete(
        &self,
        channel_id: &ChannelId,
        reactor: &UserId,
        can_manage_messages: bool,
    ) -> bool {
        if can_manage_messages {
            return true;
        }

        match self.repository.recent_participants(channel_id, RECENT_PARTICIPANT_WINDOW).await {
            Ok(participants) => participants.contains(reactor),
            Err(error) => {
                warn!(
                    event_name = "agent.history.participants_failed",
                    error = %error,
                    "could not load recent participants; denying delete"
                );
                false
            }
        }
    }
}

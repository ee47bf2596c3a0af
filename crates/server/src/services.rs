use std::sync::Arc;

use async_trait::async_trait;

use ekko_agent::{ConversationService, ImageBlob, RelayDecision, RelayPolicy};
use ekko_core::domain::conversation::{ChannelId, ConversationKey, UserId};
use ekko_core::errors::{ApplicationError, DomainError};
use ekko_gateway::{
    events::{CommandHandler, MessageHandler, ReactionHandler},
    CommandRouteError, CommandService, EventContext, EventDispatcher, EventHandlerError,
    MessageEvent, MessageOutcome, MessageService, PersonaSelection, ReactionAddedEvent,
    ReactionService,
};

/// Implements the gateway service traits over the conversation service and
/// the relay policy.
pub struct ChatBridge {
    conversation: Arc<ConversationService>,
    policy: RelayPolicy,
}

impl ChatBridge {
    pub fn new(conversation: Arc<ConversationService>, policy: RelayPolicy) -> Self {
        Self { conversation, policy }
    }
}

pub fn dispatcher(bridge: Arc<ChatBridge>) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(CommandHandler::new(Arc::clone(&bridge)));
    dispatcher.register(MessageHandler::new(Arc::clone(&bridge)));
    dispatcher.register(ReactionHandler::new(bridge));
    dispatcher
}

fn image_blobs(event: &MessageEvent) -> Vec<ImageBlob> {
    event
        .image_attachments()
        .filter(|attachment| !attachment.data.is_empty())
        .filter_map(|attachment| {
            attachment
                .content_type
                .as_deref()
                .map(|mime_type| ImageBlob::new(mime_type, attachment.data.clone()))
        })
        .collect()
}

#[async_trait]
impl MessageService for ChatBridge {
    fn accepts_channel(&self, channel_name: &str) -> bool {
        self.policy.is_target_channel(channel_name)
    }

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), EventHandlerError> {
        self.conversation
            .reset(key)
            .await
            .map(|_| ())
            .map_err(EventHandlerError::from)
    }

    async fn relay_message(
        &self,
        event: &MessageEvent,
        _ctx: &EventContext,
    ) -> Result<MessageOutcome, EventHandlerError> {
        let images = image_blobs(event);
        let author = UserId(event.author_id.clone());

        match self.policy.evaluate(&event.channel_name, &author, &event.content, !images.is_empty())
        {
            RelayDecision::Relay => {
                let reply = self
                    .conversation
                    .handle_message(&event.conversation_key(), &event.content, images)
                    .await;
                Ok(MessageOutcome::Reply(reply))
            }
            RelayDecision::Throttle { user_message, .. } => {
                Ok(MessageOutcome::Throttled(user_message))
            }
            RelayDecision::Ignore { reason_code } => Ok(MessageOutcome::Ignored { reason_code }),
        }
    }
}

#[async_trait]
impl CommandService for ChatBridge {
    fn target_channels(&self) -> Vec<String> {
        self.policy.target_channels().map(str::to_owned).collect()
    }

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), CommandRouteError> {
        self.conversation
            .reset(key)
            .await
            .map(|_| ())
            .map_err(CommandRouteError::from)
    }

    async fn select_persona(
        &self,
        user_id: &UserId,
        persona_key: &str,
    ) -> Result<PersonaSelection, CommandRouteError> {
        match self.conversation.set_persona(user_id, persona_key).await {
            Ok(persona) => Ok(PersonaSelection::Selected { persona_key: persona.key }),
            Err(DomainError::UnknownPersona(_)) => Ok(PersonaSelection::Unknown),
            Err(error) => Err(ApplicationError::from(error).into()),
        }
    }
}

#[async_trait]
impl ReactionService for ChatBridge {
    async fn may_delete(
        &self,
        event: &ReactionAddedEvent,
        _ctx: &EventContext,
    ) -> Result<bool, EventHandlerError> {
        Ok(self
            .conversation
            .may_delete(
                &ChannelId(event.channel_id.clone()),
                &UserId(event.reactor_id.clone()),
                event.reactor_can_manage_messages,
            )
            .await)
    }
}

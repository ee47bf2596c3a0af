use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use ekko_core::domain::conversation::ConversationKey;
use ekko_core::errors::{ApplicationError, InterfaceError, InterfaceErrorKind};

use crate::{
    commands::{
        parse_prefix_command, parse_slash_command, CommandParseError, CommandRouteError,
        CommandRouter, CommandService, NoopCommandService, PrefixCommand, SlashCommandPayload,
        HELP_HINT, RESET_CONFIRMATION,
    },
    reply::{self, OutboundAction, ReplyBody, DELETE_REACTION},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayEnvelope {
    pub envelope_id: String,
    pub event: GatewayEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    Message(MessageEvent),
    Command(SlashCommandPayload),
    ReactionAdded(ReactionAddedEvent),
    Unsupported { event_type: String },
}

impl GatewayEvent {
    pub fn event_type(&self) -> GatewayEventType {
        match self {
            Self::Message(_) => GatewayEventType::Message,
            Self::Command(_) => GatewayEventType::Command,
            Self::ReactionAdded(_) => GatewayEventType::ReactionAdded,
            Self::Unsupported { .. } => GatewayEventType::Unsupported,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GatewayEventType {
    Message,
    Command,
    ReactionAdded,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.as_deref().is_some_and(|value| value.starts_with("image/"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub message_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl MessageEvent {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.author_id.clone(), self.channel_id.clone())
    }

    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|attachment| attachment.is_image())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionAddedEvent {
    pub channel_id: String,
    pub message_id: String,
    /// The reacted-to message was sent by this bot.
    pub message_author_is_self: bool,
    pub reactor_id: String,
    pub reactor_is_bot: bool,
    pub reactor_can_manage_messages: bool,
    pub emoji: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded(Vec<OutboundAction>),
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error(transparent)]
    Parse(#[from] CommandParseError),
    #[error(transparent)]
    Route(#[from] CommandRouteError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl EventHandlerError {
    pub fn into_interface(self, correlation_id: &str) -> InterfaceError {
        match self {
            Self::Application(error) | Self::Route(CommandRouteError::Service(error)) => {
                error.into_interface(correlation_id)
            }
            Self::Parse(error) => InterfaceError::new(
                InterfaceErrorKind::BadRequest,
                error.to_string(),
                correlation_id,
            ),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> GatewayEventType;
    async fn handle(
        &self,
        envelope: &GatewayEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<GatewayEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &GatewayEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

pub fn default_dispatcher() -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(CommandHandler::new(NoopCommandService));
    dispatcher.register(MessageHandler::new(NoopMessageService));
    dispatcher.register(ReactionHandler::new(NoopReactionService));
    dispatcher
}

pub struct CommandHandler<S> {
    router: CommandRouter<S>,
}

impl<S> CommandHandler<S>
where
    S: CommandService,
{
    pub fn new(service: S) -> Self {
        Self { router: CommandRouter::new(service) }
    }
}

#[async_trait]
impl<S> EventHandler for CommandHandler<S>
where
    S: CommandService + 'static,
{
    fn event_type(&self) -> GatewayEventType {
        GatewayEventType::Command
    }

    async fn handle(
        &self,
        envelope: &GatewayEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let GatewayEvent::Command(payload) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        let command = parse_slash_command(payload)?;
        let body = match self.router.route(command, payload).await {
            Ok(body) => body,
            Err(error) => {
                let interface = EventHandlerError::from(error).into_interface(&ctx.correlation_id);
                warn!(
                    event_name = "gateway.command.failed",
                    correlation_id = %ctx.correlation_id,
                    error = %interface,
                    "command failed; answering with generic notice"
                );
                ReplyBody::text(interface.user_message())
            }
        };
        Ok(HandlerResult::Responded(vec![reply::ephemeral_response(
            &payload.interaction_id,
            body,
        )]))
    }
}

/// What the relay decided to do with an ordinary chat message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    Reply(String),
    Throttled(String),
    Ignored { reason_code: &'static str },
}

#[async_trait]
pub trait MessageService: Send + Sync {
    fn accepts_channel(&self, channel_name: &str) -> bool;

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), EventHandlerError>;

    async fn relay_message(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<MessageOutcome, EventHandlerError>;
}

#[async_trait]
impl<T> MessageService for Arc<T>
where
    T: MessageService + ?Sized,
{
    fn accepts_channel(&self, channel_name: &str) -> bool {
        (**self).accepts_channel(channel_name)
    }

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), EventHandlerError> {
        (**self).reset_conversation(key).await
    }

    async fn relay_message(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<MessageOutcome, EventHandlerError> {
        (**self).relay_message(event, ctx).await
    }
}

pub struct MessageHandler<S> {
    service: S,
}

impl<S> MessageHandler<S>
where
    S: MessageService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for MessageHandler<S>
where
    S: MessageService + 'static,
{
    fn event_type(&self) -> GatewayEventType {
        GatewayEventType::Message
    }

    async fn handle(
        &self,
        envelope: &GatewayEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let GatewayEvent::Message(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        if event.author_is_bot || !self.service.accepts_channel(&event.channel_name) {
            return Ok(HandlerResult::Ignored);
        }

        match parse_prefix_command(&event.content) {
            Some(PrefixCommand::Help) => {
                return Ok(HandlerResult::Responded(vec![reply::channel_notice(
                    &event.channel_id,
                    HELP_HINT,
                )]));
            }
            Some(PrefixCommand::Reset) => {
                self.service.reset_conversation(&event.conversation_key()).await?;
                return Ok(HandlerResult::Responded(vec![reply::channel_notice(
                    &event.channel_id,
                    RESET_CONFIRMATION,
                )]));
            }
            None => {}
        }

        match self.service.relay_message(event, ctx).await {
            Ok(MessageOutcome::Reply(text)) => {
                Ok(HandlerResult::Responded(reply::bot_reply_actions(&event.channel_id, &text)))
            }
            Ok(MessageOutcome::Throttled(notice)) => Ok(HandlerResult::Responded(vec![
                reply::reply_notice(&event.channel_id, &event.message_id, notice),
            ])),
            Ok(MessageOutcome::Ignored { .. }) => Ok(HandlerResult::Processed),
            Err(error) => {
                let interface = error.into_interface(&ctx.correlation_id);
                warn!(
                    event_name = "gateway.message.relay_failed",
                    correlation_id = %ctx.correlation_id,
                    error = %interface,
                    "relay failed; sending generic notice"
                );
                Ok(HandlerResult::Responded(vec![reply::channel_notice(
                    &event.channel_id,
                    interface.user_message(),
                )]))
            }
        }
    }
}

pub struct NoopMessageService;

#[async_trait]
impl MessageService for NoopMessageService {
    fn accepts_channel(&self, _channel_name: &str) -> bool {
        true
    }

    async fn reset_conversation(&self, _key: &ConversationKey) -> Result<(), EventHandlerError> {
        Ok(())
    }

    async fn relay_message(
        &self,
        _event: &MessageEvent,
        _ctx: &EventContext,
    ) -> Result<MessageOutcome, EventHandlerError> {
        Ok(MessageOutcome::Ignored { reason_code: "relay_unavailable" })
    }
}

#[async_trait]
pub trait ReactionService: Send + Sync {
    async fn may_delete(
        &self,
        event: &ReactionAddedEvent,
        ctx: &EventContext,
    ) -> Result<bool, EventHandlerError>;
}

#[async_trait]
impl<T> ReactionService for Arc<T>
where
    T: ReactionService + ?Sized,
{
    async fn may_delete(
        &self,
        event: &ReactionAddedEvent,
        ctx: &EventContext,
    ) -> Result<bool, EventHandlerError> {
        (**self).may_delete(event, ctx).await
    }
}

pub struct ReactionHandler<S> {
    service: S,
}

impl<S> ReactionHandler<S>
where
    S: ReactionService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for ReactionHandler<S>
where
    S: ReactionService + 'static,
{
    fn event_type(&self) -> GatewayEventType {
        GatewayEventType::ReactionAdded
    }

    async fn handle(
        &self,
        envelope: &GatewayEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let GatewayEvent::ReactionAdded(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        if event.reactor_is_bot || !event.message_author_is_self || !is_delete_reaction(&event.emoji)
        {
            return Ok(HandlerResult::Ignored);
        }

        if !self.service.may_delete(event, ctx).await? {
            return Ok(HandlerResult::Processed);
        }

        Ok(HandlerResult::Responded(vec![OutboundAction::DeleteMessage {
            channel_id: event.channel_id.clone(),
            message_id: event.message_id.clone(),
        }]))
    }
}

/// Moderators only; without a repository there is no participant history.
pub struct NoopReactionService;

#[async_trait]
impl ReactionService for NoopReactionService {
    async fn may_delete(
        &self,
        event: &ReactionAddedEvent,
        _ctx: &EventContext,
    ) -> Result<bool, EventHandlerError> {
        Ok(event.reactor_can_manage_messages)
    }
}

/// Clients send the wastebasket with or without the emoji presentation
/// selector, or as its shortcode.
fn is_delete_reaction(emoji: &str) -> bool {
    let normalized = emoji.trim().trim_end_matches('\u{fe0f}');
    normalized == DELETE_REACTION.trim_end_matches('\u{fe0f}')
        || normalized.trim_matches(':').eq_ignore_ascii_case("wastebasket")
}

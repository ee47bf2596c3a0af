use async_trait::async_trait;
use thiserror::Error;

use ekko_core::domain::conversation::{ConversationKey, UserId};
use ekko_core::errors::ApplicationError;

use crate::reply::{self, ReplyBody};

pub const HELP_HINT: &str = "Dùng `/help` để xem hướng dẫn.";
pub const RESET_CONFIRMATION: &str = "🍶 Đã quên chuyện cũ.";
pub const UNKNOWN_PERSONA: &str = "Không tìm thấy persona này.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashCommandPayload {
    pub command: String,
    pub argument: Option<String>,
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub interaction_id: String,
}

impl SlashCommandPayload {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.user_id.clone(), self.channel_id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCommand {
    Help,
    Reset,
    SetPersona { persona_key: String },
}

/// `!`-prefixed commands typed as ordinary messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixCommand {
    Help,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersonaSelection {
    Selected { persona_key: String },
    Unknown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unsupported slash command: {0}")]
    UnsupportedCommand(String),
    #[error("slash command `/{command}` requires `{argument}`")]
    MissingArgument { command: &'static str, argument: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandRouteError {
    #[error("command service failed: {0}")]
    Service(#[from] ApplicationError),
}

pub fn parse_slash_command(
    payload: &SlashCommandPayload,
) -> Result<GatewayCommand, CommandParseError> {
    let name = payload.command.trim().trim_start_matches('/').to_ascii_lowercase();
    match name.as_str() {
        "help" => Ok(GatewayCommand::Help),
        "reset" => Ok(GatewayCommand::Reset),
        "set-persona" => {
            let persona_key = payload
                .argument
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or(CommandParseError::MissingArgument {
                    command: "set-persona",
                    argument: "persona_key",
                })?;
            Ok(GatewayCommand::SetPersona { persona_key: persona_key.to_owned() })
        }
        _ => Err(CommandParseError::UnsupportedCommand(payload.command.clone())),
    }
}

/// Case-insensitive prefix match on the trimmed message, so `!Reset now`
/// still resets.
pub fn parse_prefix_command(text: &str) -> Option<PrefixCommand> {
    let lower = text.trim().to_lowercase();
    if lower.starts_with("!help") {
        Some(PrefixCommand::Help)
    } else if lower.starts_with("!reset") {
        Some(PrefixCommand::Reset)
    } else {
        None
    }
}

#[async_trait]
pub trait CommandService: Send + Sync {
    fn target_channels(&self) -> Vec<String>;

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), CommandRouteError>;

    async fn select_persona(
        &self,
        user_id: &UserId,
        persona_key: &str,
    ) -> Result<PersonaSelection, CommandRouteError>;
}

#[async_trait]
impl<T> CommandService for std::sync::Arc<T>
where
    T: CommandService + ?Sized,
{
    fn target_channels(&self) -> Vec<String> {
        (**self).target_channels()
    }

    async fn reset_conversation(&self, key: &ConversationKey) -> Result<(), CommandRouteError> {
        (**self).reset_conversation(key).await
    }

    async fn select_persona(
        &self,
        user_id: &UserId,
        persona_key: &str,
    ) -> Result<PersonaSelection, CommandRouteError> {
        (**self).select_persona(user_id, persona_key).await
    }
}

pub struct CommandRouter<S> {
    service: S,
}

impl<S> CommandRouter<S>
where
    S: CommandService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn route(
        &self,
        command: GatewayCommand,
        payload: &SlashCommandPayload,
    ) -> Result<ReplyBody, CommandRouteError> {
        match command {
            GatewayCommand::Help => {
                Ok(ReplyBody::Embed { embed: reply::help_embed(&self.service.target_channels()) })
            }
            GatewayCommand::Reset => {
                self.service.reset_conversation(&payload.conversation_key()).await?;
                Ok(ReplyBody::text(RESET_CONFIRMATION))
            }
            GatewayCommand::SetPersona { persona_key } => {
                let user_id = UserId(payload.user_id.clone());
                match self.service.select_persona(&user_id, &persona_key).await? {
                    PersonaSelection::Selected { persona_key } => {
                        Ok(ReplyBody::text(format!("Đã đổi sang: `{persona_key}`")))
                    }
                    PersonaSelection::Unknown => Ok(ReplyBody::text(UNKNOWN_PERSONA)),
                }
            }
        }
    }
}

#[derive(Default)]
pub struct NoopCommandService;

#[async_trait]
impl CommandService for NoopCommandService {
    fn target_channels(&self) -> Vec<String> {
        Vec::new()
    }

    async fn reset_conversation(&self, _key: &ConversationKey) -> Result<(), CommandRouteError> {
        Ok(())
    }

    async fn select_persona(
        &self,
        _user_id: &UserId,
        _persona_key: &str,
    ) -> Result<PersonaSelection, CommandRouteError> {
        Ok(PersonaSelection::Unknown)
    }
}

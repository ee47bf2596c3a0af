use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

/// One user talking in one channel. History is scoped to this pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: UserId,
    pub channel_id: ChannelId,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self { user_id: UserId(user_id.into()), channel_id: ChannelId(channel_id.into()) }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id.0, self.channel_id.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    User,
    Assistant,
}

impl ParticipantRole {
    /// Column value used by the `chats` table.
    pub fn as_storage_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "bot",
        }
    }

    pub fn from_storage_str(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "bot" | "assistant" => Ok(Self::Assistant),
            other => Err(DomainError::InvariantViolation(format!(
                "unknown participant role `{other}` (expected user|bot)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ParticipantRole,
    pub persona_label: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(persona_label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: ParticipantRole::User,
            persona_label: persona_label.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(persona_label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: ParticipantRole::Assistant,
            persona_label: persona_label.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationKey, ParticipantRole};

    #[test]
    fn role_storage_values_match_chat_table() {
        assert_eq!(ParticipantRole::User.as_storage_str(), "user");
        assert_eq!(ParticipantRole::Assistant.as_storage_str(), "bot");
        assert_eq!(ParticipantRole::from_storage_str("BOT"), Ok(ParticipantRole::Assistant));
        assert!(ParticipantRole::from_storage_str("system").is_err());
    }

    #[test]
    fn conversation_key_display_is_user_at_channel() {
        assert_eq!(ConversationKey::new("42", "hoi-dap").to_string(), "42@hoi-dap");
    }
}

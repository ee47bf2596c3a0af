use async_trait::async_trait;
use thiserror::Error;

use ekko_core::domain::conversation::{ChannelId, ConversationKey, ConversationTurn, UserId};
use ekko_core::errors::ApplicationError;

pub mod chat;
pub mod memory;

pub use chat::SqlConversationRepository;
pub use memory::InMemoryConversationRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        Self::Persistence(error.to_string())
    }
}

/// Append-only chat history scoped by user and channel.
///
/// Implementations must accept concurrent appends from many conversations.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn append_turn(
        &self,
        key: &ConversationKey,
        turn: ConversationTurn,
    ) -> Result<(), RepositoryError>;

    /// The most recent `limit` turns, returned oldest first.
    async fn fetch_recent_turns(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;

    /// Removes the whole history for the pair and returns the number of turns removed.
    async fn clear_conversation(&self, key: &ConversationKey) -> Result<u64, RepositoryError>;

    /// Authors of the last `limit` turns in a channel, newest first, without duplicates.
    async fn recent_participants(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<UserId>, RepositoryError>;
}

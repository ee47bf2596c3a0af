use std::collections::HashMap;

use tokio::sync::RwLock;

use ekko_core::domain::conversation::{ChannelId, ConversationKey, ConversationTurn, UserId};

use super::{ConversationRepository, RepositoryError};

#[derive(Default)]
struct MemoryLog {
    next_id: u64,
    turns: HashMap<ConversationKey, Vec<(u64, ConversationTurn)>>,
}

/// Process-local history used by tests and by `ekko ask`.
#[derive(Default)]
pub struct InMemoryConversationRepository {
    log: RwLock<MemoryLog>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn append_turn(
        &self,
        key: &ConversationKey,
        turn: ConversationTurn,
    ) -> Result<(), RepositoryError> {
        let mut log = self.log.write().await;
        log.next_id += 1;
        let id = log.next_id;
        log.turns.entry(key.clone()).or_default().push((id, turn));
        Ok(())
    }

    async fn fetch_recent_turns(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let log = self.log.read().await;
        let Some(turns) = log.turns.get(key) else {
            return Ok(Vec::new());
        };
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].iter().map(|(_, turn)| turn.clone()).collect())
    }

    async fn clear_conversation(&self, key: &ConversationKey) -> Result<u64, RepositoryError> {
        let mut log = self.log.write().await;
        let removed = log.turns.remove(key).map(|turns| turns.len()).unwrap_or(0);
        Ok(removed as u64)
    }

    async fn recent_participants(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let log = self.log.read().await;
        let mut rows: Vec<(u64, &UserId)> = log
            .turns
            .iter()
            .filter(|(key, _)| &key.channel_id == channel_id)
            .flat_map(|(key, turns)| turns.iter().map(move |(id, _)| (*id, &key.user_id)))
            .collect();
        rows.sort_by(|left, right| right.0.cmp(&left.0));

        let mut participants: Vec<UserId> = Vec::new();
        for (_, user_id) in rows.into_iter().take(limit) {
            if !participants.contains(user_id) {
                participants.push(user_id.clone());
            }
        }
        Ok(participants)
    }
}

#[cfg(test)]
mod tests {
    use ekko_core::domain::conversation::{ChannelId, ConversationKey, ConversationTurn, UserId};

    use super::InMemoryConversationRepository;
    use crate::repositories::ConversationRepository;

    #[tokio::test]
    async fn in_memory_history_round_trip() {
        let repo = InMemoryConversationRepository::default();
        let key = ConversationKey::new("u-1", "c-1");

        for index in 0..5 {
            repo.append_turn(&key, ConversationTurn::user("p", format!("m{index}")))
                .await
                .expect("append");
        }

        let turns = repo.fetch_recent_turns(&key, 2).await.expect("fetch");
        let texts: Vec<&str> = turns.iter().map(|turn| turn.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);

        assert_eq!(repo.clear_conversation(&key).await.expect("clear"), 5);
        assert!(repo.fetch_recent_turns(&key, 2).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn in_memory_participants_follow_append_order_across_users() {
        let repo = InMemoryConversationRepository::default();
        for user in ["alice", "bob", "alice"] {
            repo.append_turn(&ConversationKey::new(user, "c"), ConversationTurn::user("p", "x"))
                .await
                .expect("append");
        }

        let participants =
            repo.recent_participants(&ChannelId("c".to_string()), 5).await.expect("participants");
        assert_eq!(participants, vec![UserId("alice".to_string()), UserId("bob".to_string())]);
    }
}

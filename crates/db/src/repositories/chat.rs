use chrono::{DateTime, Utc};
use sqlx::Row;

use ekko_core::domain::conversation::{
    ChannelId, ConversationKey, ConversationTurn, ParticipantRole, UserId,
};

use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationTurn, RepositoryError> {
    let role_str: String =
        row.try_get("role").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let persona: String =
        row.try_get("persona").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let timestamp_str: String =
        row.try_get("timestamp").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let role = ParticipantRole::from_storage_str(&role_str)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("timestamp `{timestamp_str}`: {e}")))?;

    Ok(ConversationTurn { role, persona_label: persona, text: content, timestamp })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn append_turn(
        &self,
        key: &ConversationKey,
        turn: ConversationTurn,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chats (user_id, channel_id, role, persona, content, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.user_id.0)
        .bind(&key.channel_id.0)
        .bind(turn.role.as_storage_str())
        .bind(&turn.persona_label)
        .bind(&turn.text)
        .bind(turn.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_recent_turns(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT role, persona, content, timestamp
             FROM chats
             WHERE user_id = ? AND channel_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(&key.user_id.0)
        .bind(&key.channel_id.0)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn clear_conversation(&self, key: &ConversationKey) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM chats WHERE user_id = ? AND channel_id = ?")
            .bind(&key.user_id.0)
            .bind(&key.channel_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn recent_participants(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT user_id FROM chats WHERE channel_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(&channel_id.0)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut participants: Vec<UserId> = Vec::with_capacity(rows.len());
        for row in &rows {
            let user_id: String =
                row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let user_id = UserId(user_id);
            if !participants.contains(&user_id) {
                participants.push(user_id);
            }
        }
        Ok(participants)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ekko_core::domain::conversation::{
        ChannelId, ConversationKey, ConversationTurn, ParticipantRole, UserId,
    };
    use ekko_core::errors::ApplicationError;

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlConversationRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConversationRepository::new(pool)
    }

    #[tokio::test]
    async fn append_and_fetch_returns_oldest_first() {
        let repo = setup().await;
        let key = ConversationKey::new("u-1", "c-1");

        repo.append_turn(&key, ConversationTurn::user("tieu_thu_dong", "Xin chào"))
            .await
            .expect("append user");
        repo.append_turn(&key, ConversationTurn::assistant("tieu_thu_dong", "Tại hạ xin chào"))
            .await
            .expect("append bot");

        let turns = repo.fetch_recent_turns(&key, 10).await.expect("fetch");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ParticipantRole::User);
        assert_eq!(turns[0].text, "Xin chào");
        assert_eq!(turns[1].role, ParticipantRole::Assistant);
        assert_eq!(turns[1].persona_label, "tieu_thu_dong");
    }

    #[tokio::test]
    async fn fetch_is_bounded_to_most_recent_turns() {
        let repo = setup().await;
        let key = ConversationKey::new("u-1", "c-1");
        for index in 0..8 {
            repo.append_turn(&key, ConversationTurn::user("p", format!("turn {index}")))
                .await
                .expect("append");
        }

        let turns = repo.fetch_recent_turns(&key, 3).await.expect("fetch");
        let texts: Vec<&str> = turns.iter().map(|turn| turn.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 5", "turn 6", "turn 7"]);

        assert!(repo.fetch_recent_turns(&key, 0).await.expect("fetch none").is_empty());
    }

    #[tokio::test]
    async fn history_is_scoped_to_user_and_channel() {
        let repo = setup().await;
        let alice_here = ConversationKey::new("alice", "hoi-dap");
        let alice_there = ConversationKey::new("alice", "khac");
        let bob_here = ConversationKey::new("bob", "hoi-dap");

        repo.append_turn(&alice_here, ConversationTurn::user("p", "a1")).await.expect("append");
        repo.append_turn(&alice_there, ConversationTurn::user("p", "a2")).await.expect("append");
        repo.append_turn(&bob_here, ConversationTurn::user("p", "b1")).await.expect("append");

        let turns = repo.fetch_recent_turns(&alice_here, 10).await.expect("fetch");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "a1");
    }

    #[tokio::test]
    async fn clear_conversation_removes_only_that_pair() {
        let repo = setup().await;
        let alice = ConversationKey::new("alice", "hoi-dap");
        let bob = ConversationKey::new("bob", "hoi-dap");

        repo.append_turn(&alice, ConversationTurn::user("p", "1")).await.expect("append");
        repo.append_turn(&alice, ConversationTurn::assistant("p", "2")).await.expect("append");
        repo.append_turn(&bob, ConversationTurn::user("p", "3")).await.expect("append");

        let removed = repo.clear_conversation(&alice).await.expect("clear");
        assert_eq!(removed, 2);
        assert!(repo.fetch_recent_turns(&alice, 10).await.expect("fetch").is_empty());
        assert_eq!(repo.fetch_recent_turns(&bob, 10).await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn recent_participants_are_newest_first_and_distinct() {
        let repo = setup().await;
        let channel = ChannelId("hoi-dap".to_string());

        for (user, text) in [("alice", "1"), ("bob", "2"), ("alice", "3"), ("carol", "4")] {
            repo.append_turn(&ConversationKey::new(user, "hoi-dap"), ConversationTurn::user("p", text))
                .await
                .expect("append");
        }
        repo.append_turn(&ConversationKey::new("dave", "khac"), ConversationTurn::user("p", "5"))
            .await
            .expect("append");

        let participants = repo.recent_participants(&channel, 3).await.expect("participants");
        assert_eq!(
            participants,
            vec![UserId("carol".to_string()), UserId("alice".to_string()), UserId("bob".to_string())]
        );
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_persisted() {
        let repo = Arc::new(setup().await);
        let mut handles = Vec::new();
        for index in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                let key = ConversationKey::new(format!("u-{}", index % 4), "c");
                repo.append_turn(&key, ConversationTurn::user("p", format!("m{index}"))).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }

        let mut total = 0;
        for user in 0..4 {
            total += repo
                .fetch_recent_turns(&ConversationKey::new(format!("u-{user}"), "c"), 100)
                .await
                .expect("fetch")
                .len();
        }
        assert_eq!(total, 16);
    }

    #[tokio::test]
    async fn unknown_role_surfaces_decode_error() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        sqlx::query("PRAGMA ignore_check_constraints = ON")
            .execute(&pool)
            .await
            .expect("disable check constraints");
        sqlx::query(
            "INSERT INTO chats (user_id, channel_id, role, persona, content, timestamp)
             VALUES ('u', 'c', 'narrator', 'p', 'x', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert raw row");

        let repo = SqlConversationRepository::new(pool);
        let error = repo
            .fetch_recent_turns(&ConversationKey::new("u", "c"), 5)
            .await
            .expect_err("unknown role should not decode");
        assert!(matches!(error, RepositoryError::Decode(_)));
    }

    #[tokio::test]
    async fn malformed_timestamp_surfaces_decode_error() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        sqlx::query(
            "INSERT INTO chats (user_id, channel_id, role, persona, content, timestamp)
             VALUES ('u', 'c', 'user', 'p', 'x', 'hôm qua')",
        )
        .execute(&pool)
        .await
        .expect("insert raw row");

        let repo = SqlConversationRepository::new(pool);
        let error = repo
            .fetch_recent_turns(&ConversationKey::new("u", "c"), 5)
            .await
            .expect_err("unparseable timestamp should not decode");
        assert!(matches!(&error, RepositoryError::Decode(message) if message.contains("hôm qua")));
        assert!(matches!(
            ApplicationError::from(error),
            ApplicationError::Persistence(message) if message.starts_with("decode error")
        ));
    }
}

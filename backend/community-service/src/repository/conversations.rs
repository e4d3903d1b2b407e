use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use change_feed::{ChangeAction, ChangeEvent, ChangePublisher, ChangeTable};

use super::MessageStore;
use crate::domain::{Conversation, ConversationParticipant, ConversationThread, Message};
use crate::error::{StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_message_text: Option<String>,
}

/// Direct messaging tables in Postgres
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
    publisher: Option<ChangePublisher>,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            publisher: None,
        }
    }

    pub fn with_publisher(pool: PgPool, publisher: ChangePublisher) -> Self {
        Self {
            pool,
            publisher: Some(publisher),
        }
    }

    async fn announce(
        &self,
        table: ChangeTable,
        action: ChangeAction,
        record_id: Option<Uuid>,
        conversation_id: Uuid,
    ) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let event = ChangeEvent::new(table, action, record_id, publisher.source())
            .with_scope(conversation_id.to_string());
        if let Err(e) = publisher.publish(event).await {
            warn!(
                table = %table,
                conversation_id = %conversation_id,
                error = %e,
                "Failed to publish change event"
            );
        }
    }

    /// Attach participants to conversation rows, keeping row order
    async fn with_participants(&self, rows: Vec<ConversationRow>) -> StoreResult<Vec<Conversation>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let participants = sqlx::query_as::<_, ConversationParticipant>(
            r#"
            SELECT id, conversation_id, user_id, created_at
            FROM conversation_participants
            WHERE conversation_id = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_conversation: HashMap<Uuid, Vec<ConversationParticipant>> = HashMap::new();
        for participant in participants {
            by_conversation
                .entry(participant.conversation_id)
                .or_default()
                .push(participant);
        }

        Ok(rows
            .into_iter()
            .map(|row| Conversation {
                participants: by_conversation.remove(&row.id).unwrap_or_default(),
                id: row.id,
                created_at: row.created_at,
                updated_at: row.updated_at,
                last_message_text: row.last_message_text,
            })
            .collect())
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, created_at, updated_at, last_message_text
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;

        self.with_participants(vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn conversations_for(&self, user_id: &str) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT c.id, c.created_at, c.updated_at, c.last_message_text
            FROM conversations c
            WHERE EXISTS (
                SELECT 1 FROM conversation_participants p
                WHERE p.conversation_id = c.id AND p.user_id = $1
            )
            ORDER BY c.updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        self.with_participants(rows).await
    }

    async fn conversation_with_messages(
        &self,
        conversation_id: Uuid,
    ) -> StoreResult<ConversationThread> {
        let conversation = self.load_conversation(conversation_id).await?;

        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, conversation_id, sender_id, content, created_at, read
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ConversationThread {
            conversation,
            messages,
        })
    }

    async fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> StoreResult<Option<Conversation>> {
        let shared: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT a.conversation_id
            FROM conversation_participants a
            JOIN conversation_participants b ON b.conversation_id = a.conversation_id
            WHERE a.user_id = $1 AND b.user_id = $2
            LIMIT 1
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_optional(&self.pool)
        .await?;

        match shared {
            Some(id) => Ok(Some(self.load_conversation(id).await?)),
            None => Ok(None),
        }
    }

    async fn create_conversation(&self, user_a: &str, user_b: &str) -> StoreResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            INSERT INTO conversations DEFAULT VALUES
            RETURNING id, created_at, updated_at, last_message_text
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        for user_id in [user_a, user_b] {
            sqlx::query(
                "INSERT INTO conversation_participants (conversation_id, user_id) VALUES ($1, $2)",
            )
            .bind(row.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(conversation_id = %row.id, "Conversation created");
        self.announce(
            ChangeTable::Conversations,
            ChangeAction::Insert,
            Some(row.id),
            row.id,
        )
        .await;

        self.load_conversation(row.id).await
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        content: &str,
    ) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;

        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (conversation_id, sender_id, content)
            SELECT $1, $2, $3
            WHERE EXISTS (SELECT 1 FROM conversations WHERE id = $1)
            RETURNING id, conversation_id, sender_id, content, created_at, read
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET updated_at = $2, last_message_text = $3
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(message.created_at)
        .bind(content)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.announce(
            ChangeTable::Messages,
            ChangeAction::Insert,
            Some(message.id),
            conversation_id,
        )
        .await;
        self.announce(
            ChangeTable::Conversations,
            ChangeAction::Update,
            Some(conversation_id),
            conversation_id,
        )
        .await;

        Ok(message)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read = TRUE
            WHERE conversation_id = $1 AND sender_id <> $2 AND read = FALSE
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected();
        if updated > 0 {
            self.announce(ChangeTable::Messages, ChangeAction::Update, None, conversation_id)
                .await;
        }
        Ok(updated)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, conversation_id, sender_id, content, created_at, read
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }
}

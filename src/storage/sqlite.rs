// src/storage/sqlite.rs
// Durable storage backend, selected via `chat.storage.backend = "sqlite"`.
// Same operation contract as the in-memory reference; the idempotency
// check and the sequence counter update share a transaction so a
// duplicate insert can never observe (or consume) a new sequence id.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::{ConversationRecord, StorageBackend, StorageError, StorageResult};
use crate::model::{Message, MessageKind, MessageStatus, Participant, ParticipantKind, Sender};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(10).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(database_url, "sqlite storage backend ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory_for_tests() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool");
        sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
        Self { pool }
    }
}

fn participant_kind_str(kind: ParticipantKind) -> &'static str {
    match kind {
        ParticipantKind::Human => "HUMAN",
        ParticipantKind::Ai => "AI",
        ParticipantKind::System => "SYSTEM",
    }
}

fn parse_participant_kind(s: &str) -> ParticipantKind {
    match s {
        "AI" => ParticipantKind::Ai,
        "SYSTEM" => ParticipantKind::System,
        _ => ParticipantKind::Human,
    }
}

fn message_kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "TEXT",
        MessageKind::System => "SYSTEM",
        MessageKind::AiResponse => "AI_RESPONSE",
        MessageKind::Join => "JOIN",
        MessageKind::Leave => "LEAVE",
        MessageKind::Error => "ERROR",
    }
}

fn parse_message_kind(s: &str) -> MessageKind {
    match s {
        "SYSTEM" => MessageKind::System,
        "AI_RESPONSE" => MessageKind::AiResponse,
        "JOIN" => MessageKind::Join,
        "LEAVE" => MessageKind::Leave,
        "ERROR" => MessageKind::Error,
        _ => MessageKind::Text,
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn store_message(&self, message: &Message) -> StorageResult<()> {
        let metadata_json = serde_json::to_string(&message.metadata).unwrap_or_else(|_| "{}".to_string());
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
                (conversation_id, sequence_id, message_id, sender_id, sender_name, sender_kind, content, kind, timestamp, status, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.conversation_id)
        .bind(message.sequence_id as i64)
        .bind(&message.message_id)
        .bind(&message.sender.id)
        .bind(&message.sender.display_name)
        .bind(participant_kind_str(message.sender.kind))
        .bind(&message.content)
        .bind(message_kind_str(message.kind))
        .bind(message.timestamp.to_rfc3339())
        .bind("DELIVERED")
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(message_id = %message.message_id, "duplicate message_id, store_message is a no-op");
        }

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE conversation_id = ?")
            .bind(message.timestamp.to_rfc3339())
            .bind(&message.conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        after_seq: Option<u64>,
    ) -> StorageResult<Vec<Message>> {
        let rows = match after_seq {
            Some(seq) => {
                sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ? AND sequence_id > ?
                     ORDER BY sequence_id ASC LIMIT ?",
                )
                .bind(conversation_id)
                .bind(seq as i64)
                .bind(limit.unwrap_or(100) as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM (SELECT * FROM messages WHERE conversation_id = ?
                     ORDER BY sequence_id DESC LIMIT ?) ORDER BY sequence_id ASC",
                )
                .bind(conversation_id)
                .bind(limit.unwrap_or(100) as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());
            let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&metadata_json).unwrap_or_default();
            let timestamp: String = row.try_get("timestamp")?;
            out.push(Message {
                message_id: row.try_get("message_id")?,
                conversation_id: row.try_get("conversation_id")?,
                sequence_id: row.try_get::<i64, _>("sequence_id")? as u64,
                sender: Sender {
                    id: row.try_get("sender_id")?,
                    display_name: row.try_get("sender_name")?,
                    kind: parse_participant_kind(&row.try_get::<String, _>("sender_kind")?),
                },
                content: row.try_get("content")?,
                kind: parse_message_kind(&row.try_get::<String, _>("kind")?),
                timestamp: DateTime::parse_from_rfc3339(&timestamp).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                status: MessageStatus::Delivered,
                metadata,
            });
        }
        Ok(out)
    }

    async fn next_sequence_id(&self, conversation_id: &str) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO sequence_counters (conversation_id, next_sequence_id) VALUES (?, 1)")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            "UPDATE sequence_counters SET next_sequence_id = next_sequence_id + 1
             WHERE conversation_id = ? RETURNING next_sequence_id - 1 AS allocated",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;
        let allocated: i64 = row.try_get("allocated")?;
        tx.commit().await?;
        Ok(allocated as u64)
    }

    async fn has_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM messages WHERE conversation_id = ? AND message_id = ?")
            .bind(conversation_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? AND message_id = ?")
            .bind(conversation_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let metadata_json: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());
        let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&metadata_json).unwrap_or_default();
        let timestamp: String = row.try_get("timestamp")?;
        Ok(Some(Message {
            message_id: row.try_get("message_id")?,
            conversation_id: row.try_get("conversation_id")?,
            sequence_id: row.try_get::<i64, _>("sequence_id")? as u64,
            sender: Sender {
                id: row.try_get("sender_id")?,
                display_name: row.try_get("sender_name")?,
                kind: parse_participant_kind(&row.try_get::<String, _>("sender_kind")?),
            },
            content: row.try_get("content")?,
            kind: parse_message_kind(&row.try_get::<String, _>("kind")?),
            timestamp: DateTime::parse_from_rfc3339(&timestamp).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
            status: MessageStatus::Delivered,
            metadata,
        }))
    }

    async fn create_conversation(&self, record: ConversationRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversations (conversation_id, created_at, updated_at, title, active)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.conversation_id)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.title)
        .bind(record.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(ConversationRecord {
            conversation_id: row.try_get("conversation_id")?,
            created_at: parse_dt(row.try_get("created_at")?),
            updated_at: parse_dt(row.try_get("updated_at")?),
            title: row.try_get("title")?,
            active: row.try_get("active")?,
        }))
    }

    async fn update_conversation(&self, record: ConversationRecord) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET updated_at = ?, title = ?, active = ? WHERE conversation_id = ?",
        )
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.title)
        .bind(record.active)
        .bind(&record.conversation_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(conversation_id = %record.conversation_id, "update_conversation on an unknown conversation");
            return Err(StorageError::NotFound(record.conversation_id));
        }
        Ok(())
    }

    async fn is_participant(&self, conversation_id: &str, participant_id: &str) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM participants WHERE conversation_id = ? AND participant_id = ?",
        )
        .bind(conversation_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_participant_count(&self, conversation_id: &str) -> StorageResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM participants WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("c")?;
        Ok(count as usize)
    }

    async fn update_participants(&self, conversation_id: &str, participants: &[Participant]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM participants WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        for p in participants {
            sqlx::query(
                "INSERT INTO participants (conversation_id, participant_id, display_name, kind, joined_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(&p.participant_id)
            .bind(&p.display_name)
            .bind(participant_kind_str(p.kind))
            .bind(p.joined_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_user_conversations(
        &self,
        participant_id: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            "SELECT c.* FROM conversations c
             JOIN participants p ON p.conversation_id = c.conversation_id
             WHERE p.participant_id = ?
             ORDER BY c.updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(participant_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConversationRecord {
                conversation_id: row.try_get("conversation_id")?,
                created_at: parse_dt(row.try_get("created_at")?),
                updated_at: parse_dt(row.try_get("updated_at")?),
                title: row.try_get("title")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }
}

fn parse_dt(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    fn sender(id: &str) -> Sender {
        Sender { id: id.to_string(), display_name: id.to_string(), kind: ParticipantKind::Human }
    }

    #[tokio::test]
    async fn sequence_allocation_is_atomic_and_gap_free() {
        let storage = std::sync::Arc::new(SqliteStorage::in_memory_for_tests().await);
        storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move { storage.next_sequence_id("c1").await.unwrap() }));
        }
        let mut ids: Vec<u64> = futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicate_insert_is_ignored() {
        let storage = SqliteStorage::in_memory_for_tests().await;
        storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();
        let mut m = Message::draft("x", "c1", sender("alice"), "hi".into(), MessageKind::Text).unwrap();
        m.sequence_id = 1;
        storage.store_message(&m).await.unwrap();
        storage.store_message(&m).await.unwrap();
        let all = storage.get_conversation_messages("c1", None, None).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}

use async_trait::async_trait;
use crate::models::chat::{ ChatMessage, Conversation };
use crate::history::{ HistoryError, HistoryStore };
use chrono::Utc;
use log::error;
use redis::{ Client, AsyncCommands };
use uuid::Uuid;

/// Conversations in Redis: a `{prefix}{id}:meta` hash (title, created_at) and a
/// `{prefix}{id}:messages` list of JSON-encoded messages in conversation order.
pub struct RedisHistoryStore {
    client: Client,
    key_prefix: String,
}

impl RedisHistoryStore {
    pub fn new(host: &str, key_prefix: &str) -> Result<Self, HistoryError> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn meta_key(&self, conversation_id: &str) -> String {
        format!("{}{}:meta", self.key_prefix, conversation_id)
    }

    fn messages_key(&self, conversation_id: &str) -> String {
        format!("{}{}:messages", self.key_prefix, conversation_id)
    }

    async fn ensure_exists(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        conversation_id: &str
    ) -> Result<(), HistoryError> {
        let exists: bool = conn.exists(self.meta_key(conversation_id)).await?;
        if exists {
            Ok(())
        } else {
            Err(HistoryError::NotFound(conversation_id.to_string()))
        }
    }

    async fn stored_messages(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        conversation_id: &str
    ) -> Result<Vec<(String, ChatMessage)>, HistoryError> {
        let entries: Vec<String> = conn.lrange(self.messages_key(conversation_id), 0, -1).await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<ChatMessage>(&entry) {
                Ok(msg) => messages.push((entry, msg)),
                Err(e) => {
                    error!("Error parsing history entry: {}", e);
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn create_conversation(&self, title: &str) -> Result<String, HistoryError> {
        let mut conn = self.get_connection().await?;
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp().to_string();
        let _: () = conn.hset_multiple(
            self.meta_key(&id),
            &[("title", title), ("created_at", created_at.as_str())]
        ).await?;
        Ok(id)
    }

    async fn save_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;
        self.ensure_exists(&mut conn, conversation_id).await?;
        let key = self.messages_key(conversation_id);
        let json_msg = serde_json::to_string(message)?;

        let existing = self.stored_messages(&mut conn, conversation_id).await?;
        match existing.iter().position(|(_, m)| m.id == message.id) {
            Some(index) => {
                let _: () = conn.lset(&key, index as isize, &json_msg).await?;
            }
            None => {
                let _: i64 = conn.rpush(&key, &json_msg).await?;
            }
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;
        let key = self.messages_key(conversation_id);
        let existing = self.stored_messages(&mut conn, conversation_id).await?;
        if let Some((raw, _)) = existing.into_iter().find(|(_, m)| m.id == message_id) {
            let _: i64 = conn.lrem(&key, 1, raw).await?;
        }
        Ok(())
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Conversation, HistoryError> {
        let mut conn = self.get_connection().await?;
        self.ensure_exists(&mut conn, conversation_id).await?;
        let title: Option<String> = conn.hget(self.meta_key(conversation_id), "title").await?;
        let messages = self
            .stored_messages(&mut conn, conversation_id).await?
            .into_iter()
            .map(|(_, m)| m)
            .collect();

        Ok(Conversation {
            id: conversation_id.to_string(),
            title: title.unwrap_or_default(),
            messages,
        })
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection().await?;
        self.ensure_exists(&mut conn, conversation_id).await?;
        let _: () = conn.hset(self.meta_key(conversation_id), "title", title).await?;
        Ok(())
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::history::{ HistoryError, HistoryStore };
use crate::models::chat::{ ChatMessage, Conversation };

/// Process-local store, lost on restart.
#[derive(Default)]
pub struct MemoryHistoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_conversation(&self, title: &str) -> Result<String, HistoryError> {
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation {
            id: id.clone(),
            title: title.to_string(),
            messages: Vec::new(),
        };
        self.conversations.write().await.insert(id.clone(), conversation);
        Ok(id)
    }

    async fn save_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage
    ) -> Result<(), HistoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))?;

        match conversation.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message.clone();
            }
            None => conversation.messages.push(message.clone()),
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str
    ) -> Result<(), HistoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))?;
        conversation.messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Conversation, HistoryError> {
        self.conversations
            .read().await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str
    ) -> Result<(), HistoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))?;
        conversation.title = title.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_loads_and_deletes_messages() {
        let store = MemoryHistoryStore::new();
        let id = store.create_conversation("Prayer times").await.unwrap();

        let question = ChatMessage::user("When is Asr?");
        let answer = ChatMessage::assistant("Asr begins in the afternoon.");
        store.save_message(&id, &question).await.unwrap();
        store.save_message(&id, &answer).await.unwrap();

        let conversation = store.load_conversation(&id).await.unwrap();
        assert_eq!(conversation.title, "Prayer times");
        assert_eq!(conversation.messages, vec![question.clone(), answer.clone()]);

        store.delete_message(&id, &question.id).await.unwrap();
        let conversation = store.load_conversation(&id).await.unwrap();
        assert_eq!(conversation.messages, vec![answer]);
    }

    #[tokio::test]
    async fn saving_the_same_id_twice_updates_in_place() {
        let store = MemoryHistoryStore::new();
        let id = store.create_conversation("t").await.unwrap();
        let mut msg = ChatMessage::assistant("partial");
        store.save_message(&id, &msg).await.unwrap();
        msg.content.push_str(" and complete");
        store.save_message(&id, &msg).await.unwrap();

        let conversation = store.load_conversation(&id).await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].content, "partial and complete");
    }

    #[tokio::test]
    async fn rename_keeps_the_messages() {
        let store = MemoryHistoryStore::new();
        let id = store.create_conversation("New conversation").await.unwrap();
        store.save_message(&id, &ChatMessage::user("When is Asr?")).await.unwrap();

        store.rename_conversation(&id, "When is Asr?").await.unwrap();

        let conversation = store.load_conversation(&id).await.unwrap();
        assert_eq!(conversation.title, "When is Asr?");
        assert_eq!(conversation.messages.len(), 1);
        assert!(matches!(store.rename_conversation("missing", "x").await, Err(HistoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = MemoryHistoryStore::new();
        let msg = ChatMessage::user("hi");
        assert!(matches!(store.save_message("missing", &msg).await, Err(HistoryError::NotFound(_))));
        assert!(matches!(store.load_conversation("missing").await, Err(HistoryError::NotFound(_))));
    }
}

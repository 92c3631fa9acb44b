mod memory;
mod redis;
pub use memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::{ ChatMessage, Conversation };

const TITLE_MAX_CHARS: usize = 50;

/// Title a conversation carries until its first question is settled.
pub const DEFAULT_TITLE: &str = "New conversation";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("conversation '{0}' not found")]
    NotFound(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("stored message could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported history store type: {0}")]
    Unsupported(String),
}

/// Where finished turns are kept. The chat pipeline calls it at fixed points of a request;
/// it never depends on the storage layout.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<String, HistoryError>;

    async fn save_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage
    ) -> Result<(), HistoryError>;

    async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str
    ) -> Result<(), HistoryError>;

    async fn load_conversation(&self, conversation_id: &str) -> Result<Conversation, HistoryError>;

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str
    ) -> Result<(), HistoryError>;
}

/// Builds the configured store. `none` runs in guest mode: nothing is persisted.
pub fn create_history_store(
    args: &Args
) -> Result<Option<Arc<dyn HistoryStore>>, HistoryError> {
    match args.history_type.to_lowercase().as_str() {
        "none" | "guest" => Ok(None),
        "memory" => Ok(Some(Arc::new(MemoryHistoryStore::new()))),
        "redis" => {
            let store = RedisHistoryStore::new(&args.history_host, &args.history_redis_prefix)?;
            Ok(Some(Arc::new(store)))
        }
        _ => Err(HistoryError::Unsupported(args.history_type.clone())),
    }
}

pub fn initialize_history_store(
    args: &Args
) -> Result<Option<Arc<dyn HistoryStore>>, HistoryError> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    create_history_store(args)
}

/// Title for a new conversation, taken from its first question.
pub fn conversation_title(first_message: &str) -> String {
    let line = first_message.trim().lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    title.push_str("...");
    title
}

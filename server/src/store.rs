use chrono::{DateTime, Utc};
use deepsearch_agent::ChatRole;
use std::{collections::HashMap, sync::Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("chat store error: {0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Chat persistence is an external collaborator; this is the contract the
/// routes and the finish sink depend on. Rows are always scoped to the owning
/// user.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<Chat, StoreError>;
    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<Option<Chat>, StoreError>;
    /// Returns false when the chat does not exist or belongs to another user.
    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError>;
    async fn append_message(
        &self,
        chat_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError>;
}

/// In-process reference implementation.
#[derive(Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryChatState>,
}

#[derive(Default)]
struct MemoryChatState {
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, chat_id: &str) -> Vec<StoredMessage> {
        let state = self.state.lock().expect("store state poisoned");
        state.messages.get(chat_id).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<Chat, StoreError> {
        let now = Utc::now();
        let chat = Chat {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().expect("store state poisoned");
        state.chats.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<Option<Chat>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .chats
            .get(chat_id)
            .filter(|chat| chat.user_id == user_id)
            .cloned())
    }

    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        let owned = state
            .chats
            .get(chat_id)
            .is_some_and(|chat| chat.user_id == user_id);
        if owned {
            state.chats.remove(chat_id);
            state.messages.remove(chat_id);
        }
        Ok(owned)
    }

    async fn append_message(
        &self,
        chat_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Some(chat) = state.chats.get_mut(chat_id) {
            chat.updated_at = Utc::now();
        }
        state
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(StoredMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }
}

//! Conversation persistence behind a small trait, plus the in-memory store.

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::agent::Role;
use crate::errors::DuetError;
use crate::extract::CodeBlock;

/// One recorded message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_blocks: Vec<CodeBlock>,
}

/// A conversation and its messages in insertion order.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub messages: Vec<Message>,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Storage for conversations and their messages.
///
/// Methods are synchronous; implementations must be cheap enough to call
/// from async tasks.
pub trait ConversationStore: Send + Sync {
    /// Creates an empty conversation and returns a snapshot of it.
    fn create_conversation(&self) -> Conversation;

    /// Appends a message to a conversation.
    fn add_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
        code_blocks: Vec<CodeBlock>,
    ) -> Result<Message, DuetError>;

    /// Returns the messages of a conversation in insertion order.
    fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, DuetError>;

    /// Returns every conversation, newest first.
    fn conversations(&self) -> Vec<Conversation>;

    /// Removes all messages from a conversation, keeping the conversation.
    fn clear_messages(&self, conversation_id: Uuid) -> Result<(), DuetError>;
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<Uuid, Conversation>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn create_conversation(&self) -> Conversation {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.conversations
            .insert(conversation.id, conversation.clone());
        debug!(conversation_id = %conversation.id, "created conversation");
        conversation
    }

    fn add_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
        code_blocks: Vec<CodeBlock>,
    ) -> Result<Message, DuetError> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(DuetError::ConversationNotFound {
                id: conversation_id,
            })?;
        let message = Message {
            id: Uuid::new_v4(),
            role,
            content: content.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            code_blocks,
        };
        conversation.messages.push(message.clone());
        debug!(%conversation_id, %role, "added message to conversation");
        Ok(message)
    }

    fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, DuetError> {
        self.conversations
            .get(&conversation_id)
            .map(|conversation| conversation.messages.clone())
            .ok_or(DuetError::ConversationNotFound {
                id: conversation_id,
            })
    }

    fn conversations(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    fn clear_messages(&self, conversation_id: Uuid) -> Result<(), DuetError> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(DuetError::ConversationNotFound {
                id: conversation_id,
            })?;
        conversation.messages.clear();
        debug!(%conversation_id, "cleared conversation messages");
        Ok(())
    }
}

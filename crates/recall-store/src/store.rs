use async_trait::async_trait;

use recall_core::conversation::{
    Conversation, ConversationSnapshot, ConversationStore, ConversationStoreError, NewMessage,
    StoredMessage,
};
use recall_core::ids::{ConversationId, UserId};

use crate::conversations::ConversationRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;

/// SQLite-backed [`ConversationStore`].
pub struct SqliteConversationStore {
    conversations: ConversationRepo,
    messages: MessageRepo,
}

impl SqliteConversationStore {
    pub fn new(db: Database) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

fn not_found_or_storage(id: &ConversationId, e: StoreError) -> ConversationStoreError {
    match e {
        StoreError::NotFound(_) => ConversationStoreError::NotFound(id.clone()),
        other => other.into(),
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn load_conversation(
        &self,
        id: &ConversationId,
        user_id: &UserId,
        history_limit: usize,
    ) -> Result<Option<ConversationSnapshot>, ConversationStoreError> {
        let Some(conversation) = self.conversations.get_for_user(id, user_id)? else {
            return Ok(None);
        };
        let history = self.messages.recent(id, history_limit)?;
        Ok(Some(ConversationSnapshot { conversation, history }))
    }

    async fn create_conversation(
        &self,
        user_id: &UserId,
        title: &str,
    ) -> Result<Conversation, ConversationStoreError> {
        Ok(self.conversations.create(user_id, title)?)
    }

    async fn append_message(
        &self,
        message: NewMessage,
    ) -> Result<StoredMessage, ConversationStoreError> {
        let id = message.conversation_id.clone();
        self.messages
            .append(message)
            .map_err(|e| not_found_or_storage(&id, e))
    }

    async fn touch(&self, id: &ConversationId) -> Result<(), ConversationStoreError> {
        self.conversations
            .touch(id)
            .map_err(|e| not_found_or_storage(id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::messages::Role;

    fn store() -> SqliteConversationStore {
        SqliteConversationStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn load_includes_history() {
        let store = store();
        let user = UserId::new("u1");
        let conv = store.create_conversation(&user, "Notes").await.unwrap();
        store.append_message(NewMessage::new(conv.id.clone(), Role::User, "q")).await.unwrap();
        store.append_message(NewMessage::new(conv.id.clone(), Role::Assistant, "a")).await.unwrap();

        let snapshot = store.load_conversation(&conv.id, &user, 20).await.unwrap().unwrap();
        assert_eq!(snapshot.conversation.message_count, 2);
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[0].role, Role::User);
    }

    #[tokio::test]
    async fn load_unknown_is_none() {
        let result = store()
            .load_conversation(&ConversationId::new(), &UserId::new("u1"), 20)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn append_to_unknown_maps_to_not_found() {
        let id = ConversationId::new();
        let err = store()
            .append_message(NewMessage::new(id.clone(), Role::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationStoreError::NotFound(found) if found == id));
    }

    #[tokio::test]
    async fn touch_unknown_maps_to_not_found() {
        let err = store().touch(&ConversationId::new()).await.unwrap_err();
        assert!(matches!(err, ConversationStoreError::NotFound(_)));
    }
}

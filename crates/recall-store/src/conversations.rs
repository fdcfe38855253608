use chrono::Utc;
use tracing::instrument;

use recall_core::conversation::Conversation;
use recall_core::ids::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, user_id, title, message_count, last_activity_at, created_at";

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, title), fields(user_id = %user_id))]
    pub fn create(&self, user_id: &UserId, title: &str) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            user_id: user_id.clone(),
            title: title.to_string(),
            message_count: 0,
            last_activity_at: now,
            created_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, message_count, last_activity_at, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                rusqlite::params![
                    conversation.id.as_str(),
                    user_id.as_str(),
                    title,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(conversation)
    }

    /// Fetch a conversation only if it belongs to `user_id`.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user_id))]
    pub fn get_for_user(
        &self,
        id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM conversations WHERE id = ?1 AND user_id = ?2"
            ))?;
            let mut rows = stmt.query([id.as_str(), user_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_conversation(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Bump last activity without adding a message.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn touch(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET last_activity_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, StoreError> {
    const T: &str = "conversations";
    let last_activity: String = row_helpers::get(row, 4, T, "last_activity_at")?;
    let created: String = row_helpers::get(row, 5, T, "created_at")?;
    Ok(Conversation {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        user_id: UserId::new(row_helpers::get::<String>(row, 1, T, "user_id")?),
        title: row_helpers::get(row, 2, T, "title")?,
        message_count: row_helpers::get(row, 3, T, "message_count")?,
        last_activity_at: row_helpers::parse_timestamp(&last_activity, T, "last_activity_at")?,
        created_at: row_helpers::parse_timestamp(&created, T, "created_at")?,
    })
}

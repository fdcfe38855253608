use chrono::Utc;
use tracing::instrument;

use recall_core::conversation::{NewMessage, StoredMessage};
use recall_core::ids::{ConversationId, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str =
    "id, conversation_id, sequence, role, content, thinking_content, tool_calls, metadata, created_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. In one transaction: assigns the next sequence,
    /// inserts the row, bumps the conversation's count and last activity.
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, role = message.role.as_str()))]
    pub fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&message.metadata)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let max_seq: Option<i64> = tx
                .query_row(
                    "SELECT COALESCE((SELECT MAX(sequence) FROM messages WHERE conversation_id = ?1), -1)
                     FROM conversations WHERE id = ?1",
                    [message.conversation_id.as_str()],
                    |row| row.get(0),
                )
                .ok();
            let Some(max_seq) = max_seq else {
                return Err(StoreError::NotFound(format!("conversation {}", message.conversation_id)));
            };

            let id = MessageId::new();
            let now = Utc::now();
            let sequence = max_seq + 1;

            tx.execute(
                &format!("INSERT INTO messages ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                rusqlite::params![
                    id.as_str(),
                    message.conversation_id.as_str(),
                    sequence,
                    message.role.as_str(),
                    message.content,
                    message.thinking_content,
                    tool_calls,
                    metadata,
                    now.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET message_count = message_count + 1, last_activity_at = ?1 WHERE id = ?2",
                rusqlite::params![now.to_rfc3339(), message.conversation_id.as_str()],
            )?;
            tx.commit()?;

            Ok(StoredMessage {
                id,
                conversation_id: message.conversation_id.clone(),
                sequence,
                role: message.role,
                content: message.content.clone(),
                thinking_content: message.thinking_content.clone(),
                tool_calls: message.tool_calls.clone(),
                metadata: message.metadata.clone(),
                created_at: now,
            })
        })
    }

    /// The most recent `limit` messages, oldest first.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, limit))]
    pub fn recent(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE conversation_id = ?1
                 ORDER BY sequence DESC LIMIT ?2"
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    const T: &str = "messages";
    let role: String = row_helpers::get(row, 3, T, "role")?;
    let tool_calls: Option<String> = row_helpers::get_opt(row, 6, T, "tool_calls")?;
    let metadata: String = row_helpers::get(row, 7, T, "metadata")?;
    let created: String = row_helpers::get(row, 8, T, "created_at")?;

    Ok(StoredMessage {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(row, 1, T, "conversation_id")?),
        sequence: row_helpers::get(row, 2, T, "sequence")?,
        role: row_helpers::parse_enum(&role, T, "role")?,
        content: row_helpers::get(row, 4, T, "content")?,
        thinking_content: row_helpers::get_opt(row, 5, T, "thinking_content")?,
        tool_calls: tool_calls
            .map(|raw| row_helpers::parse_json(&raw, T, "tool_calls"))
            .transpose()?,
        metadata: row_helpers::parse_json(&metadata, T, "metadata")?,
        created_at: row_helpers::parse_timestamp(&created, T, "created_at")?,
    })
}

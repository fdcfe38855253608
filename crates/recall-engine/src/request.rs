use serde::{Deserialize, Deserializer, Serialize};

use recall_core::ids::ConversationId;

use crate::error::ValidationError;

/// Largest accepted inline content item.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

/// Reference to a user asset, optionally carrying its content inline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl AssetRef {
    pub fn inline(kind: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            title: Some(title.into()),
            content: Some(content.into()),
        }
    }

    /// Title, else id, else kind.
    pub fn label(&self) -> &str {
        self.title
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or(&self.kind)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptContext {
    #[serde(default)]
    pub assets: Vec<AssetRef>,
    #[serde(default)]
    pub background_task_execution: bool,
}

/// Inbound prompt request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub content: Vec<AssetRef>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub context: PromptContext,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub trace: bool,
}

impl PromptRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// The prompt text, trimmed. Empty when only content was sent.
    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().map(str::trim).unwrap_or("")
    }

    /// Check the request shape. Returns the parsed conversation id, if one was given.
    pub fn validate(&self) -> Result<Option<ConversationId>, ValidationError> {
        if self.prompt_text().is_empty() && self.content.is_empty() {
            return Err(ValidationError::EmptyRequest);
        }

        for (index, item) in self.content.iter().enumerate() {
            let size = item.content.as_ref().map_or(0, String::len);
            if size > MAX_CONTENT_BYTES {
                return Err(ValidationError::ContentTooLarge {
                    index,
                    size,
                    limit: MAX_CONTENT_BYTES,
                });
            }
        }

        match self.conversation_id.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let id = ConversationId::from_raw(raw);
                if id.is_well_formed() {
                    Ok(Some(id))
                } else {
                    Err(ValidationError::InvalidConversationId(raw.to_string()))
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(AssetRef),
    Many(Vec<AssetRef>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<AssetRef>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(asset)) => vec![asset],
        Some(OneOrMany::Many(assets)) => assets,
    })
}

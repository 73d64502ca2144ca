use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Content given to an assistant message before its first fragment arrives.
pub const ASSISTANT_STUB: &str = "...";

/// Title used when a conversation is created without one.
pub const DEFAULT_TITLE: &str = "New Conversation";

// Who authored a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

// Represents a single stored message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    // Flips false -> true at most once, never back
    pub is_complete: bool,
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub owner: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incremental state of one assistant message, pushed to every subscriber of
/// its conversation. `content` is always the full accumulated text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub is_complete: bool,
    pub timestamp: DateTime<Utc>,
}

/// What a send request hands back before generation starts: the stored user
/// message and the assistant placeholder whose id every update will carry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub user_message: Message,
    pub assistant_message: Message,
}

// Represents a configured API endpoint/model
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelConfig {
    pub name: String, // User-friendly name (e.g., "OpenAI GPT-4o Mini")
    pub provider: String, // "openai_compatible" or "echo"
    pub api_url: String, // Base URL
    // Reference to the key, not the key itself: 'keyring', 'env:MY_API_KEY' or null
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    // Provider-specific options as a JSON string, e.g. {"model": "gpt-4o-mini"}
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<String>,
}

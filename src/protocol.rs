use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub type ConversationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id; absent on the provisional local copy of a user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub role: Role,
    pub content: String,
    pub created_at: NaiveDateTime,
}

impl Message {
    pub fn provisional_user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: content.into(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub last_message_time: NaiveDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub message: String,
}

/// Events pushed by `/api/chat/send-stream`, one per `data:` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    UserMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },
    AiStart {},
    AiChunk {
        #[serde(default)]
        content: String,
    },
    AiComplete {
        message: Message,
    },
    Error {
        #[serde(default)]
        error: String,
    },
}

impl StreamEvent {
    /// Values of the `type` tag this client understands.
    pub const KNOWN_TYPES: [&'static str; 5] =
        ["user_message", "ai_start", "ai_chunk", "ai_complete", "error"];
}

// Every non-streaming endpoint wraps its payload in `{ "success": bool, ... }`.

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
pub struct ConversationDetail {
    pub conversation: ConversationSummary,
    pub messages: Vec<Message>,
}

/// Body of endpoints that only report success.
#[derive(Debug, Deserialize)]
pub struct Acknowledged {}

#[derive(Debug, Deserialize)]
pub struct SendMessageResponse {
    pub user_message: Message,
    pub ai_message: Message,
}

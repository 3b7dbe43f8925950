//! Canonical message types.
//!
//! All three transcript sources (live stream, REST snapshot, local optimistic
//! sends) normalize into [`CanonMessage`] at the boundary. The reconciliation
//! engine operates only on this type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Message Role
// ============================================================================

/// Canonical message role.
///
/// Maps from various upstream terms:
/// - `user`, `human` -> `User`
/// - `assistant`, `agent`, `ai`, `bot` -> `Assistant`
/// - `tool`, `function`, `toolResult` -> `Tool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    /// Parse a role string from any upstream format.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "user" | "human" => Self::User,
            "assistant" | "agent" | "ai" | "bot" => Self::Assistant,
            "tool" | "function" | "toolresult" | "tool_result" => Self::Tool,
            _ => Self::User, // Default fallback
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// Attachment metadata carried on a message.
///
/// Content bytes are never part of message identity; only `name` and `size`
/// participate in the dedup signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: None,
        }
    }
}

// ============================================================================
// Canonical Message
// ============================================================================

/// One chat turn or tool event in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonMessage {
    /// Role of the sender.
    pub role: MessageRole,

    /// Flattened text content (content-array or legacy flat fields, trimmed).
    pub text: String,

    /// Correlation id assigned by the sender at creation time. Stable across
    /// the optimistic -> confirmed transition when the server echoes it back.
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Locally generated id, set before any server acknowledgment exists.
    #[serde(rename = "optimisticId", default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,

    /// Ordered attachment metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// Creation time, Unix epoch milliseconds. Absent on some stream echoes.
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,

    /// True once an assistant message is finalized (no further chunks).
    #[serde(default)]
    pub done: bool,
}

impl CanonMessage {
    /// Construct a user message with the given text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            client_id: None,
            optimistic_id: None,
            attachments: Vec::new(),
            timestamp_ms: None,
            done: false,
        }
    }

    /// Construct an assistant message with the given text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            client_id: None,
            optimistic_id: None,
            attachments: Vec::new(),
            timestamp_ms: None,
            done: false,
        }
    }

    /// True when this entry was created locally and has not been confirmed.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some() && self.client_id.is_none()
    }

    /// True when this entry carries a server-confirmed identity.
    pub fn is_confirmed(&self) -> bool {
        self.client_id.is_some()
    }
}

// ============================================================================
// REST payloads
// ============================================================================

/// One entry of `GET /api/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Internal/storage identifier.
    pub key: String,
    /// User-facing alias for the same session.
    #[serde(rename = "friendlyId", default, skip_serializing_if = "Option::is_none")]
    pub friendly_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Last activity, Unix epoch milliseconds.
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Raw last message, if the server includes one.
    #[serde(rename = "lastMessage", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Value>,
}

/// Response body of `GET /api/history`.
///
/// Messages stay raw here; the engine normalizes them at the boundary so a
/// single malformed entry never fails the whole snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    #[serde(rename = "sessionKey", default)]
    pub session_key: Option<String>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Attachment payload for `POST /api/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAttachment {
    pub id: String,
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "dataUrl")]
    pub data_url: String,
}

/// Request body of `POST /api/send`.
#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    #[serde(rename = "sessionKey", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(rename = "friendlyId", skip_serializing_if = "Option::is_none")]
    pub friendly_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SendAttachment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(MessageRole::parse("user"), MessageRole::User);
        assert_eq!(MessageRole::parse("Human"), MessageRole::User);
        assert_eq!(MessageRole::parse("ASSISTANT"), MessageRole::Assistant);
        assert_eq!(MessageRole::parse("tool_result"), MessageRole::Tool);
        assert_eq!(MessageRole::parse("whatever"), MessageRole::User);
    }

    #[test]
    fn test_optimistic_flags() {
        let mut msg = CanonMessage::user("hello");
        assert!(!msg.is_optimistic());
        msg.optimistic_id = Some("opt-1".to_string());
        assert!(msg.is_optimistic());
        msg.client_id = Some("1".to_string());
        assert!(!msg.is_optimistic());
        assert!(msg.is_confirmed());
    }

    #[test]
    fn test_message_round_trip_field_names() {
        let msg = CanonMessage {
            role: MessageRole::User,
            text: "hi".to_string(),
            client_id: Some("c1".to_string()),
            optimistic_id: None,
            attachments: vec![Attachment::new("a.png", 12)],
            timestamp_ms: Some(1738764000000),
            done: false,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"clientId\":\"c1\""));
        assert!(json.contains("\"timestamp\":1738764000000"));

        let back: CanonMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.client_id.as_deref(), Some("c1"));
        assert_eq!(back.attachments.len(), 1);
    }

    #[test]
    fn test_history_response_tolerates_partial_body() {
        let body = serde_json::json!({
            "sessionKey": "sess-1",
            "messages": [{"role": "user", "text": "hi"}, 42]
        });
        let parsed: HistoryResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.session_key.as_deref(), Some("sess-1"));
        assert_eq!(parsed.messages.len(), 2);
    }
}

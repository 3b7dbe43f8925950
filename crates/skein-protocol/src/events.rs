//! Live stream event types.
//!
//! The event channel is best-effort and high-frequency: field names vary by
//! channel adapter (`text` vs `content` vs `chunk`, `args` vs `input` vs
//! `parameters`), and malformed frames are expected. Parsing happens once
//! here; anything unparseable yields `None` and is dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::MessageRole;

// ============================================================================
// Connection state
// ============================================================================

/// State of the live event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

// ============================================================================
// Stream events
// ============================================================================

/// A parsed live stream event for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Token-level text delta for the in-progress assistant message.
    Chunk {
        session_key: Option<String>,
        text: String,
        /// Replace the accumulated buffer instead of appending.
        full_replace: bool,
        /// Delta belongs to the thinking buffer, not the visible text.
        thinking: bool,
    },

    /// Tool invocation marker.
    Tool {
        session_key: Option<String>,
        name: String,
        args: Option<Value>,
    },

    /// Completion marker for the current run.
    Done {
        session_key: Option<String>,
        /// `error`, `aborted`, or absent for a normal completion.
        state: Option<String>,
        error_message: Option<String>,
    },

    /// Server echo of a user message.
    UserMessage {
        session_key: Option<String>,
        payload: Value,
    },

    /// Final/standalone message frame.
    Message {
        session_key: Option<String>,
        role: Option<MessageRole>,
        payload: Value,
    },
}

impl StreamEvent {
    /// Parse a named SSE frame into a stream event.
    ///
    /// Returns `None` for unknown event names or unparseable data.
    pub fn parse(event: &str, data: &str) -> Option<Self> {
        let parsed: Value = serde_json::from_str(data).ok()?;
        let session_key = string_field(&parsed, &["sessionKey", "session_key"]);

        match event {
            "chunk" => {
                let full_replace = parsed
                    .get("fullReplace")
                    .or_else(|| parsed.get("full_replace"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                // A chunk is either visible text (optionally flagged as
                // thinking) or a bare `thinking` string delta.
                if let Some(text) = string_field(&parsed, &["text", "content", "chunk"]) {
                    let thinking = parsed
                        .get("thinking")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    Some(Self::Chunk {
                        session_key,
                        text,
                        full_replace,
                        thinking,
                    })
                } else {
                    let text = string_field(&parsed, &["thinking"])?;
                    Some(Self::Chunk {
                        session_key,
                        text,
                        full_replace,
                        thinking: true,
                    })
                }
            }
            "tool" => {
                let name = string_field(&parsed, &["name", "tool", "toolName"])?;
                let args = parsed
                    .get("args")
                    .or_else(|| parsed.get("input"))
                    .or_else(|| parsed.get("parameters"))
                    .cloned();
                Some(Self::Tool {
                    session_key,
                    name,
                    args,
                })
            }
            "done" => Some(Self::Done {
                session_key,
                state: string_field(&parsed, &["state", "status"]),
                error_message: string_field(&parsed, &["errorMessage", "error_message", "error"]),
            }),
            "user_message" => Some(Self::UserMessage {
                session_key,
                payload: parsed,
            }),
            "message" => {
                let role = string_field(&parsed, &["role"])
                    .as_deref()
                    .map(MessageRole::parse);
                Some(Self::Message {
                    session_key,
                    role,
                    payload: parsed,
                })
            }
            _ => None,
        }
    }

    /// The session key carried by the event, if any.
    pub fn session_key(&self) -> Option<&str> {
        match self {
            Self::Chunk { session_key, .. }
            | Self::Tool { session_key, .. }
            | Self::Done { session_key, .. }
            | Self::UserMessage { session_key, .. }
            | Self::Message { session_key, .. } => session_key.as_deref(),
        }
    }

    /// Session filter: an absent key matches any active session; a present
    /// key must equal the subscribed session's key.
    pub fn matches_session(&self, active_key: &str) -> bool {
        match self.session_key() {
            None => true,
            Some(key) => key == active_key,
        }
    }
}

/// First matching non-empty string field, trimmed.
fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = value.get(*name).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

// ============================================================================
// Lifecycle signals
// ============================================================================

/// Session lifecycle notification for external collaborators (toast,
/// analytics). The engine never mutates the transcript in response to these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// A compaction marker appeared in the latest transcript content.
    CompactionStart {
        session_key: String,
        role: MessageRole,
        text: String,
    },

    /// The persisted transcript shrank past the compaction threshold.
    CompactionEnd {
        session_key: String,
        prior_count: usize,
        current_count: usize,
    },

    /// The current run completed.
    RunCompleted {
        session_key: String,
        /// `error`, `aborted`, or absent for a normal completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
}

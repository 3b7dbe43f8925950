//! Payload normalization: canonical text, attachments, and message parsing.

use serde_json::Value;

use skein_protocol::{Attachment, CanonMessage, MessageRole};

/// Extract the canonical text of a payload.
///
/// Structured content-array first (`type == "text"` blocks joined); if that
/// yields nothing, legacy flat `text` / `body` / `message` string fields in
/// that order. The result is always trimmed.
pub fn extract_text(payload: &Value) -> String {
    if let Some(content) = payload.get("content") {
        match content {
            Value::Array(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    let is_text = block
                        .get("type")
                        .and_then(Value::as_str)
                        .is_none_or(|t| t == "text");
                    if !is_text {
                        continue;
                    }
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                let out = out.trim().to_string();
                if !out.is_empty() {
                    return out;
                }
            }
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    return s.to_string();
                }
            }
            _ => {}
        }
    }

    for field in ["text", "body", "message"] {
        if let Some(s) = payload.get(field).and_then(Value::as_str) {
            let s = s.trim();
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }

    String::new()
}

/// Parse attachment metadata off a payload.
pub fn extract_attachments(payload: &Value) -> Vec<Attachment> {
    let Some(list) = payload.get("attachments").and_then(Value::as_array) else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let size = entry
                .get("size")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            let content_type = entry
                .get("contentType")
                .or_else(|| entry.get("content_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(Attachment {
                name: name.to_string(),
                size,
                content_type,
            })
        })
        .collect()
}

/// Content-based identity for attachment-only messages.
///
/// Attachments sorted by name, joined as `name:size` pairs with `|`. An empty
/// list yields the empty string, which never participates in matching.
pub fn attachment_signature(attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(&str, u64)> = attachments
        .iter()
        .map(|a| (a.name.as_str(), a.size))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(name, size)| format!("{name}:{size}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Parse a wire payload into a canonical message.
///
/// Handles both the structured and the legacy flat shape, and both id field
/// spellings. Returns `None` for payloads with no usable content; the stream
/// is best-effort, so those are dropped without surfacing an error.
pub fn from_wire(payload: &Value) -> Option<CanonMessage> {
    let payload = match payload.get("message") {
        // Some frames nest the message under a `message` object.
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };
    if !payload.is_object() {
        return None;
    }

    let role = payload
        .get("role")
        .and_then(Value::as_str)
        .map(MessageRole::parse)
        .unwrap_or_default();

    let text = extract_text(payload);
    let attachments = extract_attachments(payload);
    if text.is_empty() && attachments.is_empty() {
        return None;
    }

    let client_id = string_field(payload, &["clientId", "client_id"]);
    let optimistic_id = string_field(payload, &["optimisticId", "optimistic_id"]);
    let timestamp_ms = payload
        .get("timestamp")
        .or_else(|| payload.get("createdAt"))
        .or_else(|| payload.get("created_at"))
        .and_then(Value::as_i64);
    let done = payload.get("done").and_then(Value::as_bool).unwrap_or(false);

    Some(CanonMessage {
        role,
        text,
        client_id,
        optimistic_id,
        attachments,
        timestamp_ms,
        done,
    })
}

fn string_field(payload: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = payload.get(*name).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

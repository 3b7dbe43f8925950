//! Message identity resolution.
//!
//! Server echoes are not guaranteed to carry the originating client id, so
//! every message resolves to a layered key: a primary correlation id when one
//! exists, and a content-derived fallback otherwise.

use skein_protocol::CanonMessage;

use super::normalize::attachment_signature;

/// Comparison key for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    /// Correlation id: the client-assigned id, or the optimistic key assigned
    /// before server confirmation.
    pub primary: Option<String>,
    /// Content-based identity: normalized text, else attachment signature.
    /// `None` means the message is never deduped against, only appended.
    pub fallback: Option<String>,
}

/// Resolve the comparison key for a message.
pub fn resolve_key(msg: &CanonMessage) -> MessageKey {
    let primary = msg
        .client_id
        .clone()
        .or_else(|| msg.optimistic_id.as_deref().map(optimistic_key));

    let fallback = if !msg.text.is_empty() {
        Some(msg.text.clone())
    } else {
        let sig = attachment_signature(&msg.attachments);
        (!sig.is_empty()).then_some(sig)
    };

    MessageKey { primary, fallback }
}

/// Two primary keys match when they are equal, or when one is the `opt-`
/// prefixed optimistic form of the other. This is what lets a confirmed echo
/// carrying `clientId = "1"` supersede the optimistic entry keyed `opt-1`.
pub fn keys_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    a.strip_prefix("opt-").is_some_and(|rest| rest == b)
        || b.strip_prefix("opt-").is_some_and(|rest| rest == a)
}

/// The `opt-<id>` convention for ids assigned before server confirmation.
fn optimistic_key(id: &str) -> String {
    if id.starts_with("opt-") {
        id.to_string()
    } else {
        format!("opt-{id}")
    }
}

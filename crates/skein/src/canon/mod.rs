//! Boundary normalization of heterogeneous payloads.
//!
//! Wire messages arrive in two shapes: a structured content-part array, or
//! legacy flat `text`/`body`/`message` fields; id fields show up in camelCase
//! or snake_case depending on the channel adapter. Everything is parsed here,
//! once, into [`skein_protocol::CanonMessage`]. Downstream logic never sees
//! raw JSON.

mod identity;
mod normalize;

pub use identity::{MessageKey, keys_match, resolve_key};
pub use normalize::{attachment_signature, extract_attachments, extract_text, from_wire};

//! Canonical protocol types for Skein transcript reconciliation.
//!
//! This crate defines the single internal message format and the live stream
//! event vocabulary shared by the engine and its consumers:
//!
//! ```text
//! Dashboard UI <--[merged transcript + lifecycle signals]-- Engine
//!                                                             ^
//!                    SSE stream / REST snapshot / local sends |
//! ```
//!
//! ## Design Principles
//!
//! 1. **One canonical shape.** Wire payloads arrive as content-part arrays or
//!    legacy flat fields; both are parsed once at the boundary into
//!    [`CanonMessage`]. Downstream logic never touches raw JSON.
//! 2. **Events are ephemeral.** Stream events drive the in-progress buffer but
//!    are never stored; only messages persist.
//! 3. **Identity travels with the message.** Client correlation ids and
//!    optimistic ids are first-class fields, not metadata.

pub mod events;
pub mod messages;

pub use events::{ConnectionState, LifecycleSignal, StreamEvent};
pub use messages::{
    Attachment, CanonMessage, HistoryResponse, MessageRole, SendAttachment, SendRequest,
    SessionSummary,
};

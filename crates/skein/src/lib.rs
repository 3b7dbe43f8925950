//! Skein - transcript reconciliation engine.
//!
//! Keeps a chat/agent-output transcript consistent while messages arrive from
//! three imperfectly-correlated sources: a live SSE stream (token chunks, tool
//! calls, completion markers), a periodic REST snapshot of persisted history,
//! and locally-created optimistic messages inserted on user send.

pub mod api;
pub mod canon;
pub mod dedup;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod stream;

pub use error::EngineError;
pub use settings::EngineConfig;
pub use store::{SessionStore, StoreEvent};

//! Engine errors.

use thiserror::Error;

/// Engine errors.
///
/// Transport blips and snapshot failures are recoverable: callers keep the
/// last known good transcript and surface a disconnected indicator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Live stream dropped or errored. Reconnection is an explicit caller
    /// action; buffered state is preserved.
    #[error("stream disconnected: {0}")]
    StreamDisconnected(String),

    /// Snapshot fetch failed. Cached data is kept.
    #[error("snapshot fetch failed: {0}")]
    SnapshotFetch(String),

    /// Connectivity probe exceeded its deadline. Distinct from a generic
    /// network failure to aid operator diagnosis.
    #[error("check timed out")]
    ProbeTimeout,

    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server rejected a request.
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Unknown session key.
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

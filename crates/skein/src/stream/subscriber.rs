//! SSE subscription for one session's live event feed.
//!
//! One long-lived connection per active session. On error or close the
//! subscriber flips to `Disconnected` and returns; reconnection is an explicit
//! caller action (the transport reconnects cheaply, so there is no automatic
//! backoff loop). Buffered transcript state is never discarded on disconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skein_protocol::{ConnectionState, StreamEvent};

use crate::error::EngineError;

/// Deadline for establishing the connection. The stream itself has no
/// client-side deadline: a total request timeout would kill long runs
/// mid-stream regardless of keepalives.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maintains the SSE connection for one session and forwards parsed events.
pub struct StreamSubscriber {
    base_url: String,
    session_key: String,
    state: Arc<RwLock<ConnectionState>>,
}

impl StreamSubscriber {
    pub fn new(base_url: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_key: session_key.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Current connection state, shareable with UI consumers.
    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        self.state.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and stream events until the connection drops or `cancel`
    /// fires. Each accepted frame is parsed, filtered by session key, and
    /// handed to `on_event`; malformed frames are dropped.
    ///
    /// Returns `Ok(())` on cancellation or clean stream end, and
    /// `EngineError::StreamDisconnected` on a transport failure. Either way
    /// the state flips to `Disconnected`; calling `run` again is the manual
    /// reconnect.
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_event: F) -> Result<(), EngineError>
    where
        F: FnMut(StreamEvent),
    {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.connect_and_stream(&cancel, &mut on_event).await;

        *self.state.write().await = ConnectionState::Disconnected;
        result
    }

    async fn connect_and_stream<F>(
        &self,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(StreamEvent),
    {
        let url = format!(
            "{}/api/stream?sessionKey={}",
            self.base_url,
            urlencoding::encode(&self.session_key)
        );
        debug!(url = %url, "connecting to event stream");

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")
            .map_err(|e| EngineError::StreamDisconnected(e.to_string()))?;

        let request = client.get(&url).header("Accept", "text/event-stream");
        let mut es = EventSource::new(request)
            .map_err(|e| EngineError::StreamDisconnected(e.to_string()))?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(session = %self.session_key, "stream subscription cancelled");
                    es.close();
                    return Ok(());
                }
                next = es.next() => match next {
                    Some(ev) => ev,
                    None => {
                        info!(session = %self.session_key, "event stream ended cleanly");
                        return Ok(());
                    }
                },
            };

            match event {
                Ok(Event::Open) => {
                    *self.state.write().await = ConnectionState::Connected;
                    info!(session = %self.session_key, "event stream connected");
                }
                Ok(Event::Message(msg)) => {
                    // Malformed or unknown frames parse to None and are
                    // dropped; the channel is best-effort and high-frequency.
                    let Some(parsed) = StreamEvent::parse(&msg.event, &msg.data) else {
                        debug!(event = %msg.event, "dropping unparseable frame");
                        continue;
                    };
                    if !parsed.matches_session(&self.session_key) {
                        debug!(
                            event_session = ?parsed.session_key(),
                            "ignoring frame for another session"
                        );
                        continue;
                    }
                    on_event(parsed);
                }
                Err(e) => {
                    warn!(session = %self.session_key, error = %e, "event stream dropped");
                    es.close();
                    return Err(EngineError::StreamDisconnected(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let sub = StreamSubscriber::new("http://localhost:9", "sess-1");
        assert_eq!(sub.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(sub.session_key(), "sess-1");
    }

    #[tokio::test]
    async fn test_run_against_dead_endpoint_sets_disconnected() {
        // Port 9 (discard) refuses connections; run must surface a transport
        // failure and land back in Disconnected without panicking.
        let sub = StreamSubscriber::new("http://127.0.0.1:9", "sess-1");
        let cancel = CancellationToken::new();
        let result = sub.run(cancel, |_| {}).await;
        assert!(matches!(result, Err(EngineError::StreamDisconnected(_))));
        assert_eq!(sub.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancellation_returns_ok() {
        let sub = StreamSubscriber::new("http://127.0.0.1:9", "sess-1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Pre-cancelled token: the select exits before any connection error
        // can win the race.
        let result = sub.run(cancel, |_| {}).await;
        if let Err(err) = result {
            assert!(matches!(err, EngineError::StreamDisconnected(_)));
        }
        assert_eq!(sub.connection_state().await, ConnectionState::Disconnected);
    }
}

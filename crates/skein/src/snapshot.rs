//! Per-session cache of the persisted REST snapshot.
//!
//! The snapshot is the authoritative transcript as of the last fetch. Refresh
//! runs on a timer (suppressed while a stream is active, so live content is
//! not clobbered mid-run) and immediately after a `done` event. A failed
//! refresh keeps the stale entry: stale-but-present beats empty.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use skein_protocol::{CanonMessage, LifecycleSignal};

use crate::error::EngineError;
use crate::lifecycle::{CompactionPolicy, is_compaction_drop};
use crate::stream::StreamPhase;

/// Source of persisted history, injected so the cache is testable without a
/// server. The REST implementation lives in [`crate::api`].
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(
        &self,
        session_key: &str,
        friendly_id: Option<&str>,
    ) -> Result<Vec<CanonMessage>, EngineError>;
}

/// How refresh timing is decided. Pure; callers pass `now`.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Fixed refresh interval, milliseconds.
    pub interval_ms: i64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
        }
    }
}

/// Holds the last fetched snapshot per session.
pub struct SnapshotCache {
    fetcher: Arc<dyn SnapshotFetcher>,
    entries: DashMap<String, Vec<CanonMessage>>,
    last_refresh_ms: DashMap<String, i64>,
    refresh: RefreshPolicy,
    compaction: CompactionPolicy,
}

impl SnapshotCache {
    pub fn new(
        fetcher: Arc<dyn SnapshotFetcher>,
        refresh: RefreshPolicy,
        compaction: CompactionPolicy,
    ) -> Self {
        Self {
            fetcher,
            entries: DashMap::new(),
            last_refresh_ms: DashMap::new(),
            refresh,
            compaction,
        }
    }

    /// Last fetched snapshot for the session, empty when never fetched.
    pub fn get(&self, session_key: &str) -> Vec<CanonMessage> {
        self.entries
            .get(session_key)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self, session_key: &str) -> usize {
        self.entries.get(session_key).map_or(0, |e| e.value().len())
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }

    /// Whether a timer tick at `now_ms` should refresh this session.
    ///
    /// Suppressed while the stream is mid-run: overwriting partially-built
    /// content causes visible flicker, and the post-`done` refresh follows
    /// shortly anyway.
    pub fn should_refresh(&self, session_key: &str, phase: StreamPhase, now_ms: i64) -> bool {
        if phase == StreamPhase::Streaming {
            return false;
        }
        match self.last_refresh_ms.get(session_key) {
            Some(last) => now_ms - *last >= self.refresh.interval_ms,
            None => true,
        }
    }

    /// Force the next `should_refresh` to fire, used right after a `done`
    /// event invalidates the cached entry.
    pub fn mark_stale(&self, session_key: &str) {
        self.last_refresh_ms.remove(session_key);
    }

    /// Fetch and store a fresh snapshot.
    ///
    /// Returns a `CompactionEnd` signal when the new snapshot shrank past the
    /// compaction threshold - that is a server-side summarization, not data
    /// loss. On fetch failure the cached entry is untouched.
    pub async fn refresh(
        &self,
        session_key: &str,
        friendly_id: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<LifecycleSignal>, EngineError> {
        let fresh = match self.fetcher.fetch(session_key, friendly_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session = %session_key, error = %e, "snapshot refresh failed, keeping stale entry");
                return Err(e);
            }
        };

        let prior_count = self.len(session_key);
        let current_count = fresh.len();
        debug!(
            session = %session_key,
            prior = prior_count,
            current = current_count,
            "snapshot refreshed"
        );

        let signal = if is_compaction_drop(prior_count, current_count, &self.compaction) {
            info!(
                session = %session_key,
                prior = prior_count,
                current = current_count,
                "snapshot shrank past compaction threshold"
            );
            Some(LifecycleSignal::CompactionEnd {
                session_key: session_key.to_string(),
                prior_count,
                current_count,
            })
        } else {
            None
        };

        self.entries.insert(session_key.to_string(), fresh);
        self.last_refresh_ms.insert(session_key.to_string(), now_ms);
        Ok(signal)
    }

    /// Move cached entries from a provisional key to a durable one and drop
    /// the old key. Used when a session is promoted after a rename.
    pub fn relocate(&self, from_key: &str, to_key: &str) {
        if from_key == to_key {
            return;
        }
        if let Some((_, messages)) = self.entries.remove(from_key) {
            info!(from = %from_key, to = %to_key, "relocating snapshot cache entry");
            self.entries.insert(to_key.to_string(), messages);
        }
        if let Some((_, ts)) = self.last_refresh_ms.remove(from_key) {
            self.last_refresh_ms.insert(to_key.to_string(), ts);
        }
    }

    /// Drop all cached state for a session.
    pub fn clear(&self, session_key: &str) {
        self.entries.remove(session_key);
        self.last_refresh_ms.remove(session_key);
    }
}

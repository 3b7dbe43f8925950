//! Owned per-session engine state with change notification.
//!
//! The store is the single writer of the externally visible transcript. Every
//! other component writes only its own substate: the assembler owns the
//! streaming buffer, the snapshot cache owns fetched history, the optimistic
//! send path appends to the realtime queue through the reconciler. Consumers
//! observe changes over a broadcast feed instead of sharing mutable state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skein_protocol::{
    Attachment, CanonMessage, ConnectionState, LifecycleSignal, MessageRole, StreamEvent,
};

use crate::canon;
use crate::dedup::{DedupPolicy, reconcile};
use crate::lifecycle::LifecycleDetector;
use crate::merge::{MergePolicy, merge, snapshot_absorbed};
use crate::settings::EngineConfig;
use crate::snapshot::{SnapshotCache, SnapshotFetcher};
use crate::stream::{AssemblerOutput, StreamAssembler, StreamPhase};

/// Change notification delivered to consumers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The merged transcript for a session changed.
    TranscriptChanged { session_key: String },
    /// A lifecycle signal for external collaborators.
    Lifecycle(LifecycleSignal),
    /// The live stream connection changed state.
    Connection {
        session_key: String,
        state: ConnectionState,
    },
}

/// Per-session substate. One entry per session key.
struct SessionState {
    assembler: StreamAssembler,
    realtime: Vec<CanonMessage>,
    detector: LifecycleDetector,
}

/// Engine state for all sessions.
pub struct SessionStore {
    dedup: DedupPolicy,
    merge_policy: MergePolicy,
    grace_window: Duration,
    snapshots: SnapshotCache,
    sessions: DashMap<String, SessionState>,
    active: RwLock<Option<String>>,
    /// Pending deferred buffer clears, keyed by session.
    grace_cancels: DashMap<String, CancellationToken>,
    events: broadcast::Sender<StoreEvent>,
    tool_args_truncate: usize,
}

impl SessionStore {
    pub fn new(config: &EngineConfig, fetcher: Arc<dyn SnapshotFetcher>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            dedup: config.dedup_policy(),
            merge_policy: config.merge_policy(),
            grace_window: Duration::from_secs(config.grace_window_secs),
            snapshots: SnapshotCache::new(
                fetcher,
                config.refresh_policy(),
                config.compaction_policy(),
            ),
            sessions: DashMap::new(),
            active: RwLock::new(None),
            grace_cancels: DashMap::new(),
            events,
            tool_args_truncate: config.tool_args_truncate,
        })
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a locally-created message immediately on user send, before any
    /// server confirmation exists.
    pub fn push_optimistic(
        &self,
        session_key: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> CanonMessage {
        let now_ms = Utc::now().timestamp_millis();
        let msg = CanonMessage {
            role: MessageRole::User,
            text: text.trim().to_string(),
            client_id: None,
            optimistic_id: Some(format!("opt-{}", Uuid::new_v4().simple())),
            attachments,
            timestamp_ms: Some(now_ms),
            done: false,
        };

        {
            let mut state = self.session_mut(session_key);
            reconcile(msg.clone(), &mut state.realtime, now_ms, &self.dedup);
        }
        self.notify_changed(session_key);
        msg
    }

    /// Route one live stream event into the session's substate.
    pub fn apply_stream_event(&self, session_key: &str, event: &StreamEvent) {
        let now_ms = Utc::now().timestamp_millis();
        let mut finished_state: Option<Option<String>> = None;

        {
            let mut state = self.session_mut(session_key);
            match event {
                StreamEvent::Chunk { .. } | StreamEvent::Tool { .. } | StreamEvent::Done { .. } => {
                    match state.assembler.apply(event) {
                        Some(AssemblerOutput::ToolCall(msg)) => {
                            state.realtime.push(msg);
                        }
                        Some(AssemblerOutput::Finalized { message, state: run_state }) => {
                            if let Some(msg) = message {
                                reconcile(msg, &mut state.realtime, now_ms, &self.dedup);
                            }
                            finished_state = Some(run_state);
                        }
                        None => {}
                    }
                }
                StreamEvent::UserMessage { payload, .. }
                | StreamEvent::Message { payload, .. } => {
                    // Echoes go through the reconciler; it is the only place
                    // the race with the optimistic-append path is resolved.
                    if let Some(msg) = canon::from_wire(payload) {
                        reconcile(msg, &mut state.realtime, now_ms, &self.dedup);
                    } else {
                        debug!(session = %session_key, "dropping echo with no usable content");
                    }
                }
            }
        }

        if let Some(run_state) = finished_state {
            // The persisted transcript now includes this run; re-validate it.
            self.snapshots.mark_stale(session_key);
            self.emit(StoreEvent::Lifecycle(LifecycleSignal::RunCompleted {
                session_key: session_key.to_string(),
                state: run_state,
            }));
        }
        self.notify_changed(session_key);
    }

    /// Move all engine state from a provisional session key to a durable one.
    pub async fn relocate(&self, from_key: &str, to_key: &str) {
        if from_key == to_key {
            return;
        }
        info!(from = %from_key, to = %to_key, "relocating session state");
        self.snapshots.relocate(from_key, to_key);
        if let Some((_, state)) = self.sessions.remove(from_key) {
            self.sessions.insert(to_key.to_string(), state);
        }
        if let Some((_, token)) = self.grace_cancels.remove(from_key) {
            self.grace_cancels.insert(to_key.to_string(), token);
        }

        let mut active = self.active.write().await;
        if active.as_deref() == Some(from_key) {
            *active = Some(to_key.to_string());
        }
        drop(active);
        self.notify_changed(to_key);
    }

    /// Drop all state for a session.
    pub fn clear_session(&self, session_key: &str) {
        self.sessions.remove(session_key);
        self.snapshots.clear(session_key);
        if let Some((_, token)) = self.grace_cancels.remove(session_key) {
            token.cancel();
        }
        self.notify_changed(session_key);
    }

    // ------------------------------------------------------------------
    // Session switching
    // ------------------------------------------------------------------

    pub async fn active_session(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Switch the active session.
    ///
    /// The old session's realtime buffer is not cleared immediately: a fast
    /// back-and-forth switch must not lose in-flight state. The clear runs
    /// after the grace window unless the session is re-activated first.
    pub async fn switch_session(self: &Arc<Self>, next: Option<String>) {
        let previous = {
            let mut active = self.active.write().await;
            std::mem::replace(&mut *active, next.clone())
        };

        if previous == next {
            return;
        }

        if let Some(ref key) = next {
            // Returning within the grace window keeps the buffer.
            if let Some((_, token)) = self.grace_cancels.remove(key) {
                token.cancel();
            }
        }

        if let Some(old_key) = previous {
            let token = CancellationToken::new();
            if let Some(stale) = self.grace_cancels.insert(old_key.clone(), token.clone()) {
                stale.cancel();
            }

            let store = Arc::clone(self);
            let grace = self.grace_window;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(grace) => {
                        debug!(session = %old_key, "grace window elapsed, clearing realtime buffer");
                        if let Some(mut state) = store.sessions.get_mut(&old_key) {
                            state.realtime.clear();
                            state.assembler.clear();
                        }
                        store.grace_cancels.remove(&old_key);
                        store.notify_changed(&old_key);
                    }
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The merged, ordered, duplicate-free transcript for a session.
    ///
    /// Also clears the realtime buffer once the snapshot has absorbed it, and
    /// scans the merged tail for lifecycle markers.
    pub fn merged(&self, session_key: &str) -> Vec<CanonMessage> {
        let snapshot = self.snapshots.get(session_key);
        let mut signal = None;

        let merged = {
            let mut state = self.session_mut(session_key);
            let open = state.assembler.open_message();
            let merged = merge(
                &snapshot,
                &state.realtime,
                open.as_ref(),
                Utc::now().timestamp_millis(),
                &self.dedup,
                &self.merge_policy,
            );

            if !state.realtime.is_empty()
                && snapshot_absorbed(merged.len(), snapshot.len(), open.is_some())
            {
                debug!(session = %session_key, "snapshot caught up, clearing realtime buffer");
                state.realtime.clear();
            }

            if let Some(latest) = merged.last() {
                signal = state.detector.scan(session_key, latest);
            }
            merged
        };

        if let Some(signal) = signal {
            self.emit(StoreEvent::Lifecycle(signal));
        }
        merged
    }

    pub fn stream_phase(&self, session_key: &str) -> StreamPhase {
        self.sessions
            .get(session_key)
            .map_or(StreamPhase::Idle, |s| s.assembler.phase())
    }

    /// Monotonic event counter for cheap change detection.
    pub fn last_event_at(&self, session_key: &str) -> u64 {
        self.sessions
            .get(session_key)
            .map_or(0, |s| s.assembler.state().last_event_at)
    }

    /// Surface a connection state change to consumers.
    pub fn note_connection(&self, session_key: &str, state: ConnectionState) {
        self.emit(StoreEvent::Connection {
            session_key: session_key.to_string(),
            state,
        });
    }

    /// React to a dropped live stream. The in-progress run cannot continue,
    /// so it is ended and the snapshot re-validated; otherwise refresh would
    /// stay suppressed behind a dead `Streaming` phase until a manual
    /// reconnect completed the run.
    pub fn note_stream_interrupted(&self, session_key: &str) {
        {
            let mut state = self.session_mut(session_key);
            state.assembler.interrupt();
        }
        self.snapshots.mark_stale(session_key);
        self.note_connection(session_key, ConnectionState::Disconnected);
        self.notify_changed(session_key);
    }

    // ------------------------------------------------------------------
    // Refresh driver
    // ------------------------------------------------------------------

    /// Periodic snapshot refresh for the active session.
    ///
    /// Ticks once a second and applies the refresh policy: due by interval,
    /// suppressed mid-stream, forced after `done`. Runs until cancelled.
    pub async fn run_refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let Some(session_key) = self.active_session().await else {
                continue;
            };
            let phase = self.stream_phase(&session_key);
            let now_ms = Utc::now().timestamp_millis();
            if !self.snapshots.should_refresh(&session_key, phase, now_ms) {
                continue;
            }

            match self.snapshots.refresh(&session_key, None, now_ms).await {
                Ok(signal) => {
                    if let Some(signal) = signal {
                        self.emit(StoreEvent::Lifecycle(signal));
                    }
                    self.notify_changed(&session_key);
                }
                Err(e) => {
                    // Stale data stays; the caller sees last known good.
                    warn!(session = %session_key, error = %e, "periodic refresh failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session_mut(
        &self,
        session_key: &str,
    ) -> dashmap::mapref::one::RefMut<'_, String, SessionState> {
        self.sessions
            .entry(session_key.to_string())
            .or_insert_with(|| SessionState {
                assembler: StreamAssembler::new(self.tool_args_truncate),
                realtime: Vec::new(),
                detector: LifecycleDetector::new(),
            })
    }

    fn notify_changed(&self, session_key: &str) {
        self.emit(StoreEvent::TranscriptChanged {
            session_key: session_key.to_string(),
        });
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine; the feed is best-effort.
        let _ = self.events.send(event);
    }
}

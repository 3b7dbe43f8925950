//! End-to-end reconciliation scenarios across stream, snapshot, and
//! optimistic sources, exercised under the interleavings the live system
//! produces.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use skein::snapshot::SnapshotFetcher;
use skein::store::{SessionStore, StoreEvent};
use skein::{EngineConfig, EngineError};
use skein_protocol::{CanonMessage, LifecycleSignal, MessageRole, StreamEvent};

/// Fetcher whose "server state" the test mutates between refreshes.
struct StubServer {
    messages: Mutex<Vec<CanonMessage>>,
}

impl StubServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    fn set_history(&self, messages: Vec<CanonMessage>) {
        *self.messages.lock().unwrap() = messages;
    }
}

#[async_trait]
impl SnapshotFetcher for StubServer {
    async fn fetch(
        &self,
        _session_key: &str,
        _friendly_id: Option<&str>,
    ) -> Result<Vec<CanonMessage>, EngineError> {
        Ok(self.messages.lock().unwrap().clone())
    }
}

fn setup() -> (Arc<StubServer>, Arc<SessionStore>) {
    let server = StubServer::new();
    let store = SessionStore::new(&EngineConfig::default(), server.clone());
    (server, store)
}

fn user_with_ts(text: &str, ts: i64) -> CanonMessage {
    let mut msg = CanonMessage::user(text);
    msg.timestamp_ms = Some(ts);
    msg
}

fn chunk(text: &str) -> StreamEvent {
    StreamEvent::Chunk {
        session_key: None,
        text: text.to_string(),
        full_replace: false,
        thinking: false,
    }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        session_key: None,
        state: None,
        error_message: None,
    }
}

#[tokio::test]
async fn echo_arrives_before_snapshot_refresh() {
    let (server, store) = setup();

    let sent = store.push_optimistic("s1", "hello", Vec::new());

    // Echo lands first, without a client id.
    store.apply_stream_event(
        "s1",
        &StreamEvent::UserMessage {
            session_key: Some("s1".to_string()),
            payload: json!({"role": "user", "text": "hello", "timestamp": sent.timestamp_ms}),
        },
    );
    assert_eq!(store.merged("s1").len(), 1);

    // Snapshot catches up later.
    server.set_history(vec![user_with_ts("hello", sent.timestamp_ms.unwrap())]);
    store.snapshots().refresh("s1", None, 1_000).await.unwrap();

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].text, "hello");

    // The realtime buffer was absorbed; a later merge stays stable.
    assert_eq!(store.merged("s1").len(), 1);
}

#[tokio::test]
async fn echo_arrives_after_snapshot_refresh() {
    let (server, store) = setup();

    let sent = store.push_optimistic("s1", "hello", Vec::new());
    server.set_history(vec![user_with_ts("hello", sent.timestamp_ms.unwrap())]);
    store.snapshots().refresh("s1", None, 1_000).await.unwrap();
    assert_eq!(store.merged("s1").len(), 1);

    // The echo trails the refresh; it must reconcile against the snapshot.
    store.apply_stream_event(
        "s1",
        &StreamEvent::UserMessage {
            session_key: Some("s1".to_string()),
            payload: json!({"role": "user", "text": "hello", "timestamp": sent.timestamp_ms}),
        },
    );
    assert_eq!(store.merged("s1").len(), 1);
}

#[tokio::test]
async fn echo_never_arrives() {
    let (server, store) = setup();

    let sent = store.push_optimistic("s1", "hello", Vec::new());
    server.set_history(vec![user_with_ts("hello", sent.timestamp_ms.unwrap())]);
    store.snapshots().refresh("s1", None, 1_000).await.unwrap();

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 1);
    // The surviving copy is the persisted one, not the optimistic entry.
    assert!(!merged[0].is_optimistic());
}

#[tokio::test]
async fn confirmed_echo_supersedes_optimistic_in_place() {
    let (_, store) = setup();

    store.push_optimistic("s1", "first", Vec::new());
    let sent = store.push_optimistic("s1", "hello", Vec::new());
    let correlation = sent
        .optimistic_id
        .as_deref()
        .and_then(|id| id.strip_prefix("opt-"))
        .unwrap()
        .to_string();

    store.apply_stream_event(
        "s1",
        &StreamEvent::UserMessage {
            session_key: Some("s1".to_string()),
            payload: json!({"role": "user", "text": "hello", "clientId": correlation}),
        },
    );

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[1].text, "hello");
    assert!(merged[1].is_confirmed());
}

#[tokio::test]
async fn no_two_messages_share_primary_identity() {
    let (server, store) = setup();

    for _ in 0..2 {
        store.apply_stream_event(
            "s1",
            &StreamEvent::Message {
                session_key: None,
                role: None,
                payload: json!({"role": "user", "text": "tracked", "clientId": "c-7"}),
            },
        );
    }
    let mut snapshot_copy = CanonMessage::user("tracked");
    snapshot_copy.client_id = Some("c-7".to_string());
    server.set_history(vec![snapshot_copy]);
    store.snapshots().refresh("s1", None, 0).await.unwrap();

    let merged = store.merged("s1");
    let with_id: Vec<_> = merged.iter().filter_map(|m| m.client_id.as_deref()).collect();
    assert_eq!(with_id, vec!["c-7"]);
}

#[tokio::test]
async fn streaming_run_absorbed_into_snapshot() {
    let (server, store) = setup();

    store.apply_stream_event("s1", &chunk("The answer"));
    store.apply_stream_event("s1", &chunk(" is 42"));

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].done);

    store.apply_stream_event("s1", &done());
    let merged = store.merged("s1");
    assert_eq!(merged.len(), 1);
    assert!(merged[0].done);

    // The post-done refresh persists the full exchange.
    server.set_history(vec![
        CanonMessage::user("question"),
        CanonMessage::assistant("The answer is 42"),
    ]);
    store.snapshots().refresh("s1", None, 0).await.unwrap();

    let merged = store.merged("s1");
    let texts: Vec<&str> = merged.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["question", "The answer is 42"]);
}

#[tokio::test]
async fn tool_calls_interleave_with_text() {
    let (_, store) = setup();

    store.apply_stream_event("s1", &chunk("Let me look."));
    store.apply_stream_event(
        "s1",
        &StreamEvent::Tool {
            session_key: None,
            name: "grep".to_string(),
            args: Some(json!({"pattern": "fn main"})),
        },
    );

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].role, MessageRole::Tool);
    assert!(merged[0].text.starts_with("grep("));
    // Open assistant text stays at the tail.
    assert_eq!(merged[1].text, "Let me look.");
}

#[tokio::test]
async fn repeated_identical_tool_calls_both_appear() {
    let (_, store) = setup();

    let tool = StreamEvent::Tool {
        session_key: None,
        name: "grep".to_string(),
        args: Some(json!({"pattern": "fn main"})),
    };
    store.apply_stream_event("s1", &tool);
    store.apply_stream_event("s1", &tool);

    let merged = store.merged("s1");
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].text, merged[1].text);
    assert!(merged.iter().all(|m| m.role == MessageRole::Tool));
}

#[tokio::test]
async fn compaction_end_signal_on_snapshot_shrink() {
    let (server, store) = setup();

    server.set_history((0..42).map(|i| CanonMessage::user(format!("m{i}"))).collect());
    store.snapshots().refresh("s1", None, 0).await.unwrap();

    server.set_history((0..20).map(|i| CanonMessage::user(format!("m{i}"))).collect());
    let signal = store.snapshots().refresh("s1", None, 1).await.unwrap();
    assert!(matches!(
        signal,
        Some(LifecycleSignal::CompactionEnd {
            prior_count: 42,
            current_count: 20,
            ..
        })
    ));

    // Subsequent unrelated refresh does not re-fire.
    let signal = store.snapshots().refresh("s1", None, 2).await.unwrap();
    assert!(signal.is_none());
}

#[tokio::test]
async fn mismatched_session_keys_are_ignored_by_the_subscriber_filter() {
    // The store trusts its caller for routing; the filter lives on the
    // parsed event itself.
    let tagged = StreamEvent::parse("chunk", &json!({"text": "x", "sessionKey": "other"}).to_string())
        .unwrap();
    assert!(!tagged.matches_session("s1"));

    let untagged = StreamEvent::parse("chunk", &json!({"text": "x"}).to_string()).unwrap();
    assert!(untagged.matches_session("s1"));
}

#[tokio::test]
async fn transcript_change_notifications_are_emitted() {
    let (_, store) = setup();
    let mut feed = store.subscribe();

    store.push_optimistic("s1", "hi", Vec::new());
    store.apply_stream_event("s1", &chunk("yo"));

    let mut changed = 0;
    while let Ok(event) = feed.try_recv() {
        if matches!(event, StoreEvent::TranscriptChanged { ref session_key } if session_key == "s1")
        {
            changed += 1;
        }
    }
    assert!(changed >= 2);
}

//! Top-level transcript merge.
//!
//! Combines the snapshot, the queued realtime messages, and the in-progress
//! streaming message into the single ordered view consumers see. Snapshot and
//! realtime entries interleave by arrival order; dedup removes one side where
//! they overlap. This is the only place the externally visible transcript is
//! produced.

use skein_protocol::{CanonMessage, MessageRole};

use crate::dedup::{DedupPolicy, reconcile};

/// Bounds on the merged view.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    /// Maximum merged length; oldest entries are evicted past this.
    pub buffer_cap: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { buffer_cap: 500 }
    }
}

/// Merge one session's inputs into the ordered transcript.
///
/// The snapshot comes first (it is the authoritative prefix), realtime
/// messages are reconciled one by one in arrival order, and the open
/// streaming message - the at-most-one non-done assistant entry - sits at the
/// tail.
pub fn merge(
    snapshot: &[CanonMessage],
    realtime: &[CanonMessage],
    open_message: Option<&CanonMessage>,
    now_ms: i64,
    dedup: &DedupPolicy,
    policy: &MergePolicy,
) -> Vec<CanonMessage> {
    let mut merged = snapshot.to_vec();
    let snapshot_len = snapshot.len();

    for msg in realtime {
        // Assistant and tool entries carry no client identity; once the
        // snapshot holds an identical entry near its tail, the realtime copy
        // has been absorbed. Only the snapshot prefix is scanned: realtime
        // entries must never dedupe against each other (two identical tool
        // calls in one run are two real events).
        if msg.role != MessageRole::User
            && tail_duplicate(&merged[..snapshot_len], msg, dedup.tail_window)
        {
            continue;
        }
        reconcile(msg.clone(), &mut merged, now_ms, dedup);
    }

    if let Some(open) = open_message {
        merged.push(open.clone());
    }

    if merged.len() > policy.buffer_cap {
        let excess = merged.len() - policy.buffer_cap;
        merged.drain(..excess);
    }

    merged
}

fn tail_duplicate(snapshot_prefix: &[CanonMessage], msg: &CanonMessage, tail: usize) -> bool {
    if msg.text.is_empty() {
        return false;
    }
    snapshot_prefix
        .iter()
        .rev()
        .take(tail)
        .any(|m| m.role == msg.role && m.text == msg.text)
}

/// True once the snapshot has caught up with everything the realtime buffer
/// holds. The caller clears the buffer at that point, bounding its growth.
pub fn snapshot_absorbed(merged_len: usize, snapshot_len: usize, has_open_message: bool) -> bool {
    let settled = if has_open_message {
        merged_len.saturating_sub(1)
    } else {
        merged_len
    };
    settled == snapshot_len
}

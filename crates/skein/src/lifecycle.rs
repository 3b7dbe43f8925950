//! Session lifecycle and compaction detection.
//!
//! Two heuristics: a textual marker scan over the latest merged content, and
//! the snapshot size-drop rule evaluated on refresh. Both emit
//! [`LifecycleSignal`]s for external collaborators and never mutate the
//! transcript.

use tracing::info;

use skein_protocol::{CanonMessage, LifecycleSignal, MessageRole};

/// Markers that indicate a server-side compaction is starting.
const COMPACTION_MARKERS: &[&str] = &["pre-compaction", "compaction"];

/// Thresholds for treating a snapshot shrink as compaction rather than data
/// loss.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Minimum fractional drop in message count.
    pub drop_ratio: f64,
    /// Both counts must exceed this floor; tiny transcripts shrink for
    /// ordinary reasons.
    pub floor: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            drop_ratio: 0.4,
            floor: 10,
        }
    }
}

/// Snapshot size-drop rule: the refreshed count shrank past the ratio and
/// both counts clear the floor.
pub fn is_compaction_drop(prior: usize, current: usize, policy: &CompactionPolicy) -> bool {
    if prior <= policy.floor || current <= policy.floor {
        return false;
    }
    if current >= prior {
        return false;
    }
    let drop = (prior - current) as f64 / prior as f64;
    drop > policy.drop_ratio
}

/// Scans merged transcript content for compaction markers.
///
/// A signal fires once per distinct `(role, text)` pair; unchanged content on
/// subsequent scans stays quiet.
#[derive(Debug, Default)]
pub struct LifecycleDetector {
    last_marker: Option<(MessageRole, String)>,
}

impl LifecycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the latest merged message. Returns `CompactionStart` when a new
    /// compaction marker appears.
    pub fn scan(&mut self, session_key: &str, latest: &CanonMessage) -> Option<LifecycleSignal> {
        let lowered = latest.text.to_lowercase();
        if !COMPACTION_MARKERS.iter().any(|m| lowered.contains(m)) {
            return None;
        }

        let marker = (latest.role, latest.text.clone());
        if self.last_marker.as_ref() == Some(&marker) {
            return None;
        }
        self.last_marker = Some(marker);

        info!(session = %session_key, "compaction marker detected");
        Some(LifecycleSignal::CompactionStart {
            session_key: session_key.to_string(),
            role: latest.role,
            text: latest.text.clone(),
        })
    }
}

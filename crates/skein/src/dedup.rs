//! Layered duplicate reconciliation.
//!
//! An incoming message (stream echo or snapshot entry) is matched against the
//! existing transcript identity-first, then content-with-recency, then
//! appended. The reconciler is the single place where the race between the
//! optimistic-append path and the live echo path is resolved, so it must be
//! idempotent: running it twice on the same candidate leaves the transcript as
//! if it ran once.
//!
//! Wall-clock time is always an explicit parameter. Nothing in here reads
//! ambient time.

use tracing::debug;

use skein_protocol::{CanonMessage, MessageRole};

use crate::canon::{attachment_signature, keys_match, resolve_key};

/// Bounds for the content-based dedup heuristic.
///
/// Server echoes do not always carry the originating client id, so identical
/// content within a short window is treated as the same message. The bounds
/// keep legitimately repeated user messages sent minutes apart from being
/// collapsed.
#[derive(Debug, Clone)]
pub struct DedupPolicy {
    /// Maximum timestamp delta for a content match, milliseconds.
    pub window_ms: i64,
    /// When timestamps are unavailable: how far from the transcript tail a
    /// content match may reach. Optimistic entries are always appended at the
    /// tail, so this bounds the search without needing timestamps.
    pub tail_window: usize,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            tail_window: 5,
        }
    }
}

/// What the reconciler did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Candidate is already present; transcript unchanged.
    Skipped,
    /// Candidate superseded an optimistic entry at this position.
    Replaced(usize),
    /// Candidate was appended as a new message.
    Appended,
}

/// Reconcile one candidate against the transcript, first match wins:
///
/// 1. Identity match on the primary key (including the `opt-` optimistic
///    convention). Skip, or replace in place when the existing entry is
///    optimistic and the candidate confirmed - confirmed always wins and
///    inherits the optimistic entry's position.
/// 2. Content match with recency bound, only for identity-less user-role
///    candidates. Exact text, or attachment signature when both texts are
///    empty. Timestamps are authoritative when both sides carry one; an
///    untimestamped candidate matches a timestamped entry near `now_ms`;
///    otherwise the match must sit within the transcript tail.
/// 3. No match: append.
pub fn reconcile(
    candidate: CanonMessage,
    transcript: &mut Vec<CanonMessage>,
    now_ms: i64,
    policy: &DedupPolicy,
) -> Outcome {
    let key = resolve_key(&candidate);

    // Layer 1: identity.
    if let Some(primary) = key.primary.as_deref() {
        for (idx, existing) in transcript.iter().enumerate() {
            let existing_key = resolve_key(existing);
            let Some(existing_primary) = existing_key.primary.as_deref() else {
                continue;
            };
            if !keys_match(primary, existing_primary) {
                continue;
            }
            if existing.is_optimistic() && candidate.is_confirmed() {
                debug!(position = idx, "confirmed message superseding optimistic entry");
                transcript[idx] = candidate;
                return Outcome::Replaced(idx);
            }
            return Outcome::Skipped;
        }
        if !candidate.is_optimistic() {
            transcript.push(candidate);
            return Outcome::Appended;
        }
        // An optimistic candidate without an identity match may still have
        // been confirmed under content identity; fall through.
    }

    // Layer 2: content with recency bound. Eligible candidates are user-role
    // echoes with no identity, and optimistic entries checked against their
    // confirmed counterparts; assistant content is reconciled by snapshot
    // absorption.
    if candidate.role == MessageRole::User {
        let len = transcript.len();
        for (idx, existing) in transcript.iter().enumerate() {
            if existing.role != candidate.role {
                continue;
            }
            // Two distinct optimistic sends of the same text must both stay.
            if candidate.is_optimistic() && existing.is_optimistic() {
                continue;
            }
            if !content_matches(&candidate, existing) {
                continue;
            }
            if within_recency_bound(&candidate, existing, now_ms, idx, len, policy) {
                debug!(position = idx, "content match within recency bound, dropping echo");
                return Outcome::Skipped;
            }
        }
    }

    transcript.push(candidate);
    Outcome::Appended
}

/// Exact text match, or attachment-signature match when both texts are empty.
/// Empty signatures never match anything.
fn content_matches(candidate: &CanonMessage, existing: &CanonMessage) -> bool {
    if !candidate.text.is_empty() || !existing.text.is_empty() {
        return candidate.text == existing.text;
    }
    let candidate_sig = attachment_signature(&candidate.attachments);
    if candidate_sig.is_empty() {
        return false;
    }
    candidate_sig == attachment_signature(&existing.attachments)
}

/// Timestamp delta when both sides carry one (authoritative, even when the
/// position rule would disagree). An untimestamped candidate arriving `now`
/// also matches an entry timestamped near `now`. Tail membership is the
/// fallback when neither signal applies.
fn within_recency_bound(
    candidate: &CanonMessage,
    existing: &CanonMessage,
    now_ms: i64,
    index: usize,
    len: usize,
    policy: &DedupPolicy,
) -> bool {
    let in_tail = index + policy.tail_window >= len;
    match (candidate.timestamp_ms, existing.timestamp_ms) {
        (Some(a), Some(b)) => (a - b).abs() < policy.window_ms,
        (None, Some(b)) => (now_ms - b).abs() < policy.window_ms || in_tail,
        _ => in_tail,
    }
}

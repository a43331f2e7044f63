//! Node selection strategies.
//!
//! Every function here works on the already-filtered list of healthy
//! candidates in registration order and returns an index into it. The
//! shared cursor is the balancer's single round-robin position: it advances
//! on every round-robin style pick and is only reset when the strategy
//! changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fanout_core::UserId;
use fanout_settings::Strategy;

use crate::node::Node;

/// Pluggable 32-bit hash used by [`Strategy::HashBased`].
pub type HashFn = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

/// Virtual slots handed out per unit of normalised weight.
const WEIGHT_SLOTS: f64 = 10.0;

/// Optional routing hints for a selection.
#[derive(Clone, Debug, Default)]
pub struct SelectionRequest {
    /// Client session, used for sticky pinning and as the fallback hash key.
    pub session_id: Option<String>,
    /// Explicit key for hash-based routing.
    pub hash_key: Option<String>,
    /// Upstream-validated user, informational only.
    pub user_id: Option<UserId>,
}

impl SelectionRequest {
    /// Request carrying only a session id.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Set the explicit hash key.
    #[must_use]
    pub fn with_hash_key(mut self, key: impl Into<String>) -> Self {
        self.hash_key = Some(key.into());
        self
    }

    /// Key used by hash-based routing: `hash_key`, else `session_id`.
    pub fn routing_key(&self) -> Option<&str> {
        self.hash_key.as_deref().or(self.session_id.as_deref())
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Dispatch to the active strategy.
pub(crate) fn select(
    strategy: Strategy,
    candidates: &[&Node],
    request: Option<&SelectionRequest>,
    hash_fn: Option<&HashFn>,
    cursor: &AtomicUsize,
) -> Option<usize> {
    match strategy {
        Strategy::RoundRobin => round_robin(candidates.len(), cursor),
        Strategy::LeastConnections => least_connections(candidates),
        Strategy::WeightedRoundRobin => weighted_round_robin(candidates, cursor),
        Strategy::HashBased => hash_based(
            candidates,
            request.and_then(SelectionRequest::routing_key),
            hash_fn,
            cursor,
        ),
    }
}

pub(crate) fn round_robin(len: usize, cursor: &AtomicUsize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(cursor.fetch_add(1, Ordering::Relaxed) % len)
}

/// Fewest connections; the first of equal minima wins.
pub(crate) fn least_connections(candidates: &[&Node]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| node.connections())
        .map(|(index, _)| index)
}

/// Expand each candidate into `ceil(weight / total * 10)` slots.
///
/// Empty when the total weight is zero.
pub(crate) fn weighted_slots(candidates: &[&Node]) -> Vec<usize> {
    let total: f64 = candidates.iter().map(|node| node.weight()).sum();
    if total <= 0.0 {
        return Vec::new();
    }
    let mut slots = Vec::new();
    for (index, node) in candidates.iter().enumerate() {
        let count = (node.weight() / total * WEIGHT_SLOTS).ceil() as usize;
        slots.extend(std::iter::repeat_n(index, count));
    }
    slots
}

pub(crate) fn weighted_round_robin(candidates: &[&Node], cursor: &AtomicUsize) -> Option<usize> {
    let slots = weighted_slots(candidates);
    if slots.is_empty() {
        return round_robin(candidates.len(), cursor);
    }
    round_robin(slots.len(), cursor).map(|slot| slots[slot])
}

pub(crate) fn hash_based(
    candidates: &[&Node],
    key: Option<&str>,
    hash_fn: Option<&HashFn>,
    cursor: &AtomicUsize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    match (key, hash_fn) {
        (Some(key), Some(hash)) => Some(hash(key) as usize % candidates.len()),
        _ => round_robin(candidates.len(), cursor),
    }
}

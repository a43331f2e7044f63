//! Node records held by the registry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fanout_core::NodeId;
use serde_json::Value;

/// One server instance as seen by the balancer.
///
/// Live metrics are only written by the balancer itself (load updates,
/// response-time samples and health checks), so fields are read through
/// accessors.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    weight: f64,
    connections: usize,
    load: f64,
    healthy: bool,
    last_health_check: Instant,
    response_time: Duration,
    metadata: HashMap<String, Value>,
}

impl Node {
    /// A fresh, healthy node with weight 1 and no connections.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            weight: 1.0,
            connections: 0,
            load: 0.0,
            healthy: true,
            last_health_check: Instant::now(),
            response_time: Duration::ZERO,
            metadata: HashMap::new(),
        }
    }

    /// Set the relative capacity. Negative and non-finite weights clamp to 0.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        self
    }

    /// Attach opaque metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Node id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Relative capacity.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Live connection count.
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Load factor in `[0, 1]`.
    pub fn load(&self) -> f64 {
        self.load
    }

    /// Whether the node is eligible for selection.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// When metrics were last pushed for this node.
    pub fn last_health_check(&self) -> Instant {
        self.last_health_check
    }

    /// Last observed latency sample.
    pub fn response_time(&self) -> Duration {
        self.response_time
    }

    /// Opaque metadata.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    // ─── Balancer-internal mutation ──────────────────────────────────────

    pub(crate) fn touch(&mut self) {
        self.last_health_check = Instant::now();
    }

    pub(crate) fn set_load(&mut self, connections: usize, load: f64) {
        self.connections = connections;
        self.load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
        self.touch();
    }

    pub(crate) fn set_response_time(&mut self, response_time: Duration) {
        self.response_time = response_time;
    }

    /// Returns `true` when the flag actually changed.
    pub(crate) fn set_healthy(&mut self, healthy: bool) -> bool {
        let changed = self.healthy != healthy;
        self.healthy = healthy;
        changed
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(earlier) = self.last_health_check.checked_sub(by) {
            self.last_health_check = earlier;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_defaults() {
        let node = Node::new("a");
        assert_eq!(node.id().as_str(), "a");
        assert_eq!(node.weight(), 1.0);
        assert_eq!(node.connections(), 0);
        assert!(node.is_healthy());
        assert!(node.metadata().is_empty());
    }

    #[test]
    fn weight_clamps_negative() {
        assert_eq!(Node::new("a").with_weight(-3.0).weight(), 0.0);
        assert_eq!(Node::new("a").with_weight(f64::NAN).weight(), 0.0);
        assert_eq!(Node::new("a").with_weight(2.5).weight(), 2.5);
    }

    #[test]
    fn set_load_clamps_and_touches() {
        let mut node = Node::new("a");
        node.backdate(Duration::from_secs(10));
        let before = node.last_health_check();
        node.set_load(7, 1.7);
        assert_eq!(node.connections(), 7);
        assert_eq!(node.load(), 1.0);
        assert!(node.last_health_check() > before);
    }

    #[test]
    fn set_healthy_reports_transition() {
        let mut node = Node::new("a");
        assert!(!node.set_healthy(true));
        assert!(node.set_healthy(false));
        assert!(!node.set_healthy(false));
    }
}

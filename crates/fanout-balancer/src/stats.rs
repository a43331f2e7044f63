//! Read-only balancer snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fanout_core::NodeId;
use fanout_settings::Strategy;
use serde::Serialize;
use serde_json::Value;

use crate::node::Node;

/// Aggregate view of the registry.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStats {
    /// Registered nodes.
    pub total_nodes: usize,
    /// Nodes eligible for selection.
    pub healthy_nodes: usize,
    /// Sum of live connections over all nodes.
    pub total_connections: usize,
    /// Mean load factor over all nodes (0 when empty).
    pub average_load: f64,
    /// Active strategy.
    pub strategy: Strategy,
    /// Whether sticky sessions are enabled.
    pub sticky_sessions: bool,
    /// Live sticky entries.
    pub sticky_session_count: usize,
    /// Rebalance passes that found an imbalance.
    pub rebalance_count: u64,
    /// When the last such pass ran.
    pub last_rebalance: Option<DateTime<Utc>>,
    /// Per-node breakdown in registration order.
    pub nodes: Vec<NodeStats>,
}

/// Per-node snapshot.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    /// Node id.
    pub id: NodeId,
    /// Relative capacity.
    pub weight: f64,
    /// Live connections.
    pub connections: usize,
    /// Load factor.
    pub load: f64,
    /// Health flag.
    pub healthy: bool,
    /// Last latency sample in milliseconds.
    pub response_time_ms: u64,
    /// Milliseconds since the last metric update.
    pub last_update_ms_ago: u64,
    /// Opaque metadata.
    pub metadata: HashMap<String, Value>,
}

impl From<&Node> for NodeStats {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id().clone(),
            weight: node.weight(),
            connections: node.connections(),
            load: node.load(),
            healthy: node.is_healthy(),
            response_time_ms: node.response_time().as_millis() as u64,
            last_update_ms_ago: node.last_health_check().elapsed().as_millis() as u64,
            metadata: node.metadata().clone(),
        }
    }
}

/// Outcome of a rebalance pass that found an imbalance.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceSummary {
    /// Mean connections over healthy nodes.
    pub average_connections: f64,
    /// Nodes above the high watermark.
    pub overloaded: Vec<NodeId>,
    /// Nodes below the low watermark.
    pub underloaded: Vec<NodeId>,
    /// Counter value after this pass.
    pub rebalance_count: u64,
    /// When the pass ran.
    pub completed_at: DateTime<Utc>,
}

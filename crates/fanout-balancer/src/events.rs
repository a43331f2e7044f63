//! Events emitted by the balancer.

use fanout_core::NodeId;
use serde::Serialize;

use crate::health::HealthReason;
use crate::stats::RebalanceSummary;

/// Registry and health notifications, delivered via
/// [`LoadBalancer::subscribe`](crate::LoadBalancer::subscribe).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BalancerEvent {
    /// A node joined the registry.
    NodeAdded {
        /// New node.
        node_id: NodeId,
        /// Registry size after the add.
        total_nodes: usize,
    },
    /// A node left the registry.
    NodeRemoved {
        /// Removed node.
        node_id: NodeId,
        /// Registry size after the removal.
        total_nodes: usize,
    },
    /// A node's health flag flipped.
    NodeHealthChanged {
        /// Affected node.
        node_id: NodeId,
        /// New health flag.
        healthy: bool,
        /// What triggered the transition.
        reason: HealthReason,
    },
    /// A rebalance pass found an imbalance and recorded it.
    RebalanceCompleted(RebalanceSummary),
}

//! Pool snapshots and fan-out reports.

use chrono::{DateTime, Utc};
use fanout_balancer::BalancerStats;
use fanout_core::NodeId;
use serde::Serialize;

use crate::instance::{PooledInstance, load_factor};

/// Aggregated outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    /// Healthy instances the operation was issued to.
    pub attempted: usize,
    /// Instances that completed without error.
    pub succeeded: usize,
    /// Instances that returned an error.
    pub failed: usize,
    /// Connections reached across the succeeded instances.
    pub recipients: usize,
    /// Ids of the instances that failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_instances: Vec<NodeId>,
}

impl BroadcastReport {
    /// Whether every attempted instance succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Per-instance row of [`PoolHealth`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHealth {
    /// Instance id.
    pub id: NodeId,
    /// Tracked connections.
    pub connections: usize,
    /// `connections / max_connections_per_instance`.
    pub load: f64,
    /// Whether broadcasts reach this instance.
    pub healthy: bool,
    /// Weight the node was registered with.
    pub weight: f64,
    /// When the instance was attached.
    pub created_at: DateTime<Utc>,
    /// Last connection change or delivery.
    pub last_activity: DateTime<Utc>,
}

impl InstanceHealth {
    pub(crate) fn from_instance(instance: &PooledInstance, capacity: usize) -> Self {
        let connections = instance.connections();
        Self {
            id: instance.id().clone(),
            connections,
            load: load_factor(connections, capacity),
            healthy: instance.is_healthy(),
            weight: instance.weight(),
            created_at: instance.created_at(),
            last_activity: instance.last_activity(),
        }
    }
}

/// Whole-pool snapshot.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    /// Attached instances.
    pub total_instances: usize,
    /// Instances currently receiving broadcasts.
    pub healthy_instances: usize,
    /// `healthy_instances / total_instances` (0 when empty).
    pub healthy_ratio: f64,
    /// Configured maximum.
    pub max_instances: usize,
    /// Sum of tracked connections.
    pub total_connections: usize,
    /// Mean instance load.
    pub average_load: f64,
    /// Per-instance breakdown, ordered by id.
    pub instances: Vec<InstanceHealth>,
    /// Balancer view of the same nodes.
    pub balancer: BalancerStats,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

/// Result of the periodic load diagnostic.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDiagnostic {
    /// Mean tracked connections over healthy instances.
    pub average_connections: f64,
    /// Instances above the high watermark.
    pub overloaded: Vec<NodeId>,
    /// Instances below the low watermark.
    pub underloaded: Vec<NodeId>,
}

impl LoadDiagnostic {
    /// Whether any instance is outside the watermarks.
    pub fn is_skewed(&self) -> bool {
        !self.overloaded.is_empty() || !self.underloaded.is_empty()
    }
}

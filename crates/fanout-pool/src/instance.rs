//! A server instance attached to the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use fanout_balancer::LoadBalancer;
use fanout_core::{ConnectionLifecycle, NodeId, RealtimeInstance};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Options for [`ConnectionPool::add_server`](crate::ConnectionPool::add_server).
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Relative capacity for weighted selection (default 1).
    pub weight: Option<f64>,
    /// Opaque metadata copied onto the balancer node.
    pub metadata: HashMap<String, Value>,
}

impl ServerOptions {
    /// Options with an explicit weight.
    pub fn weighted(weight: f64) -> Self {
        Self {
            weight: Some(weight),
            ..Self::default()
        }
    }
}

/// One running instance bound to the balancer node with the same id.
pub struct PooledInstance {
    id: NodeId,
    instance: Arc<dyn RealtimeInstance>,
    connections: AtomicUsize,
    healthy: AtomicBool,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    weight: f64,
    /// Stops the lifecycle-tracking task.
    tracker: CancellationToken,
}

impl PooledInstance {
    pub(crate) fn new(
        id: NodeId,
        instance: Arc<dyn RealtimeInstance>,
        weight: f64,
        tracker: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance,
            connections: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            created_at: now,
            last_activity: Mutex::new(now),
            weight,
            tracker,
        }
    }

    /// Instance id (same as the balancer node id).
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The underlying transport.
    pub fn instance(&self) -> &Arc<dyn RealtimeInstance> {
        &self.instance
    }

    /// Tracked live connection count.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Whether broadcasts are sent to this instance.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// When the instance was attached.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last connection change or successful delivery.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Weight the node was registered with.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub(crate) fn set_connections(&self, count: usize) {
        self.connections.store(count, Ordering::Relaxed);
    }

    pub(crate) fn stop_tracking(&self) {
        self.tracker.cancel();
    }

    /// Returns the new count.
    fn connection_opened(&self) -> usize {
        self.touch();
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Saturating at zero. Returns the new count.
    fn connection_closed(&self) -> usize {
        self.touch();
        let previous = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Load factor for `connections` out of `capacity`.
pub(crate) fn load_factor(connections: usize, capacity: usize) -> f64 {
    connections as f64 / capacity.max(1) as f64
}

/// Count lifecycle events and push the resulting load to the balancer.
///
/// Runs until the instance's tracker token is cancelled or its lifecycle
/// channel closes.
#[tracing::instrument(skip_all, fields(node_id = %pooled.id))]
pub(crate) async fn track_lifecycle(
    pooled: Arc<PooledInstance>,
    balancer: Arc<LoadBalancer>,
    mut lifecycle: broadcast::Receiver<ConnectionLifecycle>,
    capacity: usize,
) {
    let cancel = pooled.tracker.clone();
    loop {
        let event = tokio::select! {
            result = lifecycle.recv() => result,
            () = cancel.cancelled() => {
                debug!("lifecycle tracking stopped");
                return;
            }
        };

        let count = match event {
            Ok(ConnectionLifecycle::Opened(identity)) => {
                trace!(connection_id = %identity.connection_id, "connection opened");
                pooled.connection_opened()
            }
            Ok(ConnectionLifecycle::Closed(identity)) => {
                trace!(connection_id = %identity.connection_id, "connection closed");
                pooled.connection_closed()
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "lifecycle events lagged, count corrected on next probe");
                continue;
            }
            Err(RecvError::Closed) => {
                debug!("lifecycle channel closed");
                return;
            }
        };

        balancer.update_node_load(&pooled.id, count, load_factor(count, capacity));
    }
}

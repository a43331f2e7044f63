//! The connection pool.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use fanout_balancer::{LoadBalancer, Node, SelectionRequest};
use fanout_core::errors::Result as TransportResult;
use fanout_core::{ConnectionId, NodeId, RealtimeEvent, RealtimeInstance, RoomId, TransportError, UserId};
use fanout_settings::PoolSettings;
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{PoolError, Result};
use crate::health::{BroadcastReport, InstanceHealth, PoolHealth};
use crate::instance::{PooledInstance, ServerOptions, track_lifecycle};
use crate::monitor;

/// Reason sent to clients of an instance that is being removed.
const REMOVAL_REASON: &str = "server instance is being removed from the pool";

/// A set of real-time instances behind one balancer.
///
/// Each attached instance is registered as a balancer node with the same
/// id. Share the pool behind an `Arc`; no lock is held across `.await`.
pub struct ConnectionPool {
    settings: PoolSettings,
    balancer: Arc<LoadBalancer>,
    instances: DashMap<NodeId, Arc<PooledInstance>>,
    /// Serialises the capacity check with the insert in `add_server`.
    admission: Mutex<()>,
}

impl ConnectionPool {
    /// Create an empty pool over `balancer`.
    pub fn new(settings: PoolSettings, balancer: Arc<LoadBalancer>) -> Self {
        Self {
            settings,
            balancer,
            instances: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    /// Pool settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// The balancer choosing between instances.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Number of attached instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance is attached.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// One attached instance.
    pub fn instance(&self, id: &NodeId) -> Option<Arc<PooledInstance>> {
        self.instances.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of every attached instance, oldest first.
    pub fn instance_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Every attached instance, oldest first. Clones the `Arc`s so callers
    /// can `.await` without holding map guards.
    pub(crate) fn snapshot(&self) -> Vec<Arc<PooledInstance>> {
        let mut all: Vec<Arc<PooledInstance>> =
            self.instances.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    // ─── Membership ──────────────────────────────────────────────────────

    /// Attach an instance and register its balancer node.
    ///
    /// Spawns the task that counts the instance's connections, so this
    /// must be called inside a Tokio runtime.
    #[tracing::instrument(skip_all)]
    pub fn add_server(
        &self,
        instance: Arc<dyn RealtimeInstance>,
        options: ServerOptions,
    ) -> Result<NodeId> {
        // Subscribe before anything else so no early connection is missed.
        let lifecycle = instance.lifecycle();
        let weight = options.weight.unwrap_or(1.0);

        let pooled = {
            let _admission = self.admission.lock();
            if self.instances.len() >= self.settings.max_instances {
                warn!(max = self.settings.max_instances, "pool is full");
                return Err(PoolError::PoolLimitExceeded {
                    max: self.settings.max_instances,
                });
            }

            let id = NodeId::new();
            let node = Node::new(id.clone())
                .with_weight(weight)
                .with_metadata(options.metadata);
            self.balancer.add_node(node)?;

            let pooled = Arc::new(PooledInstance::new(
                id.clone(),
                instance,
                weight,
                CancellationToken::new(),
            ));
            let _ = self.instances.insert(id, Arc::clone(&pooled));
            pooled
        };

        let _task = tokio::spawn(track_lifecycle(
            Arc::clone(&pooled),
            Arc::clone(&self.balancer),
            lifecycle,
            self.settings.max_connections_per_instance,
        ));

        info!(node_id = %pooled.id(), weight, total = self.instances.len(), "server added to pool");
        Ok(pooled.id().clone())
    }

    /// Detach an instance gracefully.
    ///
    /// Every live connection is told to reconnect and then disconnected,
    /// the instance is shut down, and its node leaves the balancer (which
    /// rebalances the rest). Returns `false` if the id was unknown, so a
    /// second call is a no-op.
    #[tracing::instrument(skip_all, fields(node_id = %id))]
    pub async fn remove_server(&self, id: &NodeId) -> bool {
        let Some((_, pooled)) = self.instances.remove(id) else {
            warn!("remove_server: unknown instance");
            return false;
        };
        pooled.stop_tracking();

        let maintenance = RealtimeEvent::Maintenance {
            reason: REMOVAL_REASON.into(),
            reconnect: true,
        };
        match pooled.instance().connections().await {
            Ok(connections) => {
                let count = connections.len();
                for identity in connections {
                    let connection_id = identity.connection_id;
                    if let Err(error) = pooled
                        .instance()
                        .emit_to_connection(&connection_id, &maintenance)
                        .await
                    {
                        debug!(%connection_id, %error, "maintenance notice not delivered");
                    }
                    if let Err(error) = pooled.instance().disconnect(&connection_id).await {
                        debug!(%connection_id, %error, "disconnect failed");
                    }
                }
                info!(connections = count, "connections notified and closed");
            }
            Err(error) => warn!(%error, "could not enumerate connections before removal"),
        }

        pooled.instance().shutdown().await;
        let _ = self.balancer.remove_node(id);
        info!(remaining = self.instances.len(), "server removed from pool");
        true
    }

    /// Instance for a new connection, chosen by the balancer.
    pub fn get_optimal_server(
        &self,
        request: Option<&SelectionRequest>,
    ) -> Option<Arc<PooledInstance>> {
        let node = self.balancer.select_node(request)?;
        let pooled = self.instance(node.id());
        if pooled.is_none() {
            error!(node_id = %node.id(), "balancer selected a node with no pooled instance");
        }
        pooled
    }

    // ─── Fan-out ─────────────────────────────────────────────────────────

    /// Deliver an event to every connection on every healthy instance.
    pub async fn broadcast_to_all(&self, event: &RealtimeEvent) -> BroadcastReport {
        self.fan_out("all", |pooled| async move {
            pooled.instance().emit_to_all(event).await
        })
        .await
    }

    /// Deliver an event to a room on every healthy instance.
    pub async fn broadcast_to_room(&self, room: &RoomId, event: &RealtimeEvent) -> BroadcastReport {
        self.fan_out("room", |pooled| async move {
            pooled.instance().emit_to_room(room, event, None).await
        })
        .await
    }

    /// Deliver an event to every connection of one user, wherever it lives.
    pub async fn broadcast_to_user(&self, user_id: &UserId, event: &RealtimeEvent) -> BroadcastReport {
        self.fan_out("user", |pooled| async move {
            let targets: Vec<ConnectionId> = pooled
                .instance()
                .connections()
                .await?
                .into_iter()
                .filter(|identity| identity.user_id.as_ref() == Some(user_id))
                .map(|identity| identity.connection_id)
                .collect();

            let mut delivered = 0;
            for connection_id in &targets {
                match pooled.instance().emit_to_connection(connection_id, event).await {
                    Ok(()) => delivered += 1,
                    Err(error) => debug!(%connection_id, %error, "user delivery failed"),
                }
            }
            Ok::<_, TransportError>(delivered)
        })
        .await
    }

    /// Issue `op` to every healthy instance concurrently and aggregate.
    async fn fan_out<F, Fut>(&self, operation: &'static str, op: F) -> BroadcastReport
    where
        F: Fn(Arc<PooledInstance>) -> Fut,
        Fut: Future<Output = TransportResult<usize>>,
    {
        let targets: Vec<Arc<PooledInstance>> = self
            .snapshot()
            .into_iter()
            .filter(|p| p.is_healthy())
            .collect();

        let outcomes = join_all(targets.into_iter().map(|pooled| {
            let pending = op(Arc::clone(&pooled));
            async move { (pooled, pending.await) }
        }))
        .await;

        let mut report = BroadcastReport {
            attempted: outcomes.len(),
            ..BroadcastReport::default()
        };
        for (pooled, outcome) in outcomes {
            match outcome {
                Ok(recipients) => {
                    report.succeeded += 1;
                    report.recipients += recipients;
                    pooled.touch();
                }
                Err(error) => {
                    warn!(node_id = %pooled.id(), operation, %error, "broadcast to instance failed");
                    counter!("fanout_pool_broadcast_failures_total", "operation" => operation)
                        .increment(1);
                    report.failed += 1;
                    report.failed_instances.push(pooled.id().clone());
                }
            }
        }
        debug!(
            operation,
            attempted = report.attempted,
            failed = report.failed,
            recipients = report.recipients,
            "fan-out complete"
        );
        report
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Whole-pool snapshot including balancer stats.
    pub fn get_pool_health(&self) -> PoolHealth {
        let capacity = self.settings.max_connections_per_instance;
        let instances: Vec<InstanceHealth> = self
            .snapshot()
            .iter()
            .map(|p| InstanceHealth::from_instance(p, capacity))
            .collect();
        let total_instances = instances.len();
        let healthy_instances = instances.iter().filter(|i| i.healthy).count();
        let (healthy_ratio, average_load) = if total_instances == 0 {
            (0.0, 0.0)
        } else {
            (
                healthy_instances as f64 / total_instances as f64,
                instances.iter().map(|i| i.load).sum::<f64>() / total_instances as f64,
            )
        };
        PoolHealth {
            total_instances,
            healthy_instances,
            healthy_ratio,
            max_instances: self.settings.max_instances,
            total_connections: instances.iter().map(|i| i.connections).sum(),
            average_load,
            instances,
            balancer: self.balancer.stats(),
            checked_at: Utc::now(),
        }
    }

    /// Start the balancer tasks plus the pool's health monitor and load
    /// diagnostic. All stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.balancer.start(cancel);
        handles.push(tokio::spawn(monitor::run_health_monitor(
            Arc::clone(self),
            self.settings.health_check_interval(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(monitor::run_load_diagnostic(
            Arc::clone(self),
            self.settings.rebalance_interval(),
            cancel.clone(),
        )));
        info!(
            max_instances = self.settings.max_instances,
            health_interval_ms = self.settings.health_check_interval_ms,
            "connection pool started"
        );
        handles
    }

    /// Remove every instance gracefully.
    pub async fn shutdown(&self) {
        let ids = self.instance_ids();
        info!(instances = ids.len(), "shutting down connection pool");
        for id in ids {
            let _ = self.remove_server(&id).await;
        }
    }
}

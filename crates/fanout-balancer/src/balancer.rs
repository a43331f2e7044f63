//! The load balancer: registry, selection, sticky sessions and rebalancing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fanout_core::NodeId;
use fanout_settings::{BalancerSettings, Strategy};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{BalancerError, Result};
use crate::events::BalancerEvent;
use crate::health::{self, HealthReason, HealthThresholds};
use crate::node::Node;
use crate::stats::{BalancerStats, NodeStats, RebalanceSummary};
use crate::strategy::{self, HashFn, SelectionRequest, fnv1a_32};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Healthy nodes above `average * OVERLOAD_FACTOR` connections are overloaded.
const OVERLOAD_FACTOR: f64 = 1.2;

/// Healthy nodes below `average * UNDERLOAD_FACTOR` connections are underloaded.
const UNDERLOAD_FACTOR: f64 = 0.8;

/// A session pin. `last_used` is refreshed on every sticky hit.
#[derive(Clone, Debug)]
struct StickyEntry {
    node_id: NodeId,
    last_used: Instant,
}

#[derive(Default)]
struct RebalanceState {
    count: u64,
    last_at: Option<DateTime<Utc>>,
    last_summary: Option<RebalanceSummary>,
}

/// Picks a node for each new connection.
///
/// All methods take `&self`; share it behind an `Arc`. Locks are only held
/// for the duration of a registry read or write and never across `.await`.
pub struct LoadBalancer {
    settings: BalancerSettings,
    /// Registration order is selection order.
    nodes: RwLock<Vec<Node>>,
    strategy: RwLock<Strategy>,
    cursor: AtomicUsize,
    sticky: DashMap<String, StickyEntry>,
    hash_fn: RwLock<Option<HashFn>>,
    rebalance: Mutex<RebalanceState>,
    events: broadcast::Sender<BalancerEvent>,
}

impl LoadBalancer {
    /// Create an empty balancer. Background tasks start with [`Self::start`].
    pub fn new(settings: BalancerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let default_hash: HashFn = Arc::new(fnv1a_32);
        Self {
            strategy: RwLock::new(settings.strategy),
            settings,
            nodes: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            sticky: DashMap::new(),
            hash_fn: RwLock::new(Some(default_hash)),
            rebalance: Mutex::new(RebalanceState::default()),
            events,
        }
    }

    /// Settings this balancer was built with.
    pub fn settings(&self) -> &BalancerSettings {
        &self.settings
    }

    /// Subscribe to registry and health events.
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.events.subscribe()
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Register a node. Its metrics clock starts now.
    pub fn add_node(&self, mut node: Node) -> Result<()> {
        let node_id = node.id().clone();
        let total_nodes = {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|n| n.id() == &node_id) {
                return Err(BalancerError::NodeExists(node_id));
            }
            node.touch();
            nodes.push(node);
            nodes.len()
        };
        info!(node_id = %node_id, total_nodes, "node added");
        self.emit(BalancerEvent::NodeAdded {
            node_id,
            total_nodes,
        });
        Ok(())
    }

    /// Deregister a node, purge its sticky entries and rebalance the rest.
    ///
    /// Returns `false` (with a warning) if the node was unknown.
    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        let total_nodes = {
            let mut nodes = self.nodes.write();
            let Some(position) = nodes.iter().position(|n| n.id() == node_id) else {
                warn!(node_id = %node_id, "remove_node: unknown node");
                return false;
            };
            let _ = nodes.remove(position);
            nodes.len()
        };

        let before = self.sticky.len();
        self.sticky.retain(|_, pinned| pinned.node_id != *node_id);
        let purged = before.saturating_sub(self.sticky.len());

        info!(node_id = %node_id, total_nodes, purged_sticky = purged, "node removed");
        self.emit(BalancerEvent::NodeRemoved {
            node_id: node_id.clone(),
            total_nodes,
        });

        if total_nodes > 0 {
            let _ = self.recompute_assignment_weights();
        }
        true
    }

    /// Overwrite a node's live metrics and recompute its health.
    ///
    /// Healthy means `connections < max_connections_per_node` and
    /// `load < max_load`. Unknown nodes are a warning no-op.
    pub fn update_node_load(&self, node_id: &NodeId, connections: usize, load: f64) {
        let transition = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.iter_mut().find(|n| n.id() == node_id) else {
                warn!(node_id = %node_id, "update_node_load: unknown node");
                return;
            };
            node.set_load(connections, load);
            let healthy = connections < self.settings.max_connections_per_node
                && node.load() < self.settings.max_load;
            node.set_healthy(healthy).then_some(healthy)
        };

        if let Some(healthy) = transition {
            self.health_changed(node_id, healthy, HealthReason::LoadUpdate);
        }
    }

    /// Record a latency sample for the periodic health check.
    pub fn record_response_time(&self, node_id: &NodeId, response_time: Duration) {
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|n| n.id() == node_id) {
            Some(node) => node.set_response_time(response_time),
            None => warn!(node_id = %node_id, "record_response_time: unknown node"),
        }
    }

    /// Take a node out of rotation until its next healthy load update.
    pub fn mark_unhealthy(&self, node_id: &NodeId, reason: HealthReason) {
        let changed = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.iter_mut().find(|n| n.id() == node_id) else {
                warn!(node_id = %node_id, "mark_unhealthy: unknown node");
                return;
            };
            node.set_healthy(false)
        };
        if changed {
            self.health_changed(node_id, false, reason);
        }
    }

    /// Snapshot of one node.
    pub fn node(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.read().iter().find(|n| n.id() == node_id).cloned()
    }

    /// Snapshot of every node in registration order.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    // ─── Selection ───────────────────────────────────────────────────────

    /// Pick a healthy node, or `None` when none has capacity.
    ///
    /// With sticky sessions enabled a session pinned to a healthy node is
    /// returned as-is; otherwise the active strategy decides and the session
    /// is (re)pinned to the result.
    pub fn select_node(&self, request: Option<&SelectionRequest>) -> Option<Node> {
        let session = if self.settings.sticky_sessions {
            request.and_then(|r| r.session_id.as_deref())
        } else {
            None
        };

        let selected = {
            let nodes = self.nodes.read();
            let candidates: Vec<&Node> = nodes.iter().filter(|n| n.is_healthy()).collect();
            if candidates.is_empty() {
                debug!(total_nodes = nodes.len(), "no healthy node available");
                return None;
            }

            if let Some(session) = session {
                let pinned = self.sticky_node(session);
                if let Some(node) =
                    pinned.and_then(|id| candidates.iter().find(|n| n.id() == &id))
                {
                    if let Some(mut entry) = self.sticky.get_mut(session) {
                        entry.last_used = Instant::now();
                    }
                    debug!(session, node_id = %node.id(), "sticky hit");
                    return Some((*node).clone());
                }
            }

            let strategy = *self.strategy.read();
            let hash_fn = self.hash_fn.read().clone();
            let index = strategy::select(
                strategy,
                &candidates,
                request,
                hash_fn.as_ref(),
                &self.cursor,
            )?;
            candidates[index].clone()
        };

        if let Some(session) = session {
            self.pin(session, selected.id());
        }
        Some(selected)
    }

    /// Pin `session` to `node_id`. Re-pinning an existing session always
    /// succeeds; a new session is left unpinned while the table is full.
    fn pin(&self, session: &str, node_id: &NodeId) {
        let now = Instant::now();
        if let Some(mut entry) = self.sticky.get_mut(session) {
            entry.node_id = node_id.clone();
            entry.last_used = now;
            return;
        }
        if self.sticky.len() >= self.settings.sticky_max_entries {
            debug!(
                session,
                limit = self.settings.sticky_max_entries,
                "sticky table full, session not pinned"
            );
            return;
        }
        let _ = self.sticky.insert(
            session.to_string(),
            StickyEntry {
                node_id: node_id.clone(),
                last_used: now,
            },
        );
    }

    /// Switch strategy and reset the round-robin cursor.
    pub fn set_strategy(&self, strategy: Strategy) {
        let previous = std::mem::replace(&mut *self.strategy.write(), strategy);
        self.cursor.store(0, Ordering::Relaxed);
        info!(from = %previous, to = %strategy, "strategy changed");
    }

    /// Active strategy.
    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    /// Replace the hash used by hash-based selection. `None` makes hash-based
    /// selection fall back to round-robin.
    pub fn set_hash_function(&self, hash_fn: Option<HashFn>) {
        *self.hash_fn.write() = hash_fn;
    }

    /// Node a session is pinned to, if any.
    pub fn sticky_node(&self, session_id: &str) -> Option<NodeId> {
        self.sticky.get(session_id).map(|entry| entry.node_id.clone())
    }

    /// Drop sticky entries unused for longer than the configured TTL.
    /// Returns how many were dropped.
    pub fn prune_sticky_sessions(&self) -> usize {
        self.prune_sticky_at(Instant::now())
    }

    fn prune_sticky_at(&self, now: Instant) -> usize {
        let ttl = self.settings.sticky_ttl();
        let before = self.sticky.len();
        self.sticky
            .retain(|_, entry| now.saturating_duration_since(entry.last_used) <= ttl);
        let pruned = before.saturating_sub(self.sticky.len());
        if pruned > 0 {
            debug!(pruned, remaining = self.sticky.len(), "expired sticky sessions pruned");
        }
        pruned
    }

    // ─── Health and rebalancing ──────────────────────────────────────────

    /// Run one health pass. Returns how many nodes were marked unhealthy.
    ///
    /// Only ever marks nodes unhealthy; recovery comes from load updates.
    pub fn check_health(&self) -> usize {
        let thresholds = HealthThresholds::from(&self.settings);
        let now = Instant::now();
        let marked: Vec<(NodeId, HealthReason)> = {
            let mut nodes = self.nodes.write();
            nodes
                .iter_mut()
                .filter_map(|node| {
                    let reason = health::assess(node, &thresholds, now)?;
                    node.set_healthy(false).then(|| (node.id().clone(), reason))
                })
                .collect()
        };
        for (node_id, reason) in &marked {
            self.health_changed(node_id, false, *reason);
        }
        marked.len()
    }

    /// Classify healthy nodes against the mean connection count.
    ///
    /// Returns `None` when nothing is both over- and underloaded. Live
    /// connections are never moved; the summary only records where future
    /// assignments should go.
    pub fn recompute_assignment_weights(&self) -> Option<RebalanceSummary> {
        let loads: Vec<(NodeId, usize)> = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.is_healthy())
            .map(|n| (n.id().clone(), n.connections()))
            .collect();
        if loads.is_empty() {
            return None;
        }

        let total: usize = loads.iter().map(|(_, c)| c).sum();
        let average = total as f64 / loads.len() as f64;
        let overloaded: Vec<NodeId> = loads
            .iter()
            .filter(|(_, c)| *c as f64 > average * OVERLOAD_FACTOR)
            .map(|(id, _)| id.clone())
            .collect();
        let underloaded: Vec<NodeId> = loads
            .iter()
            .filter(|(_, c)| (*c as f64) < average * UNDERLOAD_FACTOR)
            .map(|(id, _)| id.clone())
            .collect();

        if overloaded.is_empty() || underloaded.is_empty() {
            debug!(average, "nodes balanced");
            return None;
        }

        let summary = {
            let mut state = self.rebalance.lock();
            state.count += 1;
            let summary = RebalanceSummary {
                average_connections: average,
                overloaded,
                underloaded,
                rebalance_count: state.count,
                completed_at: Utc::now(),
            };
            state.last_at = Some(summary.completed_at);
            state.last_summary = Some(summary.clone());
            summary
        };

        info!(
            average,
            overloaded = summary.overloaded.len(),
            underloaded = summary.underloaded.len(),
            rebalance_count = summary.rebalance_count,
            "assignment weights recomputed"
        );
        self.emit(BalancerEvent::RebalanceCompleted(summary.clone()));
        Some(summary)
    }

    /// Most recent rebalance summary.
    pub fn last_rebalance(&self) -> Option<RebalanceSummary> {
        self.rebalance.lock().last_summary.clone()
    }

    /// Registry snapshot.
    pub fn stats(&self) -> BalancerStats {
        let nodes = self.nodes.read();
        let total_nodes = nodes.len();
        let average_load = if total_nodes == 0 {
            0.0
        } else {
            nodes.iter().map(Node::load).sum::<f64>() / total_nodes as f64
        };
        let (rebalance_count, last_rebalance) = {
            let state = self.rebalance.lock();
            (state.count, state.last_at)
        };
        BalancerStats {
            total_nodes,
            healthy_nodes: nodes.iter().filter(|n| n.is_healthy()).count(),
            total_connections: nodes.iter().map(Node::connections).sum(),
            average_load,
            strategy: *self.strategy.read(),
            sticky_sessions: self.settings.sticky_sessions,
            sticky_session_count: self.sticky.len(),
            rebalance_count,
            last_rebalance,
            nodes: nodes.iter().map(NodeStats::from).collect(),
        }
    }

    /// Spawn the health-check and rebalance tasks. Both stop when `cancel`
    /// fires.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            strategy = %self.strategy(),
            sticky = self.settings.sticky_sessions,
            health_interval_ms = self.settings.health_check_interval_ms,
            rebalance_interval_ms = self.settings.rebalance_interval_ms,
            "load balancer started"
        );
        vec![
            tokio::spawn(health::run_health_checks(
                Arc::clone(self),
                self.settings.health_check_interval(),
                cancel.clone(),
            )),
            tokio::spawn(run_rebalance(
                Arc::clone(self),
                self.settings.rebalance_interval(),
                cancel.clone(),
            )),
        ]
    }

    fn health_changed(&self, node_id: &NodeId, healthy: bool, reason: HealthReason) {
        if healthy {
            info!(node_id = %node_id, %reason, "node healthy");
        } else {
            warn!(node_id = %node_id, %reason, "node unhealthy");
        }
        self.emit(BalancerEvent::NodeHealthChanged {
            node_id: node_id.clone(),
            healthy,
            reason,
        });
    }

    fn emit(&self, event: BalancerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[tracing::instrument(skip_all, name = "balancer_rebalance")]
async fn run_rebalance(balancer: Arc<LoadBalancer>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = balancer.recompute_assignment_weights();
                let _ = balancer.prune_sticky_sessions();
            }
            () = cancel.cancelled() => {
                debug!("rebalance task stopped");
                return;
            }
        }
    }
}

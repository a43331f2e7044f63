//! Periodic instance probing and load diagnostics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_balancer::HealthReason;
use metrics::{counter, gauge};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::LoadDiagnostic;
use crate::instance::load_factor;
use crate::pool::ConnectionPool;

/// Instances above `average * OVERLOAD_FACTOR` connections are overloaded.
const OVERLOAD_FACTOR: f64 = 1.3;

/// Instances below `average * UNDERLOAD_FACTOR` connections are underloaded.
const UNDERLOAD_FACTOR: f64 = 0.7;

impl ConnectionPool {
    /// Probe every instance once.
    ///
    /// A successful probe corrects the tracked connection count, records
    /// the probe latency as the node's response time and pushes fresh load
    /// to the balancer. A failed probe takes the instance out of fan-out
    /// and its node out of selection. Returns the number of failed probes.
    pub async fn probe_instances(&self) -> usize {
        let capacity = self.settings().max_connections_per_instance;
        let mut failed = 0;

        for pooled in self.snapshot() {
            let started = Instant::now();
            match pooled.instance().connections().await {
                Ok(connections) => {
                    let elapsed = started.elapsed();
                    let actual = connections.len();
                    let tracked = pooled.connections();
                    if actual != tracked {
                        warn!(node_id = %pooled.id(), tracked, actual, "connection count drift corrected");
                        counter!("fanout_pool_count_drift_total").increment(1);
                        pooled.set_connections(actual);
                    }
                    if !pooled.is_healthy() {
                        info!(node_id = %pooled.id(), "instance probe recovered");
                    }
                    pooled.set_healthy(true);
                    self.balancer().record_response_time(pooled.id(), elapsed);
                    self.balancer()
                        .update_node_load(pooled.id(), actual, load_factor(actual, capacity));
                }
                Err(error) => {
                    warn!(node_id = %pooled.id(), %error, "instance probe failed");
                    failed += 1;
                    pooled.set_healthy(false);
                    self.balancer()
                        .mark_unhealthy(pooled.id(), HealthReason::ProbeFailed);
                }
            }
        }

        let health = self.get_pool_health();
        gauge!("fanout_pool_instances").set(health.total_instances as f64);
        gauge!("fanout_pool_healthy_instances").set(health.healthy_instances as f64);
        gauge!("fanout_pool_connections").set(health.total_connections as f64);
        failed
    }

    /// Classify healthy instances against the mean tracked connection
    /// count. Diagnostic only: nothing is moved.
    pub fn evaluate_instance_load(&self) -> LoadDiagnostic {
        let loads: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|p| p.is_healthy())
            .map(|p| (p.id().clone(), p.connections()))
            .collect();
        if loads.is_empty() {
            return LoadDiagnostic::default();
        }

        let total: usize = loads.iter().map(|(_, c)| c).sum();
        let average = total as f64 / loads.len() as f64;
        let diagnostic = LoadDiagnostic {
            average_connections: average,
            overloaded: loads
                .iter()
                .filter(|(_, c)| *c as f64 > average * OVERLOAD_FACTOR)
                .map(|(id, _)| id.clone())
                .collect(),
            underloaded: loads
                .iter()
                .filter(|(_, c)| (*c as f64) < average * UNDERLOAD_FACTOR)
                .map(|(id, _)| id.clone())
                .collect(),
        };

        gauge!("fanout_pool_overloaded_instances").set(diagnostic.overloaded.len() as f64);
        gauge!("fanout_pool_underloaded_instances").set(diagnostic.underloaded.len() as f64);
        if diagnostic.is_skewed() {
            info!(
                average,
                overloaded = diagnostic.overloaded.len(),
                underloaded = diagnostic.underloaded.len(),
                "instance load is skewed"
            );
        }
        diagnostic
    }
}

#[tracing::instrument(skip_all, name = "pool_health_monitor")]
pub(crate) async fn run_health_monitor(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let failed = pool.probe_instances().await;
                if failed > 0 {
                    debug!(failed, "probe round finished with failures");
                }
            }
            () = cancel.cancelled() => {
                debug!("health monitor stopped");
                return;
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "pool_load_diagnostic")]
pub(crate) async fn run_load_diagnostic(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = pool.evaluate_instance_load();
            }
            () = cancel.cancelled() => {
                debug!("load diagnostic stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServerOptions;
    use crate::test_support::FakeInstance;
    use fanout_balancer::LoadBalancer;
    use fanout_core::{NodeId, RealtimeInstance};
    use fanout_settings::{BalancerSettings, PoolSettings};
    use std::sync::atomic::Ordering;

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            PoolSettings {
                max_connections_per_instance: 10,
                health_check_interval_ms: 50,
                rebalance_interval_ms: 50,
                ..PoolSettings::default()
            },
            Arc::new(LoadBalancer::new(BalancerSettings::default())),
        ))
    }

    fn attach(pool: &ConnectionPool, fake: &Arc<FakeInstance>) -> NodeId {
        let instance: Arc<dyn RealtimeInstance> = fake.clone();
        pool.add_server(instance, ServerOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn probe_corrects_drift() {
        let pool = pool();
        let fake = FakeInstance::new();
        let id = attach(&pool, &fake);
        fake.open_silently("c1");
        fake.open_silently("c2");
        fake.open_silently("c3");

        assert_eq!(pool.probe_instances().await, 0);
        assert_eq!(pool.instance(&id).unwrap().connections(), 3);
        let node = pool.balancer().node(&id).unwrap();
        assert_eq!(node.connections(), 3);
        assert!((node.load() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_probe_marks_unhealthy_then_recovers() {
        let pool = pool();
        let fake = FakeInstance::new();
        let id = attach(&pool, &fake);

        fake.failing.store(true, Ordering::Relaxed);
        assert_eq!(pool.probe_instances().await, 1);
        assert!(!pool.instance(&id).unwrap().is_healthy());
        assert!(!pool.balancer().node(&id).unwrap().is_healthy());
        assert!(pool.get_optimal_server(None).is_none());

        fake.failing.store(false, Ordering::Relaxed);
        assert_eq!(pool.probe_instances().await, 0);
        assert!(pool.instance(&id).unwrap().is_healthy());
        assert!(pool.balancer().node(&id).unwrap().is_healthy());
    }

    #[tokio::test]
    async fn load_diagnostic_flags_skew() {
        let pool = pool();
        let busy = FakeInstance::new();
        let idle = FakeInstance::new();
        let steady = FakeInstance::new();
        let busy_id = attach(&pool, &busy);
        let idle_id = attach(&pool, &idle);
        let _ = attach(&pool, &steady);
        for i in 0..9 {
            busy.open_silently(&format!("b{i}"));
        }
        for i in 0..6 {
            steady.open_silently(&format!("s{i}"));
        }
        let _ = pool.probe_instances().await;

        let diagnostic = pool.evaluate_instance_load();
        assert_eq!(diagnostic.average_connections, 5.0);
        assert_eq!(diagnostic.overloaded, vec![busy_id]);
        assert_eq!(diagnostic.underloaded, vec![idle_id]);
    }

    #[tokio::test]
    async fn load_diagnostic_empty_pool() {
        let pool = pool();
        assert_eq!(pool.evaluate_instance_load(), LoadDiagnostic::default());
    }

    #[tokio::test]
    async fn start_runs_monitor_until_cancelled() {
        let pool = pool();
        let fake = FakeInstance::new();
        let id = attach(&pool, &fake);
        fake.open_silently("c1");

        let cancel = CancellationToken::new();
        let handles = pool.start(&cancel);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pool.instance(&id).unwrap().connections(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

//! Node health assessment and the periodic health-check task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_settings::BalancerSettings;
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::balancer::LoadBalancer;
use crate::node::Node;

/// Why a node's health flag changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthReason {
    /// No metric update for more than twice the check interval.
    Stale,
    /// Last response time above the configured ceiling.
    SlowResponse,
    /// Connection count above the configured ceiling.
    ConnectionLimit,
    /// Recomputed from a pushed load update.
    LoadUpdate,
    /// The owner of the node reported a failed probe.
    ProbeFailed,
}

impl std::fmt::Display for HealthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stale => "stale",
            Self::SlowResponse => "slow_response",
            Self::ConnectionLimit => "connection_limit",
            Self::LoadUpdate => "load_update",
            Self::ProbeFailed => "probe_failed",
        })
    }
}

/// Limits applied by the periodic check.
#[derive(Clone, Copy, Debug)]
pub struct HealthThresholds {
    /// A node silent for longer than this is stale.
    pub stale_after: Duration,
    /// Response-time ceiling.
    pub max_response_time: Duration,
    /// Connection ceiling.
    pub max_connections: usize,
}

impl From<&BalancerSettings> for HealthThresholds {
    fn from(settings: &BalancerSettings) -> Self {
        Self {
            stale_after: settings.health_check_interval() * 2,
            max_response_time: settings.max_response_time(),
            max_connections: settings.max_connections_per_node,
        }
    }
}

/// First failing check for `node`, or `None` if it passes.
///
/// Passing does not make a node healthy again: only a load update can do
/// that.
pub fn assess(node: &Node, thresholds: &HealthThresholds, now: Instant) -> Option<HealthReason> {
    if now.saturating_duration_since(node.last_health_check()) > thresholds.stale_after {
        Some(HealthReason::Stale)
    } else if node.response_time() > thresholds.max_response_time {
        Some(HealthReason::SlowResponse)
    } else if node.connections() > thresholds.max_connections {
        Some(HealthReason::ConnectionLimit)
    } else {
        None
    }
}

/// Run [`LoadBalancer::check_health`] every `interval` until cancelled.
#[tracing::instrument(skip_all, name = "balancer_health_checks")]
pub(crate) async fn run_health_checks(
    balancer: Arc<LoadBalancer>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; nodes were just registered.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let marked = balancer.check_health();
                if marked > 0 {
                    debug!(marked, "health check marked nodes unhealthy");
                }
            }
            () = cancel.cancelled() => {
                debug!("health checks stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_secs(60),
            max_response_time: Duration::from_millis(500),
            max_connections: 100,
        }
    }

    #[test]
    fn fresh_node_passes() {
        let node = Node::new("n1");
        assert_eq!(assess(&node, &thresholds(), Instant::now()), None);
    }

    #[test]
    fn stale_node_fails() {
        let mut node = Node::new("n1");
        node.backdate(Duration::from_secs(61));
        assert_eq!(
            assess(&node, &thresholds(), Instant::now()),
            Some(HealthReason::Stale)
        );
    }

    #[test]
    fn slow_node_fails() {
        let mut node = Node::new("n1");
        node.set_response_time(Duration::from_millis(900));
        assert_eq!(
            assess(&node, &thresholds(), Instant::now()),
            Some(HealthReason::SlowResponse)
        );
    }

    #[test]
    fn connection_limit_is_strictly_greater() {
        let mut node = Node::new("n1");
        node.set_load(100, 0.1);
        assert_eq!(assess(&node, &thresholds(), Instant::now()), None);
        node.set_load(101, 0.1);
        assert_eq!(
            assess(&node, &thresholds(), Instant::now()),
            Some(HealthReason::ConnectionLimit)
        );
    }

    #[test]
    fn thresholds_from_settings() {
        let settings = BalancerSettings {
            health_check_interval_ms: 1_000,
            max_response_time_ms: 250,
            max_connections_per_node: 42,
            ..BalancerSettings::default()
        };
        let t = HealthThresholds::from(&settings);
        assert_eq!(t.stale_after, Duration::from_secs(2));
        assert_eq!(t.max_response_time, Duration::from_millis(250));
        assert_eq!(t.max_connections, 42);
    }

    #[test]
    fn reason_display_matches_serde() {
        let json = serde_json::to_value(HealthReason::SlowResponse).unwrap();
        assert_eq!(json, HealthReason::SlowResponse.to_string());
    }
}

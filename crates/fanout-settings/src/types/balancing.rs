//! Load balancer and connection pool settings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Node selection strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through healthy nodes in registration order.
    #[default]
    RoundRobin,
    /// Pick the healthy node with the fewest connections.
    LeastConnections,
    /// Round-robin over virtual slots proportional to node weight.
    WeightedRoundRobin,
    /// Hash a caller-supplied key onto the healthy nodes.
    HashBased,
}

impl Strategy {
    /// Wire/config name of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::HashBased => "hash-based",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "rr" => Ok(Self::RoundRobin),
            "least-connections" | "least_connections" => Ok(Self::LeastConnections),
            "weighted-round-robin" | "weighted_round_robin" | "weighted" => {
                Ok(Self::WeightedRoundRobin)
            }
            "hash-based" | "hash_based" | "hash" => Ok(Self::HashBased),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Load balancer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalancerSettings {
    /// Active selection strategy.
    pub strategy: Strategy,
    /// Pin sessions to the node they were first assigned to.
    pub sticky_sessions: bool,
    /// A node at or above this many connections is unhealthy.
    pub max_connections_per_node: usize,
    /// A node at or above this load factor is unhealthy.
    pub max_load: f64,
    /// A node slower than this is unhealthy.
    pub max_response_time_ms: u64,
    /// Period of the health-check task. Nodes silent for twice this long
    /// are considered stale.
    pub health_check_interval_ms: u64,
    /// Period of the assignment-weight recompute task.
    pub rebalance_interval_ms: u64,
    /// Sticky entries unused for this long are pruned on the rebalance tick.
    pub sticky_ttl_ms: u64,
    /// Cap on sticky entries. New sessions are not pinned while full.
    pub sticky_max_entries: usize,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            sticky_sessions: false,
            max_connections_per_node: 1000,
            max_load: 0.9,
            max_response_time_ms: 5_000,
            health_check_interval_ms: 30_000,
            rebalance_interval_ms: 60_000,
            sticky_ttl_ms: 3_600_000,
            sticky_max_entries: 100_000,
        }
    }
}

impl BalancerSettings {
    /// Health-check period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Rebalance period.
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    /// Idle lifetime of a sticky entry.
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_millis(self.sticky_ttl_ms)
    }

    /// Response-time ceiling.
    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Run several instances behind the balancer instead of one.
    pub enabled: bool,
    /// Instances started at boot when the pool is enabled.
    pub initial_instances: usize,
    /// Hard cap on attached instances.
    pub max_instances: usize,
    /// Capacity used to derive an instance's load factor.
    pub max_connections_per_instance: usize,
    /// Period of the instance health monitor.
    pub health_check_interval_ms: u64,
    /// Period of the instance load diagnostic.
    pub rebalance_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_instances: 2,
            max_instances: 10,
            max_connections_per_instance: 1000,
            health_check_interval_ms: 15_000,
            rebalance_interval_ms: 60_000,
        }
    }
}

impl PoolSettings {
    /// Health monitor period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Load diagnostic period.
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_serde_names() {
        let json = serde_json::to_string(&Strategy::WeightedRoundRobin).unwrap();
        assert_eq!(json, "\"weighted-round-robin\"");
        let back: Strategy = serde_json::from_str("\"least-connections\"").unwrap();
        assert_eq!(back, Strategy::LeastConnections);
    }

    #[test]
    fn strategy_from_str_aliases() {
        assert_eq!("rr".parse::<Strategy>(), Ok(Strategy::RoundRobin));
        assert_eq!("HASH".parse::<Strategy>(), Ok(Strategy::HashBased));
        assert_eq!("weighted".parse::<Strategy>(), Ok(Strategy::WeightedRoundRobin));
        assert!("random".parse::<Strategy>().is_err());
    }

    #[test]
    fn strategy_display_matches_serde() {
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::WeightedRoundRobin,
            Strategy::HashBased,
        ] {
            let json = serde_json::to_value(strategy).unwrap();
            assert_eq!(json, strategy.to_string());
        }
    }

    #[test]
    fn balancer_durations() {
        let settings = BalancerSettings {
            health_check_interval_ms: 1_500,
            ..BalancerSettings::default()
        };
        assert_eq!(settings.health_check_interval(), Duration::from_millis(1_500));
        assert_eq!(settings.max_response_time(), Duration::from_secs(5));
        assert_eq!(settings.sticky_ttl(), Duration::from_secs(3_600));
    }

    #[test]
    fn pool_defaults() {
        let pool = PoolSettings::default();
        assert!(!pool.enabled);
        assert_eq!(pool.initial_instances, 2);
        assert_eq!(pool.max_connections_per_instance, 1000);
        assert_eq!(pool.health_check_interval(), Duration::from_secs(15));
    }
}

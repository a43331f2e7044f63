//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may be partial: missing fields get their default value.

mod balancing;
mod server;

pub use balancing::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "balancer": { "strategy": "least-connections", "stickySessions": true },
///   "pool": { "enabled": true, "initialInstances": 4 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Load balancer settings.
    pub balancer: BalancerSettings,
    /// Connection pool settings.
    pub pool: PoolSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl FanoutSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(self.balancer.max_load > 0.0 && self.balancer.max_load <= 1.0) {
            return Err(SettingsError::InvalidValue(format!(
                "balancer.maxLoad must be in (0, 1], got {}",
                self.balancer.max_load
            )));
        }
        if self.balancer.health_check_interval_ms == 0 || self.pool.health_check_interval_ms == 0
        {
            return Err(SettingsError::InvalidValue(
                "health check intervals must be non-zero".into(),
            ));
        }
        if self.balancer.rebalance_interval_ms == 0 || self.pool.rebalance_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "rebalance intervals must be non-zero".into(),
            ));
        }
        // Idle pooled nodes are only refreshed by the pool health monitor;
        // the balancer marks a node stale after two of its own intervals.
        if self.pool.enabled
            && self.pool.health_check_interval_ms > self.balancer.health_check_interval_ms
        {
            return Err(SettingsError::InvalidValue(format!(
                "pool.healthCheckIntervalMs ({}) must not exceed balancer.healthCheckIntervalMs ({})",
                self.pool.health_check_interval_ms, self.balancer.health_check_interval_ms
            )));
        }
        if self.balancer.sticky_sessions
            && (self.balancer.sticky_ttl_ms == 0 || self.balancer.sticky_max_entries == 0)
        {
            return Err(SettingsError::InvalidValue(
                "balancer.stickyTtlMs and balancer.stickyMaxEntries must be non-zero".into(),
            ));
        }
        if self.server.stream_idle_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.streamIdleTimeoutMs must be non-zero".into(),
            ));
        }
        if self.pool.max_instances == 0 {
            return Err(SettingsError::InvalidValue(
                "pool.maxInstances must be at least 1".into(),
            ));
        }
        if self.pool.initial_instances > self.pool.max_instances {
            return Err(SettingsError::InvalidValue(format!(
                "pool.initialInstances ({}) exceeds pool.maxInstances ({})",
                self.pool.initial_instances, self.pool.max_instances
            )));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` takes precedence).
    pub level: String,
    /// `"compact"` or `"json"`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

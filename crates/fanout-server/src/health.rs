//! `/health` endpoint.

use std::time::Instant;

use fanout_pool::PoolHealth;
use serde::Serialize;

use crate::service::ServiceMode;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when a pool has no healthy instance.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Single instance or pool.
    pub mode: ServiceMode,
    /// Current WebSocket connection count across local hubs.
    pub connections: usize,
    /// Open message streams.
    pub active_streams: usize,
    /// Pool snapshot in pooled mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolHealth>,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    mode: ServiceMode,
    connections: usize,
    active_streams: usize,
    pool: Option<PoolHealth>,
) -> HealthResponse {
    let degraded = pool
        .as_ref()
        .is_some_and(|p| p.total_instances == 0 || p.healthy_instances == 0);
    HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        mode,
        connections,
        active_streams,
        pool,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_balancer::LoadBalancer;
    use fanout_pool::ConnectionPool;
    use fanout_settings::{BalancerSettings, PoolSettings};
    use std::sync::Arc;

    fn empty_pool_health() -> PoolHealth {
        ConnectionPool::new(
            PoolSettings::default(),
            Arc::new(LoadBalancer::new(BalancerSettings::default())),
        )
        .get_pool_health()
    }

    #[test]
    fn single_mode_is_ok() {
        let resp = health_check(Instant::now(), ServiceMode::Single, 3, 1, None);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.connections, 3);
        assert_eq!(resp.active_streams, 1);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, ServiceMode::Single, 0, 0, None);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn empty_pool_is_degraded() {
        let resp = health_check(
            Instant::now(),
            ServiceMode::Pooled,
            0,
            0,
            Some(empty_pool_health()),
        );
        assert_eq!(resp.status, "degraded");
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), ServiceMode::Single, 2, 0, None);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["mode"], "single");
        assert_eq!(parsed["connections"], 2);
        assert!(parsed["uptime_secs"].is_number());
        assert!(parsed.get("pool").is_none());
    }
}

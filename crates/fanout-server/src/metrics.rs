//! Prometheus exporter wiring and the metric names recorded by this crate
//! and by `fanout-pool`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder and return its render handle.
///
/// Call once, before anything records. A second install panics.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("metrics recorder already installed");
    info!("prometheus recorder installed");
    handle
}

/// Prometheus text exposition for `/metrics`.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// ─── WebSocket sessions ──────────────────────────────────────────────────────

/// Sessions opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "fanout_ws_connections_total";
/// Sessions closed for any reason (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "fanout_ws_disconnections_total";
/// Sessions currently open (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "fanout_ws_connections_active";
/// Session lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "fanout_ws_connection_duration_seconds";
/// Frames dropped on a full or closed client queue (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "fanout_ws_dropped_frames_total";
/// Clients evicted for exceeding the drop limit (counter).
pub const WS_SLOW_CLIENT_DISCONNECTS_TOTAL: &str = "fanout_ws_slow_client_evictions_total";
/// Clients closed after staying silent past the heartbeat timeout (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "fanout_ws_heartbeat_timeouts_total";

// ─── Service and pool ────────────────────────────────────────────────────────

/// Service broadcasts issued (counter, labels: scope).
pub const SERVICE_BROADCASTS_TOTAL: &str = "fanout_service_broadcasts_total";
/// Event-bridge events published (counter).
pub const BRIDGE_EVENTS_TOTAL: &str = "fanout_bridge_events_total";
/// Open message streams (gauge).
pub const MESSAGE_STREAMS_ACTIVE: &str = "fanout_message_streams_active";
/// Instance fan-out failures (counter, labels: operation).
pub const POOL_BROADCAST_FAILURES_TOTAL: &str = "fanout_pool_broadcast_failures_total";
/// Connection-count corrections made by the instance probe (counter).
pub const POOL_COUNT_DRIFT_TOTAL: &str = "fanout_pool_count_drift_total";
/// Attached instances (gauge).
pub const POOL_INSTANCES: &str = "fanout_pool_instances";
/// Instances receiving broadcasts (gauge).
pub const POOL_HEALTHY_INSTANCES: &str = "fanout_pool_healthy_instances";
/// Tracked connections across the pool (gauge).
pub const POOL_CONNECTIONS: &str = "fanout_pool_connections";
/// Instances above the load high watermark (gauge).
pub const POOL_OVERLOADED_INSTANCES: &str = "fanout_pool_overloaded_instances";
/// Instances below the load low watermark (gauge).
pub const POOL_UNDERLOADED_INSTANCES: &str = "fanout_pool_underloaded_instances";

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{counter, gauge};

    #[test]
    fn render_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!(WS_CONNECTIONS_TOTAL).increment(2);
            gauge!(POOL_INSTANCES).set(3.0);
        });
        let text = render(&handle);
        assert!(text.contains("fanout_ws_connections_total 2"));
        assert!(text.contains("fanout_pool_instances 3"));
    }

    #[test]
    fn names_are_prometheus_safe() {
        for name in [
            WS_CONNECTIONS_TOTAL,
            WS_BROADCAST_DROPS_TOTAL,
            SERVICE_BROADCASTS_TOTAL,
            POOL_BROADCAST_FAILURES_TOTAL,
            POOL_UNDERLOADED_INSTANCES,
        ] {
            assert!(name.starts_with("fanout_"));
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}

//! `FanoutServer`: Axum HTTP + WebSocket server over the connection service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use fanout_balancer::{LoadBalancer, SelectionRequest};
use fanout_core::{ConnectionId, ConnectionIdentity, NodeId, RealtimeInstance, UserId};
use fanout_pool::{ConnectionPool, ServerOptions};
use fanout_settings::FanoutSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::errors::{FanoutError, ServiceError};
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::service::{ConnectionService, ServiceMode};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{Hub, SessionSettings, run_ws_session};

/// Header carrying the upstream-assigned connection handle.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";
/// Header carrying the upstream-validated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Local hubs by pool node.
#[derive(Default)]
struct HubDirectory {
    single: Option<Arc<Hub>>,
    pooled: DashMap<NodeId, Arc<Hub>>,
}

impl HubDirectory {
    fn resolve(&self, node_id: Option<&NodeId>) -> Option<Arc<Hub>> {
        match node_id {
            Some(id) => self.pooled.get(id).map(|hub| Arc::clone(&hub)),
            None => self.single.clone(),
        }
    }

    fn connection_count(&self) -> usize {
        let pooled: usize = self.pooled.iter().map(|hub| hub.connection_count()).sum();
        pooled + self.single.as_ref().map_or(0, |hub| hub.connection_count())
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection service facade.
    pub service: Arc<ConnectionService>,
    hubs: Arc<HubDirectory>,
    /// Per-session heartbeat and buffer settings.
    pub session: SessionSettings,
    /// Largest accepted client frame.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
}

/// The fanout server: hubs, service, HTTP surface.
pub struct FanoutServer {
    settings: FanoutSettings,
    service: Arc<ConnectionService>,
    hubs: Arc<HubDirectory>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics_handle: PrometheusHandle,
    start_time: Instant,
}

impl FanoutServer {
    /// Build the server from settings.
    ///
    /// With `pool.enabled` a pool of `pool.initial_instances` hubs is created
    /// behind a load balancer; otherwise a single hub serves everything.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        settings: FanoutSettings,
        metrics_handle: PrometheusHandle,
    ) -> Result<Self, FanoutError> {
        let max_dropped = settings.server.max_dropped_messages;
        let (service, hubs) = if settings.pool.enabled {
            let balancer = Arc::new(LoadBalancer::new(settings.balancer.clone()));
            let pool = Arc::new(ConnectionPool::new(settings.pool.clone(), balancer));
            let hubs = HubDirectory::default();
            for _ in 0..settings.pool.initial_instances {
                let hub = Arc::new(Hub::new(max_dropped));
                let instance: Arc<dyn RealtimeInstance> = hub.clone();
                let id = pool.add_server(instance, ServerOptions::default())?;
                let _ = hubs.pooled.insert(id, hub);
            }
            (ConnectionService::pooled(pool), hubs)
        } else {
            let hub = Arc::new(Hub::new(max_dropped));
            let instance: Arc<dyn RealtimeInstance> = hub.clone();
            let hubs = HubDirectory {
                single: Some(hub),
                ..HubDirectory::default()
            };
            (ConnectionService::single(instance), hubs)
        };

        let service = service.with_stream_idle_timeout(settings.server.stream_idle_timeout());
        Ok(Self {
            settings,
            service: Arc::new(service),
            hubs: Arc::new(hubs),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics_handle,
            start_time: Instant::now(),
        })
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            service: Arc::clone(&self.service),
            hubs: Arc::clone(&self.hubs),
            session: SessionSettings::from(&self.settings.server),
            max_message_size: self.settings.server.max_message_size,
            start_time: self.start_time,
            metrics: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Start background tasks (presence tracking or pool monitoring). They
    /// stop when shutdown is initiated.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.service.start(&self.shutdown.token())
    }

    /// Bind the configured address and serve until shutdown is initiated.
    /// Returns the bound address (useful with port 0) and the server task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), FanoutError> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(%error, "server terminated");
            }
        });

        info!(%local_addr, mode = ?self.service.mode(), "fanout server listening");
        Ok((local_addr, handle))
    }

    /// Attach a new hub to the pool.
    pub fn add_hub(&self, options: ServerOptions) -> Result<NodeId, FanoutError> {
        let pool = self.service.pool().ok_or(ServiceError::PoolDisabled {
            operation: "add_hub",
        })?;
        let hub = Arc::new(Hub::new(self.settings.server.max_dropped_messages));
        let instance: Arc<dyn RealtimeInstance> = hub.clone();
        let id = pool.add_server(instance, options)?;
        let _ = self.hubs.pooled.insert(id.clone(), hub);
        Ok(id)
    }

    /// Detach a hub from the pool, moving its clients off. Returns `false`
    /// for an unknown id or in single mode.
    pub async fn remove_hub(&self, id: &NodeId) -> bool {
        let Some(pool) = self.service.pool() else {
            warn!("remove_hub: pooling is disabled");
            return false;
        };
        let removed = pool.remove_server(id).await;
        let _ = self.hubs.pooled.remove(id);
        removed
    }

    /// Initiate shutdown, close every hub and wait for `handles`.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.trigger();
        self.service.shutdown().await;
        let report = self.shutdown.drain(handles).await;
        info!(finished = report.finished, aborted = report.aborted, "fanout server stopped");
    }

    /// The connection service.
    pub fn service(&self) -> &Arc<ConnectionService> {
        &self.service
    }

    /// Local hub for a pool node (`None` selects the single hub).
    pub fn hub(&self, node_id: Option<&NodeId>) -> Option<Arc<Hub>> {
        self.hubs.resolve(node_id)
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the settings the server was built with.
    pub fn settings(&self) -> &FanoutSettings {
        &self.settings
    }
}

/// Identity attached by the upstream authenticator. A missing connection
/// id gets a fresh one.
pub fn identity_from_headers(headers: &HeaderMap) -> ConnectionIdentity {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    ConnectionIdentity {
        connection_id: read(CONNECTION_ID_HEADER).map_or_else(ConnectionId::new, ConnectionId::from),
        user_id: read(USER_ID_HEADER).map(UserId::from),
    }
}

/// Routing hints accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Client session for sticky placement.
    pub session_id: Option<String>,
    /// Explicit hash key for hash-based placement.
    pub hash_key: Option<String>,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool = state.service.pool().map(|p| p.get_pool_health());
    Json(health::health_check(
        state.start_time,
        state.service.mode(),
        state.hubs.connection_count(),
        state.service.streams().len(),
        pool,
    ))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.service.pool() {
        Some(pool) => Json(pool.balancer().stats()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "balancer statistics are only available in pooled mode",
                "mode": ServiceMode::Single,
            })),
        )
            .into_response(),
    }
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&state.metrics),
    )
}

/// GET /ws: upgrade onto the optimal instance.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let identity = identity_from_headers(&headers);
    let request = SelectionRequest {
        session_id: query.session_id,
        hash_key: query.hash_key,
        user_id: identity.user_id.clone(),
    };

    let Some(selected) = state.service.get_optimal_server(Some(&request)) else {
        warn!(connection_id = %identity.connection_id, "no healthy instance for new connection");
        return (StatusCode::SERVICE_UNAVAILABLE, "no healthy instance available").into_response();
    };
    let Some(hub) = state.hubs.resolve(selected.node_id.as_ref()) else {
        error!(node_id = ?selected.node_id, "selected instance has no local hub");
        return (StatusCode::SERVICE_UNAVAILABLE, "selected instance unavailable").into_response();
    };

    let session = state.session;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, identity, hub, selected.node_id, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn handle() -> PrometheusHandle {
        PrometheusBuilder::new().build_recorder().handle()
    }

    fn single_server() -> FanoutServer {
        FanoutServer::new(FanoutSettings::default(), handle()).unwrap()
    }

    fn pooled_server(instances: usize) -> FanoutServer {
        let mut settings = FanoutSettings::default();
        settings.pool.enabled = true;
        settings.pool.initial_instances = instances;
        FanoutServer::new(settings, handle()).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_in_single_mode() {
        let server = single_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "single");
        assert_eq!(body["connections"], 0);
        assert!(body.get("pool").is_none());
    }

    #[tokio::test]
    async fn health_in_pooled_mode_includes_pool() {
        let server = pooled_server(2);
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "pooled");
        assert_eq!(body["pool"]["totalInstances"], 2);
        assert_eq!(body["pool"]["healthyInstances"], 2);
    }

    #[tokio::test]
    async fn stats_not_found_in_single_mode() {
        let server = single_server();
        let (status, body) = get_json(server.router(), "/stats").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn stats_in_pooled_mode() {
        let server = pooled_server(3);
        let (status, body) = get_json(server.router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalNodes"], 3);
        assert_eq!(body["strategy"], "round-robin");
    }

    #[tokio::test]
    async fn metrics_endpoint_is_text() {
        let server = single_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = single_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = single_server();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_and_remove_hub() {
        let server = pooled_server(1);
        let id = server.add_hub(ServerOptions::weighted(2.0)).unwrap();
        assert!(server.hub(Some(&id)).is_some());
        assert_eq!(server.service().pool().unwrap().len(), 2);

        assert!(server.remove_hub(&id).await);
        assert!(server.hub(Some(&id)).is_none());
        assert!(!server.remove_hub(&id).await);
    }

    #[tokio::test]
    async fn add_hub_rejected_in_single_mode() {
        let server = single_server();
        assert_matches!(
            server.add_hub(ServerOptions::default()),
            Err(FanoutError::Service(ServiceError::PoolDisabled { .. }))
        );
        assert!(server.hub(None).is_some());
    }

    #[tokio::test]
    async fn pool_limit_surfaces_as_error() {
        let mut settings = FanoutSettings::default();
        settings.pool.enabled = true;
        settings.pool.initial_instances = 1;
        settings.pool.max_instances = 1;
        let server = FanoutServer::new(settings, handle()).unwrap();
        assert_matches!(
            server.add_hub(ServerOptions::default()),
            Err(FanoutError::Pool(_))
        );
    }

    #[test]
    fn identity_from_upstream_headers() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONNECTION_ID_HEADER, "conn-1".parse().unwrap());
        let _ = headers.insert(USER_ID_HEADER, " alice ".parse().unwrap());
        let identity = identity_from_headers(&headers);
        assert_eq!(identity.connection_id.as_str(), "conn-1");
        assert_eq!(identity.user_id.unwrap().as_str(), "alice");
    }

    #[test]
    fn identity_defaults_to_fresh_anonymous() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(USER_ID_HEADER, "".parse().unwrap());
        let identity = identity_from_headers(&headers);
        assert!(!identity.connection_id.is_empty());
        assert!(identity.user_id.is_none());
    }

    #[tokio::test]
    async fn shutdown_propagates_to_coordinator() {
        let server = single_server();
        let handles = server.start();
        assert!(!server.shutdown().is_triggered());
        server.drain(handles).await;
        assert!(server.shutdown().is_triggered());
        assert!(server.hub(None).unwrap().is_closed());
    }
}

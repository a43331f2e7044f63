//! `ConnectionService`: the facade application code talks to.
//!
//! The same surface works over one instance or a whole pool. Operations
//! that need a global view of rooms or presence only work in single mode:
//! room APIs return [`ServiceError::UnsupportedInPooledMode`], presence
//! queries return empty results and [`ConnectionService::presence_available`]
//! reports `false`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fanout_balancer::SelectionRequest;
use fanout_core::errors::Result as TransportResult;
use fanout_core::{
    ConnectionId, ConnectionIdentity, ConnectionLifecycle, NodeId, RealtimeEvent,
    RealtimeInstance, RoomId, TransportError, UserId,
};
use fanout_pool::{BroadcastReport, ConnectionPool};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, ServiceError};
use crate::event_bridge::{EventBridge, EventSubscription, EventTarget};
use crate::metrics::SERVICE_BROADCASTS_TOTAL;
use crate::streams::{StreamRegistry, StreamSummary};

/// Default idle limit for message streams.
const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deployment shape behind the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// One instance; rooms and presence are answered locally.
    Single,
    /// Several instances behind the load balancer.
    Pooled,
}

enum Backend {
    Single(Arc<dyn RealtimeInstance>),
    Pooled(Arc<ConnectionPool>),
}

/// Where a new client should connect.
#[derive(Clone)]
pub struct SelectedServer {
    /// Pool node id; `None` in single mode.
    pub node_id: Option<NodeId>,
    /// The chosen instance.
    pub instance: Arc<dyn RealtimeInstance>,
}

/// Uniform real-time surface over one instance or a pool.
pub struct ConnectionService {
    backend: Backend,
    users: DashMap<UserId, HashSet<ConnectionId>>,
    connection_users: DashMap<ConnectionId, UserId>,
    bridge: EventBridge,
    streams: StreamRegistry,
    stream_idle_timeout: Duration,
}

impl ConnectionService {
    /// Service over a single instance.
    pub fn single(instance: Arc<dyn RealtimeInstance>) -> Self {
        Self::with_backend(Backend::Single(instance))
    }

    /// Service over a pool.
    pub fn pooled(pool: Arc<ConnectionPool>) -> Self {
        Self::with_backend(Backend::Pooled(pool))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            users: DashMap::new(),
            connection_users: DashMap::new(),
            bridge: EventBridge::default(),
            streams: StreamRegistry::new(),
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    /// End message streams that go this long without a chunk.
    #[must_use]
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Which deployment shape this is.
    pub fn mode(&self) -> ServiceMode {
        match self.backend {
            Backend::Single(_) => ServiceMode::Single,
            Backend::Pooled(_) => ServiceMode::Pooled,
        }
    }

    /// The pool, in pooled mode.
    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        match &self.backend {
            Backend::Pooled(pool) => Some(pool),
            Backend::Single(_) => None,
        }
    }

    /// Open message streams.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Start background work: the presence tracker in single mode, the
    /// pool's balancer and monitors in pooled mode, and the idle-stream
    /// sweeper in both. Everything stops when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = match &self.backend {
            Backend::Single(instance) => {
                let lifecycle = instance.lifecycle();
                vec![tokio::spawn(track_presence(
                    Arc::clone(self),
                    lifecycle,
                    cancel.clone(),
                ))]
            }
            Backend::Pooled(pool) => pool.start(cancel),
        };
        handles.push(tokio::spawn(sweep_idle_streams(
            Arc::clone(self),
            cancel.clone(),
        )));
        handles
    }

    /// Shut down the instance or every pooled instance.
    pub async fn shutdown(&self) {
        match &self.backend {
            Backend::Single(instance) => instance.shutdown().await,
            Backend::Pooled(pool) => pool.shutdown().await,
        }
        self.users.clear();
        self.connection_users.clear();
    }

    // ─── Placement ───────────────────────────────────────────────────────

    /// Instance a new client should connect to. `None` when no pooled
    /// instance is healthy.
    pub fn get_optimal_server(&self, request: Option<&SelectionRequest>) -> Option<SelectedServer> {
        match &self.backend {
            Backend::Single(instance) => Some(SelectedServer {
                node_id: None,
                instance: Arc::clone(instance),
            }),
            Backend::Pooled(pool) => pool.get_optimal_server(request).map(|pooled| SelectedServer {
                node_id: Some(pooled.id().clone()),
                instance: Arc::clone(pooled.instance()),
            }),
        }
    }

    // ─── Broadcast ───────────────────────────────────────────────────────

    /// Deliver an event to a conversation's room.
    ///
    /// `exclude` skips one connection in single mode; pooled instances
    /// cannot resolve a foreign handle, so it is ignored there.
    pub async fn broadcast_to_conversation(
        &self,
        room: &RoomId,
        event: &RealtimeEvent,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        counter!(SERVICE_BROADCASTS_TOTAL, "scope" => "room").increment(1);
        let report = match &self.backend {
            Backend::Single(instance) => {
                single_report(instance.emit_to_room(room, event, exclude).await, "room")
            }
            Backend::Pooled(pool) => {
                if let Some(excluded) = exclude {
                    debug!(%excluded, "exclude ignored in pooled mode");
                }
                pool.broadcast_to_room(room, event).await
            }
        };
        let _ = self
            .bridge
            .publish(EventTarget::Room(room.clone()), event.clone());
        report
    }

    /// Deliver an event to every connection of a user.
    pub async fn broadcast_to_user(&self, user_id: &UserId, event: &RealtimeEvent) -> BroadcastReport {
        counter!(SERVICE_BROADCASTS_TOTAL, "scope" => "user").increment(1);
        let report = match &self.backend {
            Backend::Single(instance) => {
                let targets = self.user_connections(user_id);
                single_report(deliver_each(instance.as_ref(), &targets, event).await, "user")
            }
            Backend::Pooled(pool) => pool.broadcast_to_user(user_id, event).await,
        };
        let _ = self
            .bridge
            .publish(EventTarget::User(user_id.clone()), event.clone());
        report
    }

    /// Deliver an event to every connection.
    pub async fn broadcast_to_all(&self, event: &RealtimeEvent) -> BroadcastReport {
        counter!(SERVICE_BROADCASTS_TOTAL, "scope" => "all").increment(1);
        let report = match &self.backend {
            Backend::Single(instance) => single_report(instance.emit_to_all(event).await, "all"),
            Backend::Pooled(pool) => pool.broadcast_to_all(event).await,
        };
        let _ = self.bridge.publish(EventTarget::All, event.clone());
        report
    }

    // ─── Rooms (single mode) ─────────────────────────────────────────────

    fn single_instance(&self, operation: &'static str) -> Result<&Arc<dyn RealtimeInstance>> {
        match &self.backend {
            Backend::Single(instance) => Ok(instance),
            Backend::Pooled(_) => Err(ServiceError::UnsupportedInPooledMode { operation }),
        }
    }

    /// Add a connection to a room.
    pub async fn join_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        self.single_instance("join_room")?
            .join_room(connection_id, room)
            .await?;
        Ok(())
    }

    /// Remove a connection from a room.
    pub async fn leave_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        self.single_instance("leave_room")?
            .leave_room(connection_id, room)
            .await?;
        Ok(())
    }

    /// Connections in a room.
    pub async fn get_room_members(&self, room: &RoomId) -> Result<Vec<ConnectionId>> {
        Ok(self
            .single_instance("get_room_members")?
            .room_members(room)
            .await?)
    }

    // ─── Presence (single mode) ──────────────────────────────────────────

    /// Whether presence queries reflect every connection.
    pub fn presence_available(&self) -> bool {
        self.mode() == ServiceMode::Single
    }

    /// Users with at least one connection, sorted.
    pub fn get_connected_users(&self) -> Vec<UserId> {
        if !self.presence_available() {
            return Vec::new();
        }
        let mut users: Vec<UserId> = self.users.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Number of connections a user holds.
    pub fn get_user_socket_count(&self, user_id: &UserId) -> usize {
        if !self.presence_available() {
            return 0;
        }
        self.users.get(user_id).map_or(0, |set| set.len())
    }

    /// Whether a user holds any connection.
    pub fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.get_user_socket_count(user_id) > 0
    }

    fn user_connections(&self, user_id: &UserId) -> Vec<ConnectionId> {
        let mut targets: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    /// Record a connection's user. Ignored in pooled mode and for
    /// anonymous connections.
    pub fn register_connection(&self, identity: &ConnectionIdentity) {
        if !self.presence_available() {
            debug!(connection_id = %identity.connection_id, "presence not tracked in pooled mode");
            return;
        }
        let Some(user_id) = identity.user_id.clone() else {
            return;
        };
        let connection_id = identity.connection_id.clone();

        if let Some(previous) = self
            .connection_users
            .insert(connection_id.clone(), user_id.clone())
        {
            if previous == user_id {
                return;
            }
            warn!(%connection_id, %previous, %user_id, "connection changed user");
            self.detach_user(&previous, &connection_id);
        }

        let first = {
            let mut set = self.users.entry(user_id.clone()).or_default();
            let _ = set.insert(connection_id);
            set.len() == 1
        };
        if first {
            debug!(%user_id, "user online");
            let _ = self.bridge.publish(
                EventTarget::All,
                RealtimeEvent::Presence {
                    user_id,
                    online: true,
                },
            );
        }
    }

    /// Forget a connection. Unknown ids are a no-op.
    pub fn unregister_connection(&self, connection_id: &ConnectionId) {
        if let Some((_, user_id)) = self.connection_users.remove(connection_id) {
            self.detach_user(&user_id, connection_id);
        }
    }

    fn detach_user(&self, user_id: &UserId, connection_id: &ConnectionId) {
        let now_empty = match self.users.get_mut(user_id) {
            Some(mut set) => {
                let _ = set.remove(connection_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty && self.users.remove_if(user_id, |_, set| set.is_empty()).is_some() {
            debug!(%user_id, "user offline");
            let _ = self.bridge.publish(
                EventTarget::All,
                RealtimeEvent::Presence {
                    user_id: user_id.clone(),
                    online: false,
                },
            );
        }
    }

    /// Rebuild the user maps from the instance's live connections.
    pub async fn resync_presence(&self) -> Result<usize> {
        let connections = self.single_instance("resync_presence")?.connections().await?;
        self.users.clear();
        self.connection_users.clear();
        for identity in &connections {
            self.register_connection(identity);
        }
        info!(connections = connections.len(), users = self.users.len(), "presence resynced");
        Ok(connections.len())
    }

    // ─── Event bridge ────────────────────────────────────────────────────

    /// Publish an event to bridge subscribers only.
    pub fn emit_event(&self, target: EventTarget, event: RealtimeEvent) -> usize {
        self.bridge.publish(target, event)
    }

    /// Subscribe to every broadcast and emitted event.
    pub fn subscribe_to_events(&self) -> EventSubscription {
        self.bridge.subscribe()
    }

    /// The bridge itself.
    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    // ─── Message streams ─────────────────────────────────────────────────

    /// Open a streamed message and announce it to the conversation.
    pub async fn start_message_stream(
        &self,
        conversation_id: &RoomId,
        message_id: &str,
    ) -> BroadcastReport {
        let started_at = self.streams.start(conversation_id, message_id);
        let event = RealtimeEvent::StreamStart {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_owned(),
            started_at,
        };
        self.broadcast_to_conversation(conversation_id, &event, None)
            .await
    }

    /// Append a chunk and broadcast it. A final chunk ends the stream.
    /// Returns `false` (and broadcasts nothing) for an unknown stream.
    pub async fn stream_message_content(
        &self,
        conversation_id: &RoomId,
        message_id: &str,
        chunk: &str,
        is_complete: bool,
    ) -> bool {
        if self
            .streams
            .append(conversation_id, message_id, chunk)
            .is_none()
        {
            return false;
        }
        let event = RealtimeEvent::MessageChunk {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_owned(),
            chunk: chunk.to_owned(),
            is_complete,
        };
        let _ = self
            .broadcast_to_conversation(conversation_id, &event, None)
            .await;
        if is_complete {
            let _ = self.end_message_stream(conversation_id, message_id).await;
        }
        true
    }

    /// End every stream idle past the configured limit and tell its
    /// conversation it will not complete. Returns how many were ended.
    pub async fn expire_idle_streams(&self) -> usize {
        let expired = self.streams.expire_idle(self.stream_idle_timeout);
        for summary in &expired {
            let event = RealtimeEvent::StreamEnd {
                conversation_id: summary.conversation_id.clone(),
                message_id: summary.message_id.clone(),
                duration_ms: summary.duration.as_millis() as u64,
                total_chunks: summary.total_chunks,
                is_complete: false,
            };
            let _ = self
                .broadcast_to_conversation(&summary.conversation_id, &event, None)
                .await;
        }
        expired.len()
    }

    /// Close a stream and broadcast its completion. `None` for an unknown
    /// stream.
    pub async fn end_message_stream(
        &self,
        conversation_id: &RoomId,
        message_id: &str,
    ) -> Option<StreamSummary> {
        let summary = self.streams.finish(conversation_id, message_id)?;
        let event = RealtimeEvent::StreamEnd {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_owned(),
            duration_ms: summary.duration.as_millis() as u64,
            total_chunks: summary.total_chunks,
            is_complete: true,
        };
        let _ = self
            .broadcast_to_conversation(conversation_id, &event, None)
            .await;
        debug!(
            %conversation_id,
            message_id,
            chunks = summary.total_chunks,
            duration_ms = summary.duration.as_millis() as u64,
            "message stream ended"
        );
        Some(summary)
    }
}

/// Send to each connection individually; per-connection failures are
/// logged, a closed instance fails the whole operation.
async fn deliver_each(
    instance: &dyn RealtimeInstance,
    targets: &[ConnectionId],
    event: &RealtimeEvent,
) -> TransportResult<usize> {
    let mut delivered = 0;
    for connection_id in targets {
        match instance.emit_to_connection(connection_id, event).await {
            Ok(()) => delivered += 1,
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(error) => debug!(%connection_id, %error, "user delivery failed"),
        }
    }
    Ok(delivered)
}

fn single_report(outcome: TransportResult<usize>, operation: &'static str) -> BroadcastReport {
    match outcome {
        Ok(recipients) => BroadcastReport {
            attempted: 1,
            succeeded: 1,
            recipients,
            ..BroadcastReport::default()
        },
        Err(error) => {
            warn!(operation, %error, "broadcast failed");
            BroadcastReport {
                attempted: 1,
                failed: 1,
                ..BroadcastReport::default()
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "stream_sweeper")]
async fn sweep_idle_streams(service: Arc<ConnectionService>, cancel: CancellationToken) {
    let mut ticker = time::interval(service.stream_idle_timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = service.expire_idle_streams().await;
                if expired > 0 {
                    debug!(expired, "idle message streams ended");
                }
            }
            () = cancel.cancelled() => {
                debug!("stream sweeper stopped");
                return;
            }
        }
    }
}

/// Keep the user maps in step with the instance's connections.
#[tracing::instrument(skip_all, name = "presence_tracker")]
async fn track_presence(
    service: Arc<ConnectionService>,
    mut lifecycle: broadcast::Receiver<ConnectionLifecycle>,
    cancel: CancellationToken,
) {
    // Pick up connections opened before the subscription.
    if let Err(error) = service.resync_presence().await {
        warn!(%error, "initial presence sync failed");
    }

    loop {
        let event = tokio::select! {
            event = lifecycle.recv() => event,
            () = cancel.cancelled() => {
                debug!("presence tracker stopped");
                return;
            }
        };
        match event {
            Ok(ConnectionLifecycle::Opened(identity)) => service.register_connection(&identity),
            Ok(ConnectionLifecycle::Closed(identity)) => {
                service.unregister_connection(&identity.connection_id);
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "lifecycle events lagged, resyncing presence");
                if let Err(error) = service.resync_presence().await {
                    warn!(%error, "presence resync failed");
                }
            }
            Err(RecvError::Closed) => {
                debug!("lifecycle channel closed");
                return;
            }
        }
    }
}

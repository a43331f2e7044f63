//! In-memory `RealtimeInstance` double for pool tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use fanout_core::errors::Result;
use fanout_core::{
    ConnectionId, ConnectionIdentity, ConnectionLifecycle, RealtimeEvent, RealtimeInstance,
    RoomId, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub(crate) struct FakeInstance {
    lifecycle: broadcast::Sender<ConnectionLifecycle>,
    connections: Mutex<Vec<ConnectionIdentity>>,
    rooms: Mutex<HashMap<RoomId, HashSet<ConnectionId>>>,
    /// `(connection, event)` for every delivered event.
    pub delivered: Mutex<Vec<(ConnectionId, RealtimeEvent)>>,
    pub disconnected: Mutex<Vec<ConnectionId>>,
    pub failing: AtomicBool,
    pub shut_down: AtomicBool,
}

impl FakeInstance {
    pub fn new() -> Arc<Self> {
        let (lifecycle, _) = broadcast::channel(64);
        Arc::new(Self {
            lifecycle,
            connections: Mutex::new(Vec::new()),
            rooms: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn failing() -> Arc<Self> {
        let fake = Self::new();
        fake.failing.store(true, Ordering::Relaxed);
        fake
    }

    /// Attach a connection and announce it.
    pub fn open(&self, connection_id: &str, user_id: Option<&str>) {
        let identity = match user_id {
            Some(user) => ConnectionIdentity::new(connection_id, user),
            None => ConnectionIdentity::anonymous(connection_id),
        };
        self.connections.lock().push(identity.clone());
        let _ = self.lifecycle.send(ConnectionLifecycle::Opened(identity));
    }

    /// Attach a connection without announcing it.
    pub fn open_silently(&self, connection_id: &str) {
        self.connections
            .lock()
            .push(ConnectionIdentity::anonymous(connection_id));
    }

    pub fn close(&self, connection_id: &str) {
        let removed = {
            let mut connections = self.connections.lock();
            let position = connections
                .iter()
                .position(|c| c.connection_id.as_str() == connection_id);
            position.map(|p| connections.remove(p))
        };
        if let Some(identity) = removed {
            let _ = self.lifecycle.send(ConnectionLifecycle::Closed(identity));
        }
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn deliver(&self, targets: Vec<ConnectionId>, event: &RealtimeEvent) -> usize {
        let mut delivered = self.delivered.lock();
        for target in &targets {
            delivered.push((target.clone(), event.clone()));
        }
        targets.len()
    }
}

#[async_trait]
impl RealtimeInstance for FakeInstance {
    fn lifecycle(&self) -> broadcast::Receiver<ConnectionLifecycle> {
        self.lifecycle.subscribe()
    }

    async fn emit_to_all(&self, event: &RealtimeEvent) -> Result<usize> {
        self.check()?;
        let targets = self
            .connections
            .lock()
            .iter()
            .map(|c| c.connection_id.clone())
            .collect();
        Ok(self.deliver(targets, event))
    }

    async fn emit_to_room(
        &self,
        room: &RoomId,
        event: &RealtimeEvent,
        exclude: Option<&ConnectionId>,
    ) -> Result<usize> {
        self.check()?;
        let targets = self
            .rooms
            .lock()
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| Some(*m) != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(self.deliver(targets, event))
    }

    async fn emit_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &RealtimeEvent,
    ) -> Result<()> {
        self.check()?;
        let _ = self.deliver(vec![connection_id.clone()], event);
        Ok(())
    }

    async fn connections(&self) -> Result<Vec<ConnectionIdentity>> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::Enumerate("fake failure".into()));
        }
        Ok(self.connections.lock().clone())
    }

    async fn disconnect(&self, connection_id: &ConnectionId) -> Result<()> {
        self.disconnected.lock().push(connection_id.clone());
        self.close(connection_id.as_str());
        Ok(())
    }

    async fn join_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        let _ = self
            .rooms
            .lock()
            .entry(room.clone())
            .or_default()
            .insert(connection_id.clone());
        Ok(())
    }

    async fn leave_room(&self, connection_id: &ConnectionId, room: &RoomId) -> Result<()> {
        if let Some(members) = self.rooms.lock().get_mut(room) {
            let _ = members.remove(connection_id);
        }
        Ok(())
    }

    async fn room_members(&self, room: &RoomId) -> Result<Vec<ConnectionId>> {
        Ok(self
            .rooms
            .lock()
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
    }
}

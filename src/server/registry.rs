//! Registry of live miner connections.

use crate::core::WorkUnit;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Monotonically assigned session identifier.
pub type SessionId = u64;

/// An event delivered to a connection's task.
#[derive(Debug, Clone)]
pub enum Event {
    /// Dispatch (more) work to the miner
    SendWork,
    /// Announce the current block height
    SendBlock,
    /// Show a message on the miner's console
    Msg(String),
    /// Disconnect the miner, optionally with a reason
    Kick(Option<String>),
    /// A requested work unit became available
    WorkReady(WorkUnit),
}

/// Shared handle describing one miner connection.
///
/// The connection's task owns the transport; everyone else talks to it
/// through this handle and its event channel.
pub struct ConnectionHandle {
    session_id: SessionId,
    peer: SocketAddr,
    connected_at: u64,
    username: RwLock<Option<String>>,
    meta: Mutex<HashMap<String, String>>,
    events: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandle {
    pub fn new(
        session_id: SessionId,
        peer: SocketAddr,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            session_id,
            peer,
            connected_at,
            username: RwLock::new(None),
            meta: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// UNIX timestamp of the TCP accept.
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// The logged-in account name, if any.
    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn set_username(&self, username: &str) {
        *self.username.write() = Some(username.to_string());
    }

    /// Snapshot of the connection's metadata map.
    pub fn meta(&self) -> HashMap<String, String> {
        self.meta.lock().clone()
    }

    pub fn set_meta(&self, var: &str, value: &str) {
        self.meta.lock().insert(var.to_string(), value.to_string());
    }

    /// Deliver an event to the connection's task; false when it is gone.
    pub fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }
}

/// The set of live connections, keyed by session id.
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<DashMap<SessionId, Arc<ConnectionHandle>>>,
}

impl Registry {
    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.session_id(), handle);
    }

    pub fn remove(&self, session_id: SessionId) {
        self.connections.remove(&session_id);
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every live connection handle.
    pub fn list(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Every logged-in connection using the given account name, matched
    /// case-sensitively.
    pub fn list_account(&self, username: &str) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().username().as_deref() == Some(username))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Deliver an event to every live connection.
    pub fn broadcast(&self, event: Event) {
        for entry in self.connections.iter() {
            entry.value().send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(session_id: SessionId) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = "127.0.0.1:4000".parse().unwrap();
        (Arc::new(ConnectionHandle::new(session_id, peer, tx)), rx)
    }

    #[test]
    fn test_account_listing_is_case_sensitive() {
        let registry = Registry::default();
        let (a, _rx_a) = handle(1);
        let (b, _rx_b) = handle(2);
        let (c, _rx_c) = handle(3);
        a.set_username("Rig");
        b.set_username("rig");
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        assert_eq!(registry.list_account("Rig").len(), 1);
        assert_eq!(registry.list_account("rig").len(), 1);
        assert_eq!(registry.list_account("RIG").len(), 0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_broadcast_reaches_every_connection() {
        let registry = Registry::default();
        let (a, mut rx_a) = handle(1);
        let (b, mut rx_b) = handle(2);
        registry.insert(a);
        registry.insert(b);

        registry.broadcast(Event::SendBlock);
        assert!(matches!(rx_a.try_recv(), Ok(Event::SendBlock)));
        assert!(matches!(rx_b.try_recv(), Ok(Event::SendBlock)));
    }

    #[test]
    fn test_remove_and_get() {
        let registry = Registry::default();
        let (a, _rx) = handle(7);
        registry.insert(a);

        assert!(registry.get(7).is_some());
        registry.remove(7);
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (handle, rx) = handle(1);
        drop(rx);
        assert!(!handle.send(Event::SendWork));
    }
}

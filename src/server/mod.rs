//! The server root: connection registry, listener and config access.

pub mod connection;
pub mod protocol;
pub mod registry;

use crate::error::{Error, Result};
use crate::provider::WorkProvider;
use crate::store::Database;
use registry::{ConnectionHandle, Registry, SessionId};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Default miner-facing listen port.
pub const DEFAULT_PORT: u16 = 8880;

/// Root object owning the lifetime state of the server: the database
/// handle, the work provider and the registry of miner connections.
pub struct Server {
    db: Database,
    registry: Registry,
    provider: Arc<WorkProvider>,
    sessions: AtomicU64,
}

impl Server {
    pub fn new(db: Database) -> Arc<Self> {
        let registry = Registry::default();
        let provider = WorkProvider::new(db.clone(), registry.clone());
        Arc::new(Self {
            db,
            registry,
            provider,
            sessions: AtomicU64::new(0),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<WorkProvider> {
        &self.provider
    }

    /// Hand out the next session id.
    pub fn next_session(&self) -> SessionId {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read a configuration variable from the store.
    pub fn get_config<T: FromStr>(&self, var: &str, default: T) -> T {
        self.db.get_config(var, default)
    }

    /// Write a configuration variable to the store.
    pub fn set_config(&self, var: &str, value: Option<&str>) -> Result<()> {
        self.db.set_config(var, value)
    }

    /// Every logged-in connection for the given account (case-sensitive).
    pub fn list_account_connections(&self, username: &str) -> Vec<Arc<ConnectionHandle>> {
        self.registry.list_account(username)
    }

    /// Find a connection by session id.
    pub fn get_connection(&self, session_id: SessionId) -> Option<Arc<ConnectionHandle>> {
        self.registry.get(session_id)
    }

    /// Bind the miner-facing listener on the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let port = self.get_config::<u16>("server_port", DEFAULT_PORT);
        let ip = self.get_config::<String>("server_ip", String::new());
        let ip = if ip.is_empty() {
            "0.0.0.0".to_string()
        } else {
            ip
        };

        let listener = TcpListener::bind((ip.as_str(), port))
            .await
            .map_err(|e| Error::network(format!("failed to bind {}:{}: {}", ip, port, e)))?;
        info!("listening for miners on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept miner connections on the given listener until the process
    /// exits. Each connection runs in its own task, so a misbehaving miner
    /// only ever takes down itself.
    pub fn spawn_listener(self: &Arc<Self>, listener: TcpListener) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(connection::serve(server, stream, peer));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<Server> {
        let db = Database::in_memory().unwrap();
        db.populate(&[("server_port".into(), "0".into())], "admin", "admin")
            .unwrap();
        Server::new(db)
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let server = server();
        let first = server.next_session();
        let second = server.next_session();
        assert!(second > first);
    }

    #[test]
    fn test_config_delegation() {
        let server = server();
        assert_eq!(server.get_config::<u16>("server_port", 1), 0);
        server.set_config("motd", Some("/etc/motd")).unwrap();
        assert_eq!(
            server.get_config::<String>("motd", String::new()),
            "/etc/motd"
        );
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = server();
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}

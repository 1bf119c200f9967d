//! Host-side relay manager.
//!
//! Holds the single authenticated relay connection of a host run and the
//! reverse tunnels registered over it, one per session.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use protocol::{BridgeError, Result, SessionId};
use tokio::sync::RwLock;

use super::tunnel::{Tunnel, TunnelInfo};
use super::{RelayConnection, RelayConnector, RelayTarget};
use crate::session::SessionManager;

/// Owns the relay connection and every tunnel created over it.
pub struct RelayManager {
    target: RelayTarget,
    bind_address: String,
    connector: Arc<dyn RelayConnector>,
    sessions: Arc<SessionManager>,
    connection: RwLock<Option<Arc<dyn RelayConnection>>>,
    tunnels: DashMap<SessionId, Arc<Tunnel>>,
    pending: DashSet<SessionId>,
}

/// Claim on a session's tunnel slot while the tunnel is being set up.
struct PendingTunnel<'a> {
    pending: &'a DashSet<SessionId>,
    session_id: &'a str,
}

impl Drop for PendingTunnel<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.session_id);
    }
}

impl RelayManager {
    /// Creates a manager for `target`. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        target: RelayTarget,
        bind_address: impl Into<String>,
        connector: Arc<dyn RelayConnector>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            target,
            bind_address: bind_address.into(),
            connector,
            sessions,
            connection: RwLock::new(None),
            tunnels: DashMap::new(),
            pending: DashSet::new(),
        }
    }

    /// The relay this manager talks to.
    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    /// Connects and authenticates once. A live connection is reused.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.write().await;
        if let Some(existing) = connection.as_ref() {
            if !existing.is_closed() {
                return Ok(());
            }
        }
        *connection = Some(self.connector.connect(&self.target).await?);
        Ok(())
    }

    /// Returns whether an open relay connection exists.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    /// Registers a remote listener for `session_id` and forwards its
    /// channels to the session's shell server.
    ///
    /// Overlapping calls for one session are rejected while the first is
    /// still in flight.
    pub async fn create_reverse_tunnel(&self, session_id: &str) -> Result<TunnelInfo> {
        // The slot is claimed before the first await; the tunnel is inserted
        // before the claim is dropped.
        if !self.pending.insert(session_id.to_string()) {
            return Err(BridgeError::tunnel(format!(
                "a tunnel for session {} is already being created",
                session_id
            )));
        }
        let _claim = PendingTunnel {
            pending: &self.pending,
            session_id,
        };
        if self.tunnels.contains_key(session_id) {
            return Err(BridgeError::tunnel(format!("session {} already has a tunnel", session_id)));
        }

        let connection = self
            .connection
            .read()
            .await
            .clone()
            .filter(|connection| !connection.is_closed())
            .ok_or_else(|| BridgeError::connection("not connected to relay server"))?;

        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| BridgeError::session_not_found(session_id))?;
        let relay_port = self.sessions.allocate_relay_port(session_id)?;
        let allocated_here = session.relay_port.is_none();

        let inbound = match connection.request_listener(&self.bind_address, relay_port).await {
            Ok(inbound) => inbound,
            Err(e) => {
                if allocated_here {
                    if let Err(release) = self.sessions.release_relay_port(session_id) {
                        tracing::debug!(session_id, error = %release, "Relay port rollback failed");
                    }
                }
                return Err(match e.kind() {
                    protocol::ErrorKind::Tunnel => e,
                    _ => BridgeError::tunnel_with(format!("cannot listen on relay port {}", relay_port), e),
                });
            }
        };

        let info = TunnelInfo {
            session_id: session_id.to_string(),
            relay_server: self.target.host.clone(),
            relay_port,
            host_port: session.host_port,
            bind_address: self.bind_address.clone(),
        };

        let tunnel = Tunnel::start(info.clone(), connection, inbound);
        self.tunnels.insert(session_id.to_string(), tunnel);

        tracing::info!(
            session_id,
            relay = %self.target.host,
            relay_port,
            host_port = session.host_port,
            "Reverse tunnel established"
        );
        Ok(info)
    }

    /// Stops the tunnel of `session_id`. Unknown ids are ignored.
    pub async fn stop_tunnel(&self, session_id: &str) {
        if let Some((_, tunnel)) = self.tunnels.remove(session_id) {
            tunnel.stop().await;
        }
    }

    /// Description of the tunnel for `session_id`.
    pub fn tunnel_info(&self, session_id: &str) -> Option<TunnelInfo> {
        self.tunnels.get(session_id).map(|tunnel| tunnel.info().clone())
    }

    /// Number of live forwarding pairs of a session's tunnel.
    pub fn tunnel_connection_count(&self, session_id: &str) -> usize {
        self.tunnels
            .get(session_id)
            .map(|tunnel| tunnel.connection_count())
            .unwrap_or(0)
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Stops every tunnel and closes the relay connection. Idempotent.
    pub async fn disconnect(&self) {
        let session_ids: Vec<SessionId> = self.tunnels.iter().map(|entry| entry.key().clone()).collect();
        for session_id in session_ids {
            self.stop_tunnel(&session_id).await;
        }

        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Relay connection close failed");
            }
        }
    }
}

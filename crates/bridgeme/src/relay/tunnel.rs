//! Reverse tunnels.
//!
//! A [`Tunnel`] owns one remote listener and turns every channel arriving
//! on it into a local TCP connection to the session's shell server.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::SessionId;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{InboundChannel, RelayConnection};
use crate::forward;

/// Upper bound on joining forwarding tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Description of an established reverse tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Session the tunnel belongs to.
    pub session_id: SessionId,
    /// Relay server the listener lives on.
    pub relay_server: String,
    /// Port the relay server listens on.
    pub relay_port: u16,
    /// Local shell server port channels are forwarded to.
    pub host_port: u16,
    /// Bind address requested from the relay.
    pub bind_address: String,
}

struct TunnelConnection {
    originator: String,
    cancel: CancellationToken,
}

/// A live remote listener and its forwarding pairs.
pub struct Tunnel {
    info: TunnelInfo,
    relay: Arc<dyn RelayConnection>,
    connections: Arc<DashMap<u64, TunnelConnection>>,
    next_connection_id: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    stopped: AtomicBool,
}

impl Tunnel {
    /// Starts forwarding channels from `inbound` to `info.host_port`.
    pub fn start(
        info: TunnelInfo,
        relay: Arc<dyn RelayConnection>,
        inbound: mpsc::UnboundedReceiver<InboundChannel>,
    ) -> Arc<Self> {
        let tunnel = Arc::new(Self {
            info,
            relay,
            connections: Arc::new(DashMap::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        });

        let accept = Arc::clone(&tunnel);
        tunnel.tasks.spawn(async move { accept.accept_loop(inbound).await });

        tunnel
    }

    /// Tunnel description.
    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// Number of live forwarding pairs.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn accept_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundChannel>) {
        loop {
            let channel = tokio::select! {
                _ = self.cancel.cancelled() => break,
                channel = inbound.recv() => match channel {
                    Some(channel) => channel,
                    None => {
                        tracing::debug!(session_id = %self.info.session_id, "Listener channel closed");
                        break;
                    }
                },
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
            let originator = format!("{}:{}", channel.originator_address, channel.originator_port);
            let cancel = self.cancel.child_token();
            self.connections.insert(
                id,
                TunnelConnection {
                    originator: originator.clone(),
                    cancel: cancel.clone(),
                },
            );

            let connections = Arc::clone(&self.connections);
            let session_id = self.info.session_id.clone();
            let host_port = self.info.host_port;
            self.tasks.spawn(async move {
                forward_channel(channel, host_port, cancel).await;
                if let Some((_, conn)) = connections.remove(&id) {
                    tracing::info!(
                        session_id = %session_id,
                        originator = %conn.originator,
                        "Tunnel connection closed"
                    );
                }
            });
            tracing::info!(session_id = %self.info.session_id, originator = %originator, "Tunnel connection opened");
        }
    }

    /// Cancels the remote listener and ends every forwarding pair.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            session_id = %self.info.session_id,
            relay_port = self.info.relay_port,
            connections = self.connections.len(),
            "Stopping tunnel"
        );

        if let Err(e) = self
            .relay
            .cancel_listener(&self.info.bind_address, self.info.relay_port)
            .await
        {
            tracing::warn!(session_id = %self.info.session_id, error = %e, "Failed to cancel remote listener");
        }

        for entry in self.connections.iter() {
            entry.value().cancel.cancel();
        }
        self.cancel.cancel();
        self.tasks.close();

        if tokio::time::timeout(STOP_TIMEOUT, self.tasks.wait()).await.is_err() {
            tracing::warn!(session_id = %self.info.session_id, "Tunnel tasks did not finish in time");
        }
    }
}

/// Pairs one relay channel with a fresh socket to the shell server.
async fn forward_channel(channel: InboundChannel, host_port: u16, cancel: CancellationToken) {
    let mut stream = channel.stream;
    let socket = tokio::select! {
        _ = cancel.cancelled() => return,
        socket = TcpStream::connect((Ipv4Addr::LOCALHOST, host_port)) => socket,
    };

    match socket {
        Ok(socket) => {
            let _ = socket.set_nodelay(true);
            let stats = forward::bridge(stream, socket, cancel).await;
            tracing::debug!(host_port, to_shell = stats.a_to_b, from_shell = stats.b_to_a, "Tunnel pair finished");
        }
        Err(e) => {
            tracing::warn!(host_port, error = %e, "Cannot reach shell server, closing channel");
            let _ = stream.shutdown().await;
        }
    }
}

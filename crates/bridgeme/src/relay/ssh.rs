//! russh implementation of [`RelayConnection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{BridgeError, Result};
use russh::client::{self, Handle};
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::{Channel, Disconnect};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};

use super::{auth, InboundChannel, RelayConnection, RelayConnector, RelayFuture, RelayStream, RelayTarget};

/// Inbound channel routes keyed by the remote port they arrived on.
type Routes = Arc<DashMap<u32, mpsc::UnboundedSender<InboundChannel>>>;

/// Errors surfaced by the russh event loop.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// SHA-256 fingerprint of a public key, `SHA256:<base64>` without padding.
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Event handler for one relay connection.
pub struct RelayHandler {
    endpoint: String,
    routes: Routes,
}

impl client::Handler for RelayHandler {
    type Error = HandlerError;

    async fn check_server_key(&mut self, key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        // The relay only ever sees opaque forwarded bytes.
        tracing::info!(
            relay = %self.endpoint,
            algorithm = %key.algorithm(),
            fingerprint = %fingerprint(key),
            "Accepting relay host key"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        tracing::debug!(
            connected = %format!("{}:{}", connected_address, connected_port),
            originator = %format!("{}:{}", originator_address, originator_port),
            "Relay opened forwarded channel"
        );

        let Some(route) = self.routes.get(&connected_port).map(|r| r.value().clone()) else {
            tracing::warn!(port = connected_port, "Forwarded channel for unknown port, closing");
            let _ = channel.close().await;
            return Ok(());
        };

        let inbound = InboundChannel {
            stream: Box::new(channel.into_stream()),
            originator_address: originator_address.to_string(),
            originator_port,
        };

        if route.send(inbound).is_err() {
            tracing::debug!(port = connected_port, "Listener gone, dropping forwarded channel");
            self.routes.remove(&connected_port);
        }
        Ok(())
    }
}

/// An authenticated russh client connection.
pub struct SshConnection {
    handle: Mutex<Handle<RelayHandler>>,
    routes: Routes,
    endpoint: String,
    closed: AtomicBool,
}

impl SshConnection {
    /// Connects and authenticates to `target` within its connect timeout.
    pub async fn connect(target: &RelayTarget) -> Result<Self> {
        let endpoint = target.endpoint();
        tracing::info!(relay = %endpoint, "Connecting to relay server");

        match tokio::time::timeout(target.connect_timeout, Self::establish(target, endpoint.clone())).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::connection(format!(
                "timed out after {}s connecting to {}",
                target.connect_timeout.as_secs(),
                endpoint
            ))),
        }
    }

    async fn establish(target: &RelayTarget, endpoint: String) -> Result<Self> {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: target.keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };

        let routes: Routes = Arc::new(DashMap::new());
        let handler = RelayHandler {
            endpoint: endpoint.clone(),
            routes: Arc::clone(&routes),
        };

        let mut handle = client::connect(Arc::new(config), (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| BridgeError::connection_with(format!("cannot reach {}", endpoint), e))?;
        tracing::debug!(relay = %endpoint, "SSH handshake completed");

        if let Err(e) = auth::authenticate(&mut handle, &target.username, target.key_file.as_deref()).await {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(e);
        }

        tracing::info!(relay = %endpoint, "Connected to relay server");
        Ok(Self {
            handle: Mutex::new(handle),
            routes,
            endpoint,
            closed: AtomicBool::new(false),
        })
    }

    /// `user@host:port` of the relay server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RelayConnection for SshConnection {
    fn request_listener<'a>(
        &'a self,
        bind_address: &'a str,
        port: u16,
    ) -> RelayFuture<'a, mpsc::UnboundedReceiver<InboundChannel>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();

            // Routed before the request so no early channel is lost.
            match self.routes.entry(u32::from(port)) {
                Entry::Occupied(_) => {
                    return Err(BridgeError::tunnel(format!("port {} already has a listener", port)));
                }
                Entry::Vacant(entry) => {
                    entry.insert(tx);
                }
            }

            let result = self
                .handle
                .lock()
                .await
                .tcpip_forward(bind_address, u32::from(port))
                .await;

            match result {
                Ok(bound) => {
                    tracing::info!(relay = %self.endpoint, port, bound, "Remote listener registered");
                    Ok(rx)
                }
                Err(e) => {
                    self.routes.remove(&u32::from(port));
                    Err(BridgeError::tunnel_with(
                        format!("relay refused to listen on port {}", port),
                        e,
                    ))
                }
            }
        })
    }

    fn cancel_listener<'a>(&'a self, bind_address: &'a str, port: u16) -> RelayFuture<'a, ()> {
        Box::pin(async move {
            self.routes.remove(&u32::from(port));
            if self.is_closed() {
                return Ok(());
            }
            self.handle
                .lock()
                .await
                .cancel_tcpip_forward(bind_address, u32::from(port))
                .await
                .map_err(|e| BridgeError::tunnel_with(format!("cannot cancel listener on port {}", port), e))?;
            tracing::debug!(relay = %self.endpoint, port, "Remote listener cancelled");
            Ok(())
        })
    }

    fn open_direct<'a>(&'a self, host: &'a str, port: u16) -> RelayFuture<'a, RelayStream> {
        Box::pin(async move {
            let channel = self
                .handle
                .lock()
                .await
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    BridgeError::connection_with(format!("relay could not open {}:{}", host, port), e)
                })?;
            tracing::debug!(relay = %self.endpoint, host, port, "Direct channel opened");
            Ok(Box::new(channel.into_stream()) as RelayStream)
        })
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        self.handle
            .try_lock()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }

    fn close(&self) -> RelayFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.routes.clear();
            let handle = self.handle.lock().await;
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                tracing::debug!(relay = %self.endpoint, error = %e, "Disconnect failed");
            }
            tracing::info!(relay = %self.endpoint, "Disconnected from relay server");
            Ok(())
        })
    }
}

/// Production connector speaking SSH through russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl RelayConnector for SshConnector {
    fn connect<'a>(&'a self, target: &'a RelayTarget) -> RelayFuture<'a, Arc<dyn RelayConnection>> {
        Box::pin(async move {
            let connection = SshConnection::connect(target).await?;
            Ok(Arc::new(connection) as Arc<dyn RelayConnection>)
        })
    }
}

//! Relay module for carrying shell traffic through an SSH server.
//!
//! This module provides:
//! - [`RelayConnection`]: the capability consumed from an SSH client
//!   (remote listeners, direct channels, close)
//! - [`SshConnector`]: the russh implementation of that capability
//! - [`RelayManager`]: host-side reverse tunnels into the local shell server
//!
//! The relay server is trusted with nothing but byte forwarding.

pub mod auth;
pub mod manager;
pub mod memory;
pub mod ssh;
pub mod tunnel;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use protocol::{RelayDestination, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::Config;

pub use manager::RelayManager;
pub use memory::{MemoryConnection, MemoryRelay};
pub use ssh::{SshConnection, SshConnector};
pub use tunnel::{Tunnel, TunnelInfo};

/// Boxed future returned by relay operations.
pub type RelayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A bidirectional byte stream carried over the relay.
pub trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayIo for T {}

/// Owned relay byte stream.
pub type RelayStream = Box<dyn RelayIo>;

/// A connection the relay server routed back to us through a remote listener.
pub struct InboundChannel {
    /// The channel's byte stream.
    pub stream: RelayStream,
    /// Address of the peer that connected to the relay.
    pub originator_address: String,
    /// Port of the peer that connected to the relay.
    pub originator_port: u32,
}

impl std::fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundChannel")
            .field("originator_address", &self.originator_address)
            .field("originator_port", &self.originator_port)
            .finish_non_exhaustive()
    }
}

/// An authenticated connection to a relay SSH server.
pub trait RelayConnection: Send + Sync {
    /// Registers a remote listener on `port`.
    ///
    /// Every connection the relay accepts on that port arrives on the
    /// returned receiver as an [`InboundChannel`].
    fn request_listener<'a>(
        &'a self,
        bind_address: &'a str,
        port: u16,
    ) -> RelayFuture<'a, mpsc::UnboundedReceiver<InboundChannel>>;

    /// Cancels a remote listener registered with [`request_listener`].
    ///
    /// [`request_listener`]: RelayConnection::request_listener
    fn cancel_listener<'a>(&'a self, bind_address: &'a str, port: u16) -> RelayFuture<'a, ()>;

    /// Opens a direct channel to `host:port` as seen by the relay server.
    fn open_direct<'a>(&'a self, host: &'a str, port: u16) -> RelayFuture<'a, RelayStream>;

    /// Returns whether the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&self) -> RelayFuture<'_, ()>;
}

/// Establishes authenticated relay connections.
pub trait RelayConnector: Send + Sync {
    /// Connects and authenticates to `target`.
    fn connect<'a>(&'a self, target: &'a RelayTarget) -> RelayFuture<'a, Arc<dyn RelayConnection>>;
}

/// Connector handing out an already established connection.
///
/// Lets callers that manage their own connection, and tests, plug it into
/// the relay and client components.
pub struct SharedConnection(pub Arc<dyn RelayConnection>);

impl RelayConnector for SharedConnection {
    fn connect<'a>(&'a self, _target: &'a RelayTarget) -> RelayFuture<'a, Arc<dyn RelayConnection>> {
        let connection = Arc::clone(&self.0);
        Box::pin(async move { Ok(connection) })
    }
}

/// Everything needed to reach and authenticate to a relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    /// Relay host name or address.
    pub host: String,
    /// Relay SSH port.
    pub port: u16,
    /// SSH username.
    pub username: String,
    /// Explicit private key, tried before the agent.
    pub key_file: Option<PathBuf>,
    /// Bound on connection plus authentication.
    pub connect_timeout: Duration,
    /// SSH keepalive interval.
    pub keepalive_interval: Option<Duration>,
}

impl RelayTarget {
    /// Resolves a target from a parsed destination and the configuration.
    ///
    /// The username comes from `username`, else the destination, else
    /// `relay.username`, else the local login name.
    pub fn resolve(
        destination: &RelayDestination,
        username: Option<&str>,
        key_file: Option<PathBuf>,
        config: &Config,
    ) -> Self {
        let username = username
            .map(str::to_string)
            .or_else(|| destination.username.clone())
            .or_else(|| config.relay.username.clone())
            .unwrap_or_else(local_username);

        Self {
            host: destination.hostname.clone(),
            port: destination.ssh_port(),
            username,
            key_file: key_file.or_else(|| config.relay.key_file.clone()),
            connect_timeout: config.relay.connect_timeout(),
            keepalive_interval: config.relay.keepalive_interval(),
        }
    }

    /// `user@host:port` for logs and banners.
    pub fn endpoint(&self) -> String {
        protocol::format_connection_string(&self.host, self.port, Some(&self.username))
    }
}

/// Local login name from `$USER` or `$USERNAME`.
pub fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

//! Client side of a relay shell.
//!
//! [`ClientRelay`] opens a direct channel through the relay server to the
//! port a host registered, then forwards the local terminal over it.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use protocol::{BridgeError, ErrorKind, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::forward::{self, ForwardStats};
use crate::relay::{RelayConnection, RelayConnector, RelayStream, RelayTarget};

/// Host name direct channels target, as seen by the relay server.
pub const DIRECT_TARGET_HOST: &str = "localhost";

/// Reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Puts the local terminal in raw mode for its lifetime.
pub struct RawModeGuard(());

impl RawModeGuard {
    /// Enables raw mode.
    pub fn enter() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// A client connection to a host's shell through the relay.
pub struct ClientRelay {
    target: RelayTarget,
    relay_port: u16,
    retry: RetryPolicy,
    connector: Arc<dyn RelayConnector>,
    connection: Option<Arc<dyn RelayConnection>>,
    channel: Option<RelayStream>,
    cancel: CancellationToken,
}

impl ClientRelay {
    /// Creates a client for the host listening on `relay_port` of `target`.
    pub fn new(
        target: RelayTarget,
        relay_port: u16,
        retry: RetryPolicy,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        Self {
            target,
            relay_port,
            retry,
            connector,
            connection: None,
            channel: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that ends forwarding when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns whether a channel is open and not yet forwarded.
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Connects to the relay and opens the direct channel, retrying
    /// refused or failed attempts. Authentication failures are final.
    pub async fn connect(&mut self) -> Result<()> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.try_connect().await {
                Ok(()) => {
                    tracing::info!(
                        relay = %self.target.endpoint(),
                        relay_port = self.relay_port,
                        "Connected to host shell"
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Authentication => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(BridgeError::connection_with(
                        format!(
                            "could not reach {}:{} after {} attempt(s)",
                            self.target.host, self.relay_port, attempts
                        ),
                        e,
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        error = %e,
                        "Relay connection failed, retrying in {}s",
                        self.retry.delay.as_secs()
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        let connection = match self.connection.take() {
            Some(connection) if !connection.is_closed() => connection,
            _ => self.connector.connect(&self.target).await?,
        };

        match connection.open_direct(DIRECT_TARGET_HOST, self.relay_port).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.connection = Some(connection);
                Ok(())
            }
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    /// Forwards the local terminal over the channel until either side
    /// closes. Raw mode is enabled when stdin is a terminal and always
    /// restored afterwards.
    pub async fn start_forwarding(&mut self) -> Result<ForwardStats> {
        let _raw_mode = if std::io::stdin().is_terminal() {
            Some(RawModeGuard::enter().map_err(|e| BridgeError::terminal_with("cannot enable raw mode", e))?)
        } else {
            None
        };

        self.forward_io(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Forwards `input` to the channel and the channel to `output`.
    pub async fn forward_io<R, W>(&mut self, input: R, output: W) -> Result<ForwardStats>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| BridgeError::connection("not connected to host shell"))?;

        let stats = forward::splice(input, output, channel, self.cancel.clone()).await;
        tracing::debug!(sent = stats.a_to_b, received = stats.b_to_a, "Forwarding finished");
        Ok(stats)
    }

    /// Closes the channel and the relay connection. Idempotent.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.shutdown().await;
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Relay connection close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;

    fn target() -> RelayTarget {
        RelayTarget {
            host: "relay.example.com".to_string(),
            port: 22,
            username: "bob".to_string(),
            key_file: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = ClientConfig {
            retry_attempts: 0,
            retry_delay_secs: 4,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.delay, Duration::from_secs(4));
        assert_eq!(RetryPolicy::default().attempts, 3);
    }

    #[tokio::test]
    async fn test_forward_io_round_trip() {
        let relay = MemoryRelay::new();
        let host = relay.connection();
        let mut inbound = host.request_listener("", 4400).await.unwrap();

        let mut client = ClientRelay::new(target(), 4400, fast_retry(1), Arc::new(relay.clone()));
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let echo = tokio::spawn(async move {
            let mut channel = inbound.recv().await.unwrap().stream;
            let mut line = [0u8; 8];
            channel.read_exact(&mut line).await.unwrap();
            channel.write_all(b"hi\r\n").await.unwrap();
            channel.shutdown().await.unwrap();
            line
        });

        let (input, mut input_writer) = tokio::io::duplex(1024);
        let (output_writer, mut output) = tokio::io::duplex(1024);
        input_writer.write_all(b"echo hi\n").await.unwrap();

        let stats = client.forward_io(input, output_writer).await.unwrap();
        assert_eq!(&echo.await.unwrap(), b"echo hi\n");
        assert_eq!(stats.b_to_a, 4);

        let mut received = Vec::new();
        output.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hi\r\n");

        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        let relay = MemoryRelay::new();
        let host = relay.connection();

        let listen = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            host.request_listener("", 4401).await.unwrap()
        });

        let mut client = ClientRelay::new(target(), 4401, fast_retry(10), Arc::new(relay.clone()));
        client.connect().await.unwrap();
        let _inbound = listen.await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let relay = MemoryRelay::new();
        let mut client = ClientRelay::new(target(), 4402, fast_retry(3), Arc::new(relay));

        let start = Instant::now();
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_authentication_failure_is_not_retried() {
        let relay = MemoryRelay::new();
        relay.reject_auth(true);
        let mut client = ClientRelay::new(
            target(),
            4403,
            RetryPolicy {
                attempts: 5,
                delay: Duration::from_secs(10),
            },
            Arc::new(relay),
        );

        let err = tokio::time::timeout(Duration::from_secs(2), client.connect())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_forward_without_connect_fails() {
        let relay = MemoryRelay::new();
        let mut client = ClientRelay::new(target(), 4404, fast_retry(1), Arc::new(relay));
        let err = client
            .forward_io(tokio::io::empty(), tokio::io::sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}

//! Host-side shell server.
//!
//! Listens on `localhost:host_port` and gives every accepted connection its
//! own shell. Bytes are forwarded between the client socket and the shell
//! by two loops per connection, one per direction.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use protocol::{BridgeError, ErrorKind, Result, SessionId, SessionStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::forward::FORWARD_BUFFER_SIZE;
use crate::session::SessionManager;
use crate::terminal::{TerminalProvider, TerminalSession, READ_BUFFER_SIZE};

/// Upper bound on joining worker tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between activity touches caused by client input.
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before polling a quiet but still running shell again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backoff after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Identifier of a client connection within one server.
pub type ClientId = u64;

/// A live client attached to its own shell.
struct ClientConnection {
    address: SocketAddr,
    cancel: CancellationToken,
    terminal: Arc<dyn TerminalSession>,
}

/// Local TCP server handing out shells for one session.
pub struct ShellServer {
    session_id: SessionId,
    host_port: u16,
    sessions: Arc<SessionManager>,
    terminals: Arc<dyn TerminalProvider>,
    clients: DashMap<ClientId, ClientConnection>,
    /// Serializes client membership changes with the status they imply.
    membership: Mutex<()>,
    next_client_id: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl ShellServer {
    /// Creates a server for `session_id` on `host_port`.
    pub fn new(
        session_id: impl Into<SessionId>,
        host_port: u16,
        sessions: Arc<SessionManager>,
        terminals: Arc<dyn TerminalProvider>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            host_port,
            sessions,
            terminals,
            clients: DashMap::new(),
            membership: Mutex::new(()),
            next_client_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Session served by this server.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.host_port))
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns whether the server has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Binds the listener and starts accepting clients.
    ///
    /// Moves the session to `waiting` once the socket is bound.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Session(format!(
                "shell server for session {} already started",
                self.session_id
            )));
        }

        let addr = self.local_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::connection_with(format!("failed to bind shell server on {}", addr), e))?;

        self.sessions
            .set_status(&self.session_id, SessionStatus::Waiting)?;

        tracing::info!(
            session_id = %self.session_id,
            port = self.host_port,
            "Shell server listening"
        );

        let server = Arc::clone(self);
        self.tasks.spawn(async move { server.accept_loop(listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        let server = Arc::clone(&self);
                        self.tasks.spawn(async move { server.handle_client(stream, address).await });
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.tasks.close();
        tracing::debug!(session_id = %self.session_id, "Shell server accept loop stopped");
    }

    async fn handle_client(self: Arc<Self>, mut stream: TcpStream, address: SocketAddr) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let _ = stream.set_nodelay(true);

        let terminal = match self.terminals.spawn(&self.session_id) {
            Ok(terminal) => terminal,
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    client = %address,
                    error = %e,
                    "Failed to start shell for client"
                );
                let line = format!("bridgeme: failed to start shell: {}\r\n", e);
                let _ = stream.write_all(line.as_bytes()).await;
                let _ = stream.shutdown().await;
                return;
            }
        };

        let banner = format!(
            "\r\n*** BridgeMe Shell Session {} ***\r\nConnected from {}\r\n\r\n",
            self.session_id, address
        );
        if let Err(e) = stream.write_all(banner.as_bytes()).await {
            tracing::debug!(client = %address, error = %e, "Client left before banner");
            let _ = terminal.close().await;
            return;
        }

        let cancel = self.cancel.child_token();
        self.attach(
            client_id,
            ClientConnection {
                address,
                cancel: cancel.clone(),
                terminal: Arc::clone(&terminal),
            },
        );

        tracing::info!(
            session_id = %self.session_id,
            client = %address,
            clients = self.clients.len(),
            "Client attached"
        );

        let (reader, writer) = stream.into_split();

        let inbound = {
            let terminal = Arc::clone(&terminal);
            let sessions = Arc::clone(&self.sessions);
            let session_id = self.session_id.clone();
            let cancel = cancel.clone();
            self.tasks.spawn(async move {
                socket_to_terminal(reader, terminal.as_ref(), &sessions, &session_id, &cancel).await;
                cancel.cancel();
            })
        };

        let outbound = {
            let terminal = Arc::clone(&terminal);
            let cancel = cancel.clone();
            self.tasks.spawn(async move {
                terminal_to_socket(terminal.as_ref(), writer, &cancel).await;
                cancel.cancel();
            })
        };

        let _ = tokio::join!(inbound, outbound);

        if let Err(e) = terminal.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to close shell");
        }
        self.detach(client_id);

        tracing::info!(
            session_id = %self.session_id,
            client = %address,
            clients = self.clients.len(),
            "Client detached"
        );
    }

    /// Registers a client and marks the session connected.
    fn attach(&self, client_id: ClientId, client: ClientConnection) {
        let _membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
        let address = client.address;
        self.clients.insert(client_id, client);

        if let Err(e) = self.sessions.update_status(
            &self.session_id,
            SessionStatus::Connected,
            [("client_address".to_string(), serde_json::json!(address.to_string()))],
        ) {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to mark session connected");
        }
    }

    /// Removes a client; the last one out marks the session disconnected.
    fn detach(&self, client_id: ClientId) {
        let _membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
        self.clients.remove(&client_id);
        if !self.clients.is_empty() {
            return;
        }

        match self
            .sessions
            .set_status(&self.session_id, SessionStatus::Disconnected)
        {
            Ok(()) => {}
            // Session already closed during shutdown.
            Err(e) if e.kind() == ErrorKind::Session => {
                tracing::debug!(session_id = %self.session_id, error = %e, "Skipping disconnect status");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to mark session disconnected");
            }
        }
    }

    /// Stops accepting, closes every client and joins all workers.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(session_id = %self.session_id, "Stopping shell server");
        }
        self.cancel.cancel();
        self.tasks.close();

        if tokio::time::timeout(STOP_TIMEOUT, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                session_id = %self.session_id,
                clients = self.clients.len(),
                "Shell server workers did not finish in time, force closing shells"
            );
            let terminals: Vec<_> = self
                .clients
                .iter()
                .map(|entry| Arc::clone(&entry.value().terminal))
                .collect();
            for terminal in terminals {
                let _ = terminal.close().await;
            }
        }
    }

    /// Resolves once the server has stopped and its workers have finished.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
        self.tasks.wait().await;
    }

    /// Disconnects one client, leaving the server running.
    pub fn disconnect_client(&self, client_id: ClientId) -> bool {
        match self.clients.get(&client_id) {
            Some(client) => {
                tracing::debug!(client = %client.address, "Disconnecting client");
                client.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Identifiers and addresses of the attached clients.
    pub fn clients(&self) -> Vec<(ClientId, SocketAddr)> {
        let mut clients: Vec<_> = self
            .clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().address))
            .collect();
        clients.sort_unstable();
        clients
    }
}

async fn socket_to_terminal(
    mut reader: OwnedReadHalf,
    terminal: &dyn TerminalSession,
    sessions: &SessionManager,
    session_id: &str,
    cancel: &CancellationToken,
) {
    let mut buffer = vec![0u8; FORWARD_BUFFER_SIZE];
    let mut last_touch: Option<Instant> = None;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buffer) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Client read failed");
                    break;
                }
            },
        };

        if let Err(e) = terminal.write(&buffer[..n]).await {
            tracing::debug!(session_id = %session_id, error = %e, "Shell write failed");
            break;
        }

        if last_touch.map_or(true, |t| t.elapsed() >= TOUCH_INTERVAL) {
            if let Err(e) = sessions.touch(session_id) {
                tracing::debug!(session_id = %session_id, error = %e, "Activity touch failed");
            }
            last_touch = Some(Instant::now());
        }
    }
}

async fn terminal_to_socket(
    terminal: &dyn TerminalSession,
    mut writer: OwnedWriteHalf,
    cancel: &CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            result = terminal.read(READ_BUFFER_SIZE) => match result {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(session_id = %terminal.session_id(), error = %e, "Shell read failed");
                    break;
                }
            },
        };

        if data.is_empty() {
            if !terminal.is_running() {
                tracing::debug!(session_id = %terminal.session_id(), "Shell exited");
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => continue,
            }
        }

        if let Err(e) = writer.write_all(&data).await {
            tracing::debug!(session_id = %terminal.session_id(), error = %e, "Client write failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

//! Host-mode coordinator.
//!
//! Wires one run of `bridgeme host` together: the session table, the local
//! shell server, the reverse tunnel through the relay, the expiry sweep and
//! the control socket. Setup failures roll back whatever was already
//! acquired; [`HostCoordinator::stop`] tears everything down in reverse.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use protocol::{SessionId, SessionInfo};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::relay::{RelayConnector, RelayManager, RelayTarget, TunnelInfo};
use crate::session::{SessionEvent, SessionManager, SessionManagerSettings};
use crate::shell_server::ShellServer;
use crate::terminal::{self, TerminalProvider};

/// Upper bound on joining background tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Host coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Not started, or fully stopped.
    Stopped,
    /// Acquiring ports, listener and tunnel.
    Starting,
    /// Serving clients.
    Running,
    /// Tearing down.
    ShuttingDown,
}

/// Why [`HostCoordinator::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The shutdown future resolved (SIGINT/SIGTERM).
    Signal,
    /// The session was closed through IPC or expired.
    SessionClosed,
    /// The shell server stopped on its own.
    ServerStopped,
}

/// Everything the operator needs once the host is ready.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    /// The session snapshot after setup.
    pub session: SessionInfo,
    /// The established tunnel.
    pub tunnel: TunnelInfo,
    /// Command the client runs to attach.
    pub client_command: String,
}

impl ReadyInfo {
    fn new(session: SessionInfo, tunnel: TunnelInfo, target: &RelayTarget) -> Self {
        let relay = if target.port == protocol::DEFAULT_SSH_PORT {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        let client_command = format!("bridgeme connect {}:{}", relay, tunnel.relay_port);
        Self {
            session,
            tunnel,
            client_command,
        }
    }

    /// Multi-line banner printed when the host is ready.
    pub fn banner(&self) -> String {
        format!(
            "BridgeMe host ready\n\
             \x20 Session:    {}\n\
             \x20 Shell port: {}\n\
             \x20 Relay:      {}\n\
             \x20 Relay port: {}\n\
             \n\
             Share this command with the client:\n\
             \x20 {}\n",
            self.session.id,
            self.session.host_port,
            self.tunnel.relay_server,
            self.tunnel.relay_port,
            self.client_command,
        )
    }
}

/// Coordinates every component of one host run.
pub struct HostCoordinator {
    config: Config,
    target: RelayTarget,
    state: RwLock<HostState>,
    sessions: Arc<SessionManager>,
    terminals: Arc<dyn TerminalProvider>,
    relay: RelayManager,
    server: RwLock<Option<Arc<ShellServer>>>,
    session_id: RwLock<Option<SessionId>>,
    control_socket: Option<PathBuf>,
    session_closed: CancellationToken,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl HostCoordinator {
    /// Creates a coordinator using the terminal provider named in `config`.
    pub fn new(config: Config, target: RelayTarget, connector: Arc<dyn RelayConnector>) -> Result<Self> {
        let terminals = terminal::provider_from_config(&config.terminal).context("Failed to select a shell")?;
        Ok(Self::with_provider(config, target, connector, terminals))
    }

    /// Creates a coordinator with an explicit terminal provider.
    pub fn with_provider(
        config: Config,
        target: RelayTarget,
        connector: Arc<dyn RelayConnector>,
        terminals: Arc<dyn TerminalProvider>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(SessionManagerSettings::from(&config.session)));
        let relay = RelayManager::new(
            target.clone(),
            config.relay.bind_address.clone(),
            connector,
            Arc::clone(&sessions),
        );

        Self {
            control_socket: default_control_socket(),
            config,
            target,
            state: RwLock::new(HostState::Stopped),
            sessions,
            terminals,
            relay,
            server: RwLock::new(None),
            session_id: RwLock::new(None),
            session_closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Overrides the control socket path; `None` disables IPC.
    pub fn with_control_socket(mut self, path: Option<PathBuf>) -> Self {
        self.control_socket = path;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> HostState {
        *self.state.read().await
    }

    /// The session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The relay manager.
    pub fn relay(&self) -> &RelayManager {
        &self.relay
    }

    /// Id of the hosted session once started.
    pub async fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().await.clone()
    }

    /// Number of clients attached to the shell server.
    pub async fn client_count(&self) -> usize {
        self.server
            .read()
            .await
            .as_ref()
            .map(|server| server.client_count())
            .unwrap_or(0)
    }

    /// Creates the session, starts the shell server and opens the tunnel.
    ///
    /// On failure everything acquired so far is released and the
    /// coordinator returns to [`HostState::Stopped`].
    pub async fn start(&self) -> Result<ReadyInfo> {
        {
            let mut state = self.state.write().await;
            if *state != HostState::Stopped {
                anyhow::bail!("Host is already running");
            }
            if self.shutdown.is_cancelled() {
                anyhow::bail!("Host has already been stopped and cannot be restarted");
            }
            *state = HostState::Starting;
        }
        info!(relay = %self.target.endpoint(), "Starting host");

        match self.setup().await {
            Ok(ready) => {
                *self.state.write().await = HostState::Running;
                info!(
                    session_id = %ready.session.id,
                    host_port = ready.session.host_port,
                    relay_port = ready.tunnel.relay_port,
                    "Host ready"
                );
                Ok(ready)
            }
            Err(e) => {
                warn!(error = %e, "Host setup failed, rolling back");
                self.teardown().await;
                *self.state.write().await = HostState::Stopped;
                Err(e)
            }
        }
    }

    async fn setup(&self) -> Result<ReadyInfo> {
        let events = self.sessions.subscribe();

        let session = self
            .sessions
            .create_session(Some(self.target.host.clone()), Some(self.target.username.clone()))
            .context("Failed to create session")?;
        *self.session_id.write().await = Some(session.id.clone());
        self.spawn_close_watcher(session.id.clone(), events);

        let server = Arc::new(ShellServer::new(
            session.id.clone(),
            session.host_port,
            Arc::clone(&self.sessions),
            Arc::clone(&self.terminals),
        ));
        *self.server.write().await = Some(Arc::clone(&server));
        server.start().await.context("Failed to start shell server")?;

        self.relay
            .connect()
            .await
            .with_context(|| format!("Failed to connect to relay {}", self.target.endpoint()))?;
        let tunnel = self
            .relay
            .create_reverse_tunnel(&session.id)
            .await
            .context("Failed to create reverse tunnel")?;

        let cleanup = self.sessions.start_cleanup_task(
            self.config.session.cleanup_interval(),
            self.config.session.timeout(),
            self.config.session.cleanup_retry(),
            self.shutdown.child_token(),
        );
        self.tasks.spawn(async move {
            let _ = cleanup.await;
        });
        debug!("Started session cleanup task");

        self.spawn_control_server().await;

        let session = self.sessions.get_session(&session.id).unwrap_or(session);
        Ok(ReadyInfo::new(session, tunnel, &self.target))
    }

    fn spawn_close_watcher(&self, session_id: SessionId, mut events: broadcast::Receiver<SessionEvent>) {
        let closed = self.session_closed.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SessionEvent::Closed(id)) if id == session_id => {
                        info!(session_id = %id, "Session closed");
                        closed.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Session event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    #[cfg(unix)]
    async fn spawn_control_server(&self) {
        use crate::ipc::IpcServer;

        let Some(path) = self.control_socket.clone() else {
            return;
        };
        match IpcServer::bind(&path).await {
            Ok(server) => {
                info!(path = %path.display(), "Control socket listening");
                let handler = Arc::new(HostControl {
                    sessions: Arc::clone(&self.sessions),
                    started_at: Instant::now(),
                });
                self.tasks.spawn(server.serve(handler, self.shutdown.child_token()));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Control socket unavailable"),
        }
    }

    #[cfg(not(unix))]
    async fn spawn_control_server(&self) {}

    /// Waits until `signal` resolves, the session is closed or expires, or
    /// the shell server stops.
    pub async fn wait<F>(&self, signal: F) -> ExitReason
    where
        F: Future<Output = ()>,
    {
        let server = self.server.read().await.clone();
        let server_stopped = async move {
            match server {
                Some(server) => server.wait().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = signal => ExitReason::Signal,
            _ = self.session_closed.cancelled() => ExitReason::SessionClosed,
            _ = server_stopped => ExitReason::ServerStopped,
        }
    }

    /// Stops the tunnel, the shell server and every session. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, HostState::Stopped | HostState::ShuttingDown) {
                return;
            }
            *state = HostState::ShuttingDown;
        }
        info!("Stopping host");

        self.teardown().await;

        *self.state.write().await = HostState::Stopped;
        info!("Host stopped");
    }

    async fn teardown(&self) {
        self.shutdown.cancel();
        self.relay.disconnect().await;

        if let Some(server) = self.server.read().await.clone() {
            server.stop().await;
        }

        match self.sessions.shutdown() {
            Ok(closed) if closed > 0 => debug!(closed, "Closed remaining sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to close sessions"),
        }

        self.tasks.close();
        if tokio::time::timeout(STOP_TIMEOUT, self.tasks.wait()).await.is_err() {
            warn!("Host background tasks did not finish in time");
        }
    }
}

#[cfg(unix)]
fn default_control_socket() -> Option<PathBuf> {
    Some(crate::ipc::host_socket_path(std::process::id()))
}

#[cfg(not(unix))]
fn default_control_socket() -> Option<PathBuf> {
    None
}

/// Answers control requests from `bridgeme status` and `bridgeme close`.
#[cfg(unix)]
struct HostControl {
    sessions: Arc<SessionManager>,
    started_at: Instant,
}

#[cfg(unix)]
impl crate::ipc::IpcHandler for HostControl {
    fn handle(&self, request: crate::ipc::IpcRequest) -> crate::ipc::IpcResponse {
        use crate::ipc::{IpcRequest, IpcResponse};

        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                pid: std::process::id(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                stats: self.sessions.get_session_stats(),
            },
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.sessions.list_active_sessions(),
            },
            IpcRequest::CloseSession { session_id } => match self.sessions.close_session(&session_id) {
                Ok(true) => IpcResponse::SessionClosed { session_id },
                Ok(false) => IpcResponse::Error {
                    message: format!("session not found: {}", session_id),
                },
                Err(e) => IpcResponse::Error { message: e.to_string() },
            },
            IpcRequest::CloseAll => {
                let mut session_ids = Vec::new();
                for session in self.sessions.list_active_sessions() {
                    match self.sessions.close_session(&session.id) {
                        Ok(true) => session_ids.push(session.id),
                        Ok(false) => {}
                        Err(e) => return IpcResponse::Error { message: e.to_string() },
                    }
                }
                IpcResponse::SessionsClosed { session_ids }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{IpcClient, IpcHandler, IpcRequest, IpcResponse};
    use crate::relay::MemoryRelay;
    use crate::terminal::pipe::PipeProvider;
    use crate::terminal::ShellCommand;
    use protocol::SessionStatus;
    use tempfile::TempDir;

    fn target() -> RelayTarget {
        RelayTarget {
            host: "relay.example.com".to_string(),
            port: 22,
            username: "user".to_string(),
            key_file: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
        }
    }

    fn coordinator(relay: &MemoryRelay) -> HostCoordinator {
        let terminals = Arc::new(PipeProvider::new(
            ShellCommand::for_program("/bin/sh"),
            Duration::from_millis(200),
        ));
        HostCoordinator::with_provider(Config::default(), target(), Arc::new(relay.clone()), terminals)
            .with_control_socket(None)
    }

    #[test]
    fn test_client_command_includes_non_default_ssh_port() {
        let session = SessionInfo {
            id: "abcd1234".to_string(),
            host_port: 12000,
            relay_port: Some(23000),
            relay_server: Some("relay.example.com".to_string()),
            username: Some("user".to_string()),
            status: SessionStatus::Waiting,
            created_at: 0,
            age_secs: 0,
            idle_secs: 0,
            client_info: Default::default(),
        };
        let tunnel = TunnelInfo {
            session_id: "abcd1234".to_string(),
            relay_server: "relay.example.com".to_string(),
            relay_port: 23000,
            host_port: 12000,
            bind_address: String::new(),
        };

        let ready = ReadyInfo::new(session.clone(), tunnel.clone(), &target());
        assert_eq!(ready.client_command, "bridgeme connect relay.example.com:23000");
        assert!(ready.banner().contains("abcd1234"));
        assert!(ready.banner().contains("12000"));

        let mut other = target();
        other.port = 2222;
        let ready = ReadyInfo::new(session, tunnel, &other);
        assert_eq!(ready.client_command, "bridgeme connect relay.example.com:2222:23000");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let relay = MemoryRelay::new();
        let host = coordinator(&relay);

        let ready = host.start().await.unwrap();
        assert_eq!(host.state().await, HostState::Running);
        assert_eq!(ready.session.status, SessionStatus::Waiting);
        assert_eq!(ready.session.relay_port, Some(ready.tunnel.relay_port));
        assert!(relay.is_listening(ready.tunnel.relay_port));
        assert!(host.start().await.is_err());

        host.stop().await;
        host.stop().await;
        assert_eq!(host.state().await, HostState::Stopped);
        assert!(!relay.is_listening(ready.tunnel.relay_port));
        assert!(host.sessions().list_active_sessions().is_empty());
        assert!(!host.sessions().is_port_allocated(ready.session.host_port));
    }

    #[tokio::test]
    async fn test_setup_failure_rolls_back() {
        let relay = MemoryRelay::new();
        relay.refuse_listeners(true);
        let host = coordinator(&relay);

        let err = host.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("reverse tunnel"));
        assert_eq!(host.state().await, HostState::Stopped);
        assert!(host.sessions().list_active_sessions().is_empty());
        assert_eq!(host.sessions().get_session_stats().allocated_ports, 0);
        assert!(!host.relay().is_connected().await);
    }

    #[tokio::test]
    async fn test_auth_failure_rolls_back() {
        let relay = MemoryRelay::new();
        relay.reject_auth(true);
        let host = coordinator(&relay);

        let err = host.start().await.unwrap_err();
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<protocol::BridgeError>())
            .map(|e| e.kind());
        assert_eq!(kind, Some(protocol::ErrorKind::Authentication));
        assert!(host.sessions().list_active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_when_session_closed() {
        let relay = MemoryRelay::new();
        let host = coordinator(&relay);
        let ready = host.start().await.unwrap();

        let sessions = Arc::clone(host.sessions());
        let id = ready.session.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sessions.close_session(&id).unwrap();
        });

        let reason = tokio::time::timeout(Duration::from_secs(5), host.wait(std::future::pending()))
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::SessionClosed);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_wait_returns_on_signal() {
        let relay = MemoryRelay::new();
        let host = coordinator(&relay);
        host.start().await.unwrap();

        let reason = host.wait(async {}).await;
        assert_eq!(reason, ExitReason::Signal);
        host.stop().await;
    }

    #[tokio::test]
    async fn test_control_handler() {
        let sessions = Arc::new(SessionManager::new(SessionManagerSettings::default()));
        let a = sessions.create_session(Some("relay.example.com".into()), Some("user".into())).unwrap();
        let b = sessions.create_session(Some("relay.example.com".into()), Some("user".into())).unwrap();
        let control = HostControl {
            sessions: Arc::clone(&sessions),
            started_at: Instant::now(),
        };

        assert_eq!(control.handle(IpcRequest::Ping), IpcResponse::Pong);
        match control.handle(IpcRequest::Status) {
            IpcResponse::Status { pid, stats, .. } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(stats.total_sessions, 2);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        assert_eq!(
            control.handle(IpcRequest::CloseSession { session_id: a.id.clone() }),
            IpcResponse::SessionClosed { session_id: a.id.clone() }
        );
        assert!(matches!(
            control.handle(IpcRequest::CloseSession { session_id: a.id }),
            IpcResponse::Error { .. }
        ));
        assert_eq!(
            control.handle(IpcRequest::CloseAll),
            IpcResponse::SessionsClosed { session_ids: vec![b.id] }
        );
    }

    #[tokio::test]
    async fn test_control_socket_serves_status() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("host-test.sock");
        let relay = MemoryRelay::new();
        let host = coordinator(&relay).with_control_socket(Some(socket.clone()));
        let ready = host.start().await.unwrap();

        let mut client = IpcClient::connect(&socket).await.unwrap();
        let sessions = client.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, ready.session.id);

        let closed = client.close_all().await.unwrap();
        assert_eq!(closed, vec![ready.session.id.clone()]);

        let reason = tokio::time::timeout(Duration::from_secs(5), host.wait(std::future::pending()))
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::SessionClosed);

        host.stop().await;
        assert!(!socket.exists());
    }
}

//! IPC client used by `bridgeme status` and `bridgeme close`.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{SessionId, SessionInfo, SessionStats};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Status reported by one host process.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStatus {
    /// Host process id.
    pub pid: u32,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Session table statistics.
    pub stats: SessionStats,
}

/// A client for talking to a host process.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the host at the specified socket path.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout, also used for every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "host closed connection").into());
        }

        match serde_json::from_str(line.trim())? {
            IpcResponse::Error { message } => Err(IpcError::Remote(message)),
            response => Ok(response),
        }
    }

    /// Returns `true` if the host answers with Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the host's status.
    pub async fn status(&mut self) -> Result<HostStatus, IpcError> {
        match self.send(IpcRequest::Status).await? {
            IpcResponse::Status {
                pid,
                uptime_secs,
                stats,
            } => Ok(HostStatus {
                pid,
                uptime_secs,
                stats,
            }),
            other => Err(IpcError::UnexpectedResponse(Box::new(other))),
        }
    }

    /// List the host's active sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(IpcError::UnexpectedResponse(Box::new(other))),
        }
    }

    /// Close one session.
    pub async fn close_session(&mut self, session_id: &str) -> Result<SessionId, IpcError> {
        let request = IpcRequest::CloseSession {
            session_id: session_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::SessionClosed { session_id } => Ok(session_id),
            other => Err(IpcError::UnexpectedResponse(Box::new(other))),
        }
    }

    /// Close every session of the host.
    pub async fn close_all(&mut self) -> Result<Vec<SessionId>, IpcError> {
        match self.send(IpcRequest::CloseAll).await? {
            IpcResponse::SessionsClosed { session_ids } => Ok(session_ids),
            other => Err(IpcError::UnexpectedResponse(Box::new(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_client_connect_fails_when_host_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = IpcClient::connect(&socket_path).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, IpcRequest::Ping);
            conn.send_response(&IpcResponse::Pong).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_status() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, IpcRequest::Status);
            conn.send_response(&IpcResponse::Status {
                pid: 77,
                uptime_secs: 100,
                stats: SessionStats {
                    total_sessions: 2,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.pid, 77);
        assert_eq!(status.uptime_secs, 100);
        assert_eq!(status.stats.total_sessions, 2);

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_session_error() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            match request {
                IpcRequest::CloseSession { session_id } => {
                    conn.send_response(&IpcResponse::Error {
                        message: format!("session not found: {}", session_id),
                    })
                    .await
                    .unwrap();
                }
                _ => panic!("Expected CloseSession request"),
            }
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let err = client.close_session("missing").await.unwrap_err();
        assert!(matches!(err, IpcError::Remote(message) if message.contains("missing")));

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_rejects_unexpected_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let _ = conn.read_request().await.unwrap().unwrap();
            conn.send_response(&IpcResponse::Pong).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let err = client.list_sessions().await.unwrap_err();
        assert!(matches!(err, IpcError::UnexpectedResponse(_)));

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();

        let result = client.ping().await;
        assert!(result.is_err());
    }
}

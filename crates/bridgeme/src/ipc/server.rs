//! IPC server answering control requests on a Unix Domain Socket.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::messages::{IpcRequest, IpcResponse};

/// Serves decoded requests.
pub trait IpcHandler: Send + Sync {
    /// Produces the response for one request.
    fn handle(&self, request: IpcRequest) -> IpcResponse;
}

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Missing parent directories are created owner-only, and a leftover
    /// socket file at the path is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                create_private_dir(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Path of the socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Answers requests with `handler` until `cancel` fires.
    ///
    /// Each connection is served on its own task and may send any number
    /// of requests.
    pub async fn serve(self, handler: Arc<dyn IpcHandler>, cancel: CancellationToken) {
        let tasks = TaskTracker::new();

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "IPC accept failed");
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = conn.serve(handler.as_ref(), &cancel).await {
                    tracing::debug!(error = %e, "IPC connection ended with error");
                }
            });
        }

        tasks.close();
        tasks.wait().await;
        tracing::debug!(path = %self.path.display(), "IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream and speaks the newline-delimited JSON protocol.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn serve(mut self, handler: &dyn IpcHandler, cancel: &CancellationToken) -> Result<(), IpcError> {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = self.read_request() => request,
            };

            let response = match request {
                Ok(Some(request)) => {
                    tracing::debug!(?request, "IPC request");
                    handler.handle(request)
                }
                Ok(None) => return Ok(()),
                Err(IpcError::Json(e)) => IpcResponse::Error {
                    message: format!("malformed request: {}", e),
                },
                Err(e) => return Err(e),
            };

            self.send_response(&response).await?;
        }
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The host answered with an error.
    #[error("host error: {0}")]
    Remote(String),

    /// The host answered with a response of the wrong type.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Box<IpcResponse>),
}

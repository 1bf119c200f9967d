//! Piped shell sessions.
//!
//! Used where no pseudo-terminal is available. The shell's stdout and
//! stderr are merged into one output stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use protocol::{BridgeError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use super::{
    hang_up, wait_for_exit, OutputBuffer, ShellCommand, TerminalFuture, TerminalProvider,
    TerminalSession, OUTPUT_CHANNEL_CAPACITY, READ_BUFFER_SIZE,
};

type SharedChild = Arc<Mutex<Child>>;

/// Provider spawning shells on plain pipes.
pub struct PipeProvider {
    shell: ShellCommand,
    close_grace: Duration,
}

impl PipeProvider {
    /// Creates a provider running `shell`.
    pub fn new(shell: ShellCommand, close_grace: Duration) -> Self {
        Self { shell, close_grace }
    }
}

impl TerminalProvider for PipeProvider {
    fn shell(&self) -> &ShellCommand {
        &self.shell
    }

    fn name(&self) -> &'static str {
        "pipe"
    }

    fn spawn(&self, session_id: &str) -> Result<Arc<dyn TerminalSession>> {
        let session = PipeSession::spawn(&self.shell, session_id, self.close_grace)?;
        Ok(Arc::new(session))
    }
}

/// A shell process attached to pipes.
pub struct PipeSession {
    session_id: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    output: tokio::sync::Mutex<OutputBuffer>,
    child: SharedChild,
    running: AtomicBool,
    closed: AtomicBool,
    close_grace: Duration,
}

impl PipeSession {
    /// Spawns `shell` with piped standard streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(shell: &ShellCommand, session_id: &str, close_grace: Duration) -> Result<Self> {
        let mut cmd = Command::new(&shell.program);
        cmd.args(&shell.args)
            .envs(ShellCommand::environment(session_id))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::terminal_with(format!("failed to spawn {}", shell.program), e))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, tx));
        }

        tracing::info!(
            session_id = %session_id,
            pid = ?pid,
            shell = %shell.program,
            "Spawned piped shell"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            output: tokio::sync::Mutex::new(OutputBuffer::new(rx)),
            child: Arc::new(Mutex::new(child)),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_grace,
        })
    }
}

/// Forwards one output pipe into the merged channel until EOF.
async fn pump_output<R>(mut pipe: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buffer[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn child_exited(child: &SharedChild) -> bool {
    match child.lock() {
        Ok(mut child) => !matches!(child.try_wait(), Ok(None)),
        Err(_) => true,
    }
}

impl TerminalSession for PipeSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        if child_exited(&self.child) {
            self.running.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> TerminalFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(BridgeError::terminal(format!(
                    "shell for session {} is not running",
                    self.session_id
                )));
            }

            let mut stdin = self.stdin.lock().await;
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| BridgeError::terminal("shell stdin closed"))?;
            stdin
                .write_all(data)
                .await
                .map_err(|e| BridgeError::terminal_with("failed to write to shell", e))?;
            stdin
                .flush()
                .await
                .map_err(|e| BridgeError::terminal_with("failed to flush shell input", e))
        })
    }

    fn read(&self, max_bytes: usize) -> TerminalFuture<'_, Bytes> {
        Box::pin(async move {
            match self.output.lock().await.next(max_bytes).await {
                Some(data) => Ok(data),
                None => {
                    tracing::debug!(session_id = %self.session_id, "Shell output closed");
                    Ok(Bytes::new())
                }
            }
        })
    }

    fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> TerminalFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            // Dropping stdin delivers EOF, which ends most shells on its own.
            self.stdin.lock().await.take();

            let child = Arc::clone(&self.child);
            if !child_exited(&child) {
                if let Some(pid) = self.pid {
                    hang_up(pid);
                }
            }

            if !wait_for_exit(self.close_grace, || child_exited(&child)).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    pid = ?self.pid,
                    "Shell did not exit after hang-up, killing"
                );
                if let Ok(mut child) = child.lock() {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(session_id = %self.session_id, error = %e, "Kill failed");
                    }
                }
                wait_for_exit(Duration::from_secs(1), || child_exited(&child)).await;
            }

            self.running.store(false, Ordering::SeqCst);
            tracing::info!(session_id = %self.session_id, pid = ?self.pid, "Piped shell closed");
            Ok(())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh() -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".to_string(),
            args: vec![],
        }
    }

    async fn read_all(session: &PipeSession) -> String {
        let mut seen = String::new();
        loop {
            match timeout(Duration::from_secs(5), session.read(16)).await {
                Ok(Ok(data)) if !data.is_empty() => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                }
                _ => return seen,
            }
        }
    }

    #[tokio::test]
    async fn test_pipe_echo_merges_stderr() {
        let session = PipeSession::spawn(&sh(), "pipe0001", Duration::from_secs(2)).unwrap();
        assert!(session.is_running());

        session
            .write(b"echo out_marker; echo err_marker 1>&2; exit\n")
            .await
            .unwrap();

        let output = read_all(&session).await;
        assert!(output.contains("out_marker"));
        assert!(output.contains("err_marker"));

        session.close().await.unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_pipe_read_respects_max_bytes() {
        let session = PipeSession::spawn(&sh(), "pipe0002", Duration::from_secs(2)).unwrap();
        session.write(b"echo 0123456789abcdef\n").await.unwrap();

        let first = timeout(Duration::from_secs(5), session.read(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"0123");

        let second = timeout(Duration::from_secs(5), session.read(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&second[..], b"4567");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_env() {
        let session = PipeSession::spawn(&sh(), "pipeenv1", Duration::from_secs(2)).unwrap();
        session
            .write(b"echo \"$BRIDGEME_SESSION $TERM\"; exit\n")
            .await
            .unwrap();

        let output = read_all(&session).await;
        assert!(output.contains("pipeenv1 xterm-256color"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_close_is_idempotent_and_blocks_writes() {
        let session = PipeSession::spawn(&sh(), "pipe0003", Duration::from_secs(2)).unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        let err = session.write(b"echo nope\n").await.unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::Terminal);

        let data = timeout(Duration::from_secs(5), session.read(64))
            .await
            .unwrap()
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_resize_is_noop() {
        let provider = PipeProvider::new(sh(), Duration::from_secs(1));
        let session = provider.spawn("pipe0004").unwrap();
        assert!(session.resize(100, 40).is_ok());
        session.close().await.unwrap();
    }
}

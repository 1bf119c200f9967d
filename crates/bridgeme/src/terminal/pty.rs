//! Native pseudo-terminal sessions.
//!
//! Shells run attached to a `portable-pty` pair. PTY reads cannot be made
//! async portably, so one reader thread per session feeds output into a
//! channel.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{BridgeError, Result};
use tokio::sync::mpsc;

use super::{
    hang_up, wait_for_exit, OutputBuffer, ShellCommand, TerminalFuture, TerminalProvider,
    TerminalSession, DEFAULT_COLS, DEFAULT_ROWS, OUTPUT_CHANNEL_CAPACITY, READ_BUFFER_SIZE,
};

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// EIO, reported by a PTY master once the slave side has closed.
#[cfg(unix)]
const EIO: i32 = 5;

fn default_size() -> PtySize {
    PtySize {
        rows: DEFAULT_ROWS,
        cols: DEFAULT_COLS,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns whether the native PTY system can open a pair.
pub fn pty_available() -> bool {
    native_pty_system().openpty(default_size()).is_ok()
}

/// Provider spawning shells on native pseudo-terminals.
pub struct PtyProvider {
    shell: ShellCommand,
    close_grace: Duration,
}

impl PtyProvider {
    /// Creates a provider running `shell`.
    pub fn new(shell: ShellCommand, close_grace: Duration) -> Self {
        Self { shell, close_grace }
    }
}

impl TerminalProvider for PtyProvider {
    fn shell(&self) -> &ShellCommand {
        &self.shell
    }

    fn name(&self) -> &'static str {
        "pty"
    }

    fn spawn(&self, session_id: &str) -> Result<Arc<dyn TerminalSession>> {
        let session = PtySession::spawn(&self.shell, session_id, self.close_grace)?;
        Ok(Arc::new(session))
    }
}

/// A shell process attached to a pseudo-terminal.
pub struct PtySession {
    session_id: String,
    pid: Option<u32>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    output: tokio::sync::Mutex<OutputBuffer>,
    child: SharedChild,
    running: AtomicBool,
    closed: AtomicBool,
    close_grace: Duration,
}

impl PtySession {
    /// Spawns `shell` on a new PTY pair.
    pub fn spawn(shell: &ShellCommand, session_id: &str, close_grace: Duration) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(default_size())
            .map_err(|e| BridgeError::terminal_with("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        cmd.args(&shell.args);
        for (key, value) in ShellCommand::environment(session_id) {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::terminal_with(format!("failed to spawn {}", shell.program), e))?;

        // The child holds its own slave handle; ours would keep reads from
        // reporting EOF after the shell exits.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::terminal_with("failed to get PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::terminal_with("failed to get PTY writer", e))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let reader_session = session_id.to_string();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", session_id))
            .spawn(move || pump_output(reader, tx, &reader_session))
            .map_err(|e| BridgeError::terminal_with("failed to start PTY reader", e))?;

        tracing::info!(
            session_id = %session_id,
            pid = ?pid,
            shell = %shell.program,
            "Spawned PTY shell"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            output: tokio::sync::Mutex::new(OutputBuffer::new(rx)),
            child: Arc::new(Mutex::new(child)),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_grace,
        })
    }
}

/// Reads the PTY master until EOF or hang-up and forwards every chunk.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>, session_id: &str) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) if is_normal_close(&e) => {
                tracing::debug!(session_id = %session_id, error = %e, "PTY closed");
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "PTY read failed");
                break;
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

fn is_normal_close(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(EIO) {
        return true;
    }
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe
    )
}

impl TerminalSession for PtySession {
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

            let mut guard = self
                .writer
                .lock()
                .map_err(|_| BridgeError::terminal("PTY writer lock poisoned"))?;
            let writer = guard
                .as_mut()
                .ok_or_else(|| BridgeError::terminal("PTY writer closed"))?;
            writer
                .write_all(data)
                .and_then(|_| writer.flush())
                .map_err(|e| BridgeError::terminal_with("failed to write to PTY", e))
        })
    }

    fn read(&self, max_bytes: usize) -> TerminalFuture<'_, Bytes> {
        Box::pin(async move {
            match self.output.lock().await.next(max_bytes).await {
                Some(data) => Ok(data),
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    Ok(Bytes::new())
                }
            }
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| BridgeError::terminal("PTY master lock poisoned"))?;
        let Some(master) = master.as_ref() else {
            return Err(BridgeError::terminal("PTY already closed"));
        };

        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::terminal_with("failed to resize PTY", e))?;

        tracing::debug!(
            session_id = %self.session_id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );
        Ok(())
    }

    fn close(&self) -> TerminalFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            let child = Arc::clone(&self.child);
            let mut exited = child_exited(&child);

            if !exited && cfg!(unix) {
                if let Some(pid) = self.pid {
                    hang_up(pid);
                }
                exited = wait_for_exit(self.close_grace, || child_exited(&child)).await;
            }

            if !exited {
                tracing::warn!(
                    session_id = %self.session_id,
                    pid = ?self.pid,
                    "Shell did not exit after hang-up, killing"
                );
                if let Ok(mut child) = child.lock() {
                    if let Err(e) = child.kill() {
                        tracing::debug!(session_id = %self.session_id, error = %e, "Kill failed");
                    }
                }
                wait_for_exit(Duration::from_secs(1), || child_exited(&child)).await;
            }

            self.running.store(false, Ordering::SeqCst);

            // Releasing the master unblocks any pending reader.
            if let Ok(mut writer) = self.writer.lock() {
                writer.take();
            }
            if let Ok(mut master) = self.master.lock() {
                master.take();
            }

            tracing::info!(session_id = %self.session_id, pid = ?self.pid, "PTY shell closed");
            Ok(())
        })
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Ok(mut child) = self.child.lock() {
                let _ = child.kill();
            }
        }
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

    async fn read_until(session: &PtySession, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(200), session.read(4096)).await {
                Ok(Ok(data)) if !data.is_empty() => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(Ok(_)) => return false,
                Ok(Err(_)) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_pty_spawn_and_close() {
        let session = PtySession::spawn(&sh(), "ptytest1", Duration::from_secs(2)).unwrap();
        assert!(session.is_running());
        assert!(session.pid().is_some());
        assert_eq!(session.session_id(), "ptytest1");

        session.close().await.unwrap();
        assert!(!session.is_running());

        // Idempotent
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pty_echo() {
        let session = PtySession::spawn(&sh(), "ptytest2", Duration::from_secs(2)).unwrap();
        session.write(b"echo pty_marker_$((20+22))\n").await.unwrap();

        assert!(read_until(&session, "pty_marker_42").await);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pty_session_env() {
        let session = PtySession::spawn(&sh(), "envcheck", Duration::from_secs(2)).unwrap();
        session
            .write(b"echo \"id=$BRIDGEME_SESSION term=$TERM\"\n")
            .await
            .unwrap();

        assert!(read_until(&session, "id=envcheck term=xterm-256color").await);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pty_resize() {
        let session = PtySession::spawn(&sh(), "ptytest3", Duration::from_secs(2)).unwrap();
        assert!(session.resize(120, 40).is_ok());
        session.close().await.unwrap();
        assert!(session.resize(100, 50).is_err());
    }

    #[tokio::test]
    async fn test_pty_write_after_close() {
        let session = PtySession::spawn(&sh(), "ptytest4", Duration::from_secs(2)).unwrap();
        session.close().await.unwrap();

        let err = session.write(b"hello\n").await.unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::Terminal);
    }

    #[tokio::test]
    async fn test_pty_exit_reads_empty() {
        let session = PtySession::spawn(&sh(), "ptytest5", Duration::from_secs(2)).unwrap();
        session.write(b"exit 0\n").await.unwrap();

        let mut ended = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(200), session.read(4096)).await {
                Ok(Ok(data)) if data.is_empty() => {
                    ended = true;
                    break;
                }
                Ok(Ok(_)) | Err(_) => {}
                Ok(Err(e)) => panic!("unexpected read error: {}", e),
            }
        }

        assert!(ended, "PTY read should report end of stream");
        assert!(!session.is_running());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_spawn() {
        let provider = PtyProvider::new(sh(), Duration::from_secs(1));
        assert_eq!(provider.name(), "pty");

        let session = provider.spawn("provider").unwrap();
        assert!(session.is_running());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_read_loses_no_output() {
        let session = PtySession::spawn(&sh(), "ptytest6", Duration::from_secs(2)).unwrap();

        // Drain the prompt, then give up on a read while the shell is quiet.
        while let Ok(Ok(data)) = timeout(Duration::from_millis(300), session.read(4096)).await {
            assert!(!data.is_empty());
        }
        assert!(timeout(Duration::from_millis(50), session.read(4096)).await.is_err());

        session.write(b"echo abandoned_$((6*7))\n").await.unwrap();
        assert!(read_until(&session, "abandoned_42").await);
        session.close().await.unwrap();
    }
}

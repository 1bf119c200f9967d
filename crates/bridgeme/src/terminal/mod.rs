//! Terminal module for attaching shells to client connections.
//!
//! A [`TerminalProvider`] spawns one [`TerminalSession`] per client. Two
//! providers exist:
//! - [`PtyProvider`]: a native pseudo-terminal (Unix PTY or Windows ConPTY)
//! - [`PipeProvider`]: piped standard streams with stdout and stderr merged
//!
//! The provider is chosen once at startup from [`TerminalMode`].

pub mod pipe;
pub mod pty;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use protocol::{BridgeError, Result};
use tokio::sync::mpsc;

use crate::config::{TerminalConfig, TerminalMode};

pub use pipe::PipeProvider;
pub use pty::PtyProvider;

/// Boxed future returned by terminal operations.
pub type TerminalFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Buffer size for a single terminal read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Output chunks buffered between a shell's reader and `read`.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Initial terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Initial terminal height.
pub const DEFAULT_ROWS: u16 = 24;

/// Shell binaries tried in order on Unix.
#[cfg(unix)]
const SHELL_PREFERENCE: &[&str] = &["bash", "zsh", "sh"];

/// Absolute fallbacks when path lookup finds nothing.
#[cfg(unix)]
const SHELL_FALLBACKS: &[&str] = &["/bin/bash", "/bin/sh"];

/// Well-known install locations listed alongside path lookups.
#[cfg(unix)]
const SHELL_COMMON_PATHS: &[&str] = &["/bin/bash", "/bin/zsh", "/bin/sh"];

#[cfg(windows)]
const SHELL_COMMON_PATHS: &[&str] = &[];

/// Shell binaries tried in order on Windows.
#[cfg(windows)]
const SHELL_PREFERENCE: &[&str] = &["pwsh", "powershell", "cmd"];

#[cfg(windows)]
const SHELL_FALLBACKS: &[&str] = &["cmd.exe"];

/// A shell program and the arguments that make it interactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Path or name of the shell binary.
    pub program: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
}

impl ShellCommand {
    /// Builds the command for `program` with its interactive arguments.
    pub fn for_program(program: impl Into<String>) -> Self {
        let program = program.into();
        let args = interactive_args(&program)
            .iter()
            .map(|a| a.to_string())
            .collect();
        Self { program, args }
    }

    /// Environment variables set for a shell attached to `session_id`.
    pub fn environment(session_id: &str) -> [(&'static str, String); 2] {
        [
            ("TERM", "xterm-256color".to_string()),
            ("BRIDGEME_SESSION", session_id.to_string()),
        ]
    }
}

/// Returns the interactive arguments for a shell binary.
///
/// Only shells known to accept them get flags; anything else runs bare.
fn interactive_args(program: &str) -> &'static [&'static str] {
    let base = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program)
        .to_ascii_lowercase();
    let name = base.strip_suffix(".exe").unwrap_or(&base);

    match name {
        "pwsh" | "powershell" => &["-NoLogo", "-Interactive"],
        "bash" | "zsh" | "sh" => &["-i"],
        _ => &[],
    }
}

/// Lists the shells installed on this system, in preference order.
pub fn available_shells() -> Vec<String> {
    let mut shells: Vec<String> = SHELL_PREFERENCE
        .iter()
        .filter_map(|candidate| which::which(candidate).ok())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();

    for path in SHELL_COMMON_PATHS {
        if std::path::Path::new(path).exists() && !shells.iter().any(|s| s == path) {
            shells.push(path.to_string());
        }
    }
    shells
}

/// Detects the shell to use.
///
/// A configured shell wins. Otherwise the platform preference list is
/// resolved through the system path, then the absolute fallbacks are tried.
pub fn detect_shell(configured: Option<&str>) -> Result<ShellCommand> {
    if let Some(shell) = configured {
        return Ok(ShellCommand::for_program(shell));
    }

    for candidate in SHELL_PREFERENCE {
        if let Ok(path) = which::which(candidate) {
            return Ok(ShellCommand::for_program(path.to_string_lossy()));
        }
    }

    SHELL_FALLBACKS
        .iter()
        .find(|path| std::path::Path::new(path).exists())
        .map(|path| ShellCommand::for_program(*path))
        .ok_or_else(|| BridgeError::terminal("no usable shell found"))
}

/// A shell process attached to a terminal.
///
/// Sessions are shared between the two forwarding loops of a client
/// connection, so every operation takes `&self`.
pub trait TerminalSession: Send + Sync {
    /// Session identifier this shell belongs to.
    fn session_id(&self) -> &str;

    /// Process ID of the shell, if known.
    fn pid(&self) -> Option<u32>;

    /// Returns whether the shell process is still alive.
    fn is_running(&self) -> bool;

    /// Writes bytes to the shell's input.
    ///
    /// Fails with a terminal error once the shell has stopped.
    fn write<'a>(&'a self, data: &'a [u8]) -> TerminalFuture<'a, ()>;

    /// Reads up to `max_bytes` of shell output.
    ///
    /// An empty result means end of stream. Callers check [`is_running`]
    /// to tell a finished shell from a momentarily quiet one.
    ///
    /// [`is_running`]: TerminalSession::is_running
    fn read(&self, max_bytes: usize) -> TerminalFuture<'_, Bytes>;

    /// Resizes the terminal. A no-op where the terminal has no size.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Hangs up the shell, force-killing it after the grace period.
    ///
    /// Idempotent.
    fn close(&self) -> TerminalFuture<'_, ()>;
}

/// Spawns shells for client connections.
pub trait TerminalProvider: Send + Sync {
    /// The shell this provider runs.
    fn shell(&self) -> &ShellCommand;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Spawns a new interactive shell for `session_id`.
    fn spawn(&self, session_id: &str) -> Result<Arc<dyn TerminalSession>>;
}

/// Builds the provider selected by the terminal configuration.
pub fn provider_from_config(config: &TerminalConfig) -> Result<Arc<dyn TerminalProvider>> {
    let shell = detect_shell(config.shell.as_deref())?;
    let grace = config.close_grace();

    let provider: Arc<dyn TerminalProvider> = match config.mode {
        TerminalMode::Pty => Arc::new(PtyProvider::new(shell, grace)),
        TerminalMode::Pipe => Arc::new(PipeProvider::new(shell, grace)),
        TerminalMode::Auto => {
            if pty::pty_available() {
                Arc::new(PtyProvider::new(shell, grace))
            } else {
                tracing::warn!("No PTY available, falling back to piped shell I/O");
                Arc::new(PipeProvider::new(shell, grace))
            }
        }
    };

    tracing::debug!(
        provider = provider.name(),
        shell = %provider.shell().program,
        "Terminal provider selected"
    );
    Ok(provider)
}

/// Shell output fed by a background reader.
///
/// [`next`](OutputBuffer::next) is cancel-safe: a chunk is either returned
/// or kept for the following call.
pub(crate) struct OutputBuffer {
    rx: mpsc::Receiver<Bytes>,
    pending: BytesMut,
}

impl OutputBuffer {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: BytesMut::new(),
        }
    }

    /// Returns up to `max_bytes` of output, or `None` once the reader is done.
    pub(crate) async fn next(&mut self, max_bytes: usize) -> Option<Bytes> {
        if self.pending.is_empty() {
            let chunk = self.rx.recv().await?;
            self.pending.extend_from_slice(&chunk);
        }
        let take = self.pending.len().min(max_bytes.max(1));
        Some(self.pending.split_to(take).freeze())
    }
}

/// Polls `is_exited` until it reports true or `grace` elapses.
pub(crate) async fn wait_for_exit<F>(grace: Duration, mut is_exited: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if is_exited() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sends SIGHUP to `pid`, the conventional terminal hang-up.
#[cfg(unix)]
pub(crate) fn hang_up(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGHUP) {
        tracing::debug!(pid, error = %e, "SIGHUP delivery failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn hang_up(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_shell_configured() {
        let shell = detect_shell(Some("/bin/sh")).unwrap();
        assert_eq!(shell.program, "/bin/sh");
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_shell_auto() {
        let shell = detect_shell(None).unwrap();
        assert!(!shell.program.is_empty());
        assert_eq!(shell.args, vec!["-i".to_string()]);
    }

    #[test]
    fn test_interactive_args() {
        assert_eq!(
            ShellCommand::for_program("pwsh").args,
            vec!["-NoLogo", "-Interactive"]
        );
        assert_eq!(
            ShellCommand::for_program("C:\\Windows\\powershell.exe").args,
            vec!["-NoLogo", "-Interactive"]
        );
        assert!(ShellCommand::for_program("cmd").args.is_empty());
    }

    #[test]
    fn test_unix_shells_are_interactive() {
        assert_eq!(ShellCommand::for_program("/usr/bin/zsh").args, vec!["-i"]);
        assert_eq!(ShellCommand::for_program("bash").args, vec!["-i"]);
        assert_eq!(ShellCommand::for_program("/bin/sh").args, vec!["-i"]);
    }

    #[test]
    fn test_unknown_shells_get_no_args() {
        assert!(ShellCommand::for_program("/usr/bin/fish").args.is_empty());
        assert!(ShellCommand::for_program("/opt/tools/myshell").args.is_empty());
        assert!(ShellCommand::for_program("nu").args.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_available_shells() {
        let shells = available_shells();
        assert!(shells.iter().any(|s| s.ends_with("/sh")));

        let mut unique = shells.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), shells.len());
    }

    #[test]
    fn test_environment() {
        let env = ShellCommand::environment("abcd1234");
        assert_eq!(env[0], ("TERM", "xterm-256color".to_string()));
        assert_eq!(env[1], ("BRIDGEME_SESSION", "abcd1234".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_provider_from_config_modes() {
        let mut config = TerminalConfig {
            shell: Some("/bin/sh".to_string()),
            ..Default::default()
        };

        config.mode = TerminalMode::Pipe;
        assert_eq!(provider_from_config(&config).unwrap().name(), "pipe");

        config.mode = TerminalMode::Pty;
        assert_eq!(provider_from_config(&config).unwrap().name(), "pty");

        config.mode = TerminalMode::Auto;
        let provider = provider_from_config(&config).unwrap();
        assert_eq!(provider.shell().program, "/bin/sh");
    }

    #[tokio::test]
    async fn test_wait_for_exit() {
        assert!(wait_for_exit(Duration::from_millis(10), || true).await);
        assert!(!wait_for_exit(Duration::from_millis(60), || false).await);

        let mut calls = 0;
        assert!(
            wait_for_exit(Duration::from_secs(1), || {
                calls += 1;
                calls > 2
            })
            .await
        );
    }
}

//! BridgeMe
//!
//! Share a local shell with a remote operator through an SSH relay.

use std::path::PathBuf;
use std::sync::Arc;

use bridgeme::client::{ClientRelay, RetryPolicy};
use bridgeme::config::Config;
use bridgeme::host::HostCoordinator;
use bridgeme::logging::{self, LogFlags, LogMode};
use bridgeme::relay::{RelayTarget, SshConnector};
use clap::{Parser, Subcommand};
use protocol::{split_client_target, RelayDestination, SessionInfo};
use serde::Serialize;

/// BridgeMe - share a local shell with a remote operator through an SSH relay.
#[derive(Parser, Debug)]
#[command(name = "bridgeme")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// SSH username on the relay server
    #[arg(short = 'u', long = "user", global = true, value_name = "USER")]
    pub username: Option<String>,

    /// Private key file for the relay server
    #[arg(short = 'k', long = "key-file", global = true, value_name = "KEYFILE")]
    pub key_file: Option<PathBuf>,

    /// Start host mode (same as `bridgeme host`)
    #[arg(long = "host", value_name = "[USER@]HOST[:PORT]")]
    pub host: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Share this machine's shell through a relay server
    Host {
        /// Relay server, [user@]host[:port]
        #[arg(value_name = "[USER@]HOST[:PORT]")]
        destination: String,
    },

    /// Attach to a shared shell
    Connect {
        /// Relay server and relay port, [user@]host[:ssh_port]:relay_port
        #[arg(value_name = "[USER@]HOST[:SSH_PORT]:RELAY_PORT")]
        target: String,
    },

    /// Show active sessions of running hosts
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session
    Close {
        /// Session ID to close
        #[arg(required_unless_present = "all")]
        session_id: Option<String>,

        /// Close every session
        #[arg(long, conflicts_with = "session_id")]
        all: bool,
    },

    /// Show version and platform
    Version,
}

impl Cli {
    /// Resolves the legacy `--host` flag into a command.
    pub fn resolved_command(&self) -> Option<Commands> {
        match (&self.command, &self.host) {
            (Some(command), _) => Some(command.clone()),
            (None, Some(destination)) => Some(Commands::Host {
                destination: destination.clone(),
            }),
            (None, None) => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Client mode leaves a blocking stdin read behind; do not wait for it.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.resolved_command() else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        anyhow::bail!("no command given");
    };

    if command == Commands::Version {
        print_version();
        return Ok(());
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let mode = match command {
        Commands::Connect { .. } => LogMode::Client,
        _ => LogMode::Host,
    };
    let flags = LogFlags {
        verbose: cli.verbose,
        debug: cli.debug,
    };
    let _log_guard = logging::init(&config.logging, flags, mode)?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match command {
        Commands::Host { destination } => {
            run_host(config, &destination, cli.username.as_deref(), cli.key_file).await
        }
        Commands::Connect { target } => {
            run_client(config, &target, cli.username.as_deref(), cli.key_file).await
        }
        Commands::Status { json } => run_status(json).await,
        Commands::Close { session_id, all } => run_close(session_id.as_deref(), all).await,
        Commands::Version => Ok(()),
    }
}

fn print_version() {
    println!("bridgeme {}", env!("CARGO_PKG_VERSION"));
    println!("OS: {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);

    let shells = bridgeme::terminal::available_shells();
    if shells.is_empty() {
        println!("Shells: none found");
    } else {
        println!("Shells: {}", shells.join(", "));
    }
}

/// Run host mode until interrupted, closed or expired.
async fn run_host(
    config: Config,
    destination: &str,
    username: Option<&str>,
    key_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let destination = RelayDestination::parse_valid(destination)?;
    let target = RelayTarget::resolve(&destination, username, key_file, &config);

    let host = HostCoordinator::new(config, target, Arc::new(SshConnector))?;
    let ready = host.start().await?;
    println!("{}", ready.banner());

    let reason = host.wait(wait_for_shutdown_signal()).await;
    tracing::info!(?reason, "Host shutting down");

    host.stop().await;
    Ok(())
}

/// Run client mode until either side closes.
async fn run_client(
    config: Config,
    target: &str,
    username: Option<&str>,
    key_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (destination, relay_port) = split_client_target(target)?;
    let target = RelayTarget::resolve(&destination, username, key_file, &config);

    let mut client = ClientRelay::new(
        target,
        relay_port,
        RetryPolicy::from(&config.client),
        Arc::new(SshConnector),
    );
    client.connect().await?;
    println!("Connected to host shell. Exit the shell to disconnect.");

    let result = client.start_forwarding().await;
    client.disconnect().await;
    result?;

    println!("\r\nConnection closed.");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            tracing::warn!("Failed to register signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}

/// One host process as shown by `bridgeme status`.
#[derive(Debug, Serialize)]
struct HostReport {
    pid: u32,
    uptime_secs: u64,
    allocated_ports: usize,
    sessions: Vec<SessionInfo>,
}

#[cfg(unix)]
async fn query_hosts() -> Vec<HostReport> {
    use bridgeme::ipc::{discover_hosts, IpcClient};

    let mut reports = Vec::new();
    for host in discover_hosts() {
        let report = async {
            let mut client = IpcClient::connect(&host.path).await?;
            let status = client.status().await?;
            let sessions = client.list_sessions().await?;
            Ok::<_, bridgeme::ipc::IpcError>(HostReport {
                pid: status.pid,
                uptime_secs: status.uptime_secs,
                allocated_ports: status.stats.allocated_ports,
                sessions,
            })
        };
        match report.await {
            Ok(report) => reports.push(report),
            Err(e) => tracing::warn!(pid = host.pid, error = %e, "Host did not answer"),
        }
    }
    reports
}

#[cfg(unix)]
async fn run_status(json: bool) -> anyhow::Result<()> {
    let reports = query_hosts().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No running hosts.");
        return Ok(());
    }

    for report in &reports {
        println!(
            "Host PID {} (up {}, {} allocated port(s))",
            report.pid,
            format_duration(report.uptime_secs),
            report.allocated_ports
        );
        print_sessions_table(&report.sessions);
        println!();
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_status(_json: bool) -> anyhow::Result<()> {
    anyhow::bail!("Host control is unavailable on this platform")
}

#[cfg(unix)]
async fn run_close(session_id: Option<&str>, all: bool) -> anyhow::Result<()> {
    use bridgeme::ipc::{discover_hosts, IpcClient, IpcError};

    let hosts = discover_hosts();

    if all {
        let (closed, failures) = close_all_sessions(&hosts).await;
        println!("Closed {} session(s).", closed.len());
        if !failures.is_empty() {
            anyhow::bail!("{} host(s) could not be reached: {}", failures.len(), failures.join("; "));
        }
        return Ok(());
    }

    let session_id = session_id.ok_or_else(|| anyhow::anyhow!("a session ID or --all is required"))?;
    let mut failures = Vec::new();
    for host in &hosts {
        let mut client = match IpcClient::connect(&host.path).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(pid = host.pid, error = %e, "Host did not answer");
                failures.push(format!("pid {}: {}", host.pid, e));
                continue;
            }
        };
        match client.close_session(session_id).await {
            Ok(id) => {
                println!("Closed session {}", id);
                return Ok(());
            }
            Err(IpcError::Remote(message)) => {
                tracing::debug!(pid = host.pid, %message, "Session not on this host");
            }
            Err(e) => {
                tracing::warn!(pid = host.pid, error = %e, "Host did not answer");
                failures.push(format!("pid {}: {}", host.pid, e));
            }
        }
    }
    if !failures.is_empty() {
        anyhow::bail!(
            "session not found: {} ({} host(s) could not be reached: {})",
            session_id,
            failures.len(),
            failures.join("; ")
        );
    }
    anyhow::bail!("session not found: {}", session_id)
}

/// Closes every session on every host that answers.
///
/// Returns the closed session IDs and one message per unreachable host.
#[cfg(unix)]
async fn close_all_sessions(hosts: &[bridgeme::ipc::HostSocket]) -> (Vec<String>, Vec<String>) {
    use bridgeme::ipc::{IpcClient, IpcError};

    let mut closed = Vec::new();
    let mut failures = Vec::new();
    for host in hosts {
        let result = async {
            let mut client = IpcClient::connect(&host.path).await?;
            Ok::<_, IpcError>(client.close_all().await?)
        };
        match result.await {
            Ok(ids) => {
                for id in ids {
                    println!("Closed session {}", id);
                    closed.push(id);
                }
            }
            Err(e) => {
                tracing::warn!(pid = host.pid, error = %e, "Host did not answer");
                failures.push(format!("pid {}: {}", host.pid, e));
            }
        }
    }
    (closed, failures)
}

#[cfg(not(unix))]
async fn run_close(_session_id: Option<&str>, _all: bool) -> anyhow::Result<()> {
    anyhow::bail!("Host control is unavailable on this platform")
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    println!(
        "{:<10}  {:<13}  {:>9}  {:>10}  {:>10}",
        "ID", "STATUS", "HOST PORT", "RELAY PORT", "AGE"
    );
    println!("{}", "-".repeat(60));

    for session in sessions {
        let relay_port = session
            .relay_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<10}  {:<13}  {:>9}  {:>10}  {:>10}",
            session.id,
            session.status.as_str(),
            session.host_port,
            relay_port,
            format_duration(session.age_secs)
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_host_command() {
        let cli = Cli::try_parse_from(["bridgeme", "host", "user@relay.example.com:2222"]).unwrap();
        assert_eq!(
            cli.resolved_command(),
            Some(Commands::Host {
                destination: "user@relay.example.com:2222".to_string()
            })
        );
    }

    #[test]
    fn test_legacy_host_flag() {
        let cli = Cli::try_parse_from(["bridgeme", "--host", "relay.example.com", "-u", "bob"]).unwrap();
        assert_eq!(
            cli.resolved_command(),
            Some(Commands::Host {
                destination: "relay.example.com".to_string()
            })
        );
        assert_eq!(cli.username.as_deref(), Some("bob"));
    }

    #[test]
    fn test_legacy_flag_conflicts_with_subcommand() {
        assert!(Cli::try_parse_from(["bridgeme", "--host", "relay", "status"]).is_err());
    }

    #[test]
    fn test_connect_with_options() {
        let cli = Cli::try_parse_from([
            "bridgeme",
            "connect",
            "relay.example.com:23456",
            "-u",
            "alice",
            "-k",
            "/keys/id_ed25519",
            "-v",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Connect {
                target: "relay.example.com:23456".to_string()
            })
        );
        assert_eq!(cli.username.as_deref(), Some("alice"));
        assert_eq!(cli.key_file, Some(PathBuf::from("/keys/id_ed25519")));
        assert!(cli.verbose);
        assert!(!cli.debug);
    }

    #[test]
    fn test_status_json() {
        let cli = Cli::try_parse_from(["bridgeme", "status", "--json"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Status { json: true }));
    }

    #[test]
    fn test_close_requires_id_or_all() {
        assert!(Cli::try_parse_from(["bridgeme", "close"]).is_err());
        assert!(Cli::try_parse_from(["bridgeme", "close", "abcd1234", "--all"]).is_err());

        let cli = Cli::try_parse_from(["bridgeme", "close", "--all"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Close {
                session_id: None,
                all: true
            })
        );

        let cli = Cli::try_parse_from(["bridgeme", "close", "abcd1234"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Close {
                session_id: Some("abcd1234".to_string()),
                all: false
            })
        );
    }

    #[test]
    fn test_no_command() {
        let cli = Cli::try_parse_from(["bridgeme"]).unwrap();
        assert_eq!(cli.resolved_command(), None);
    }

    #[test]
    fn test_config_and_debug_flags() {
        let cli = Cli::try_parse_from(["bridgeme", "--debug", "-c", "/etc/bridgeme.toml", "version"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bridgeme.toml")));
        assert_eq!(cli.command, Some(Commands::Version));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[cfg(unix)]
    struct CloseAllHandler;

    #[cfg(unix)]
    impl bridgeme::ipc::IpcHandler for CloseAllHandler {
        fn handle(&self, request: bridgeme::ipc::IpcRequest) -> bridgeme::ipc::IpcResponse {
            use bridgeme::ipc::{IpcRequest, IpcResponse};

            match request {
                IpcRequest::CloseAll => IpcResponse::SessionsClosed {
                    session_ids: vec!["abcd1234".to_string()],
                },
                _ => IpcResponse::Error {
                    message: "unsupported".to_string(),
                },
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_all_skips_unreachable_hosts() {
        use bridgeme::ipc::{HostSocket, IpcServer};
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::TempDir::new().unwrap();
        let live = dir.path().join("host-200.sock");
        let server = IpcServer::bind(&live).await.unwrap();
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(server.serve(Arc::new(CloseAllHandler), cancel.clone()));

        let hosts = vec![
            HostSocket {
                pid: 100,
                path: dir.path().join("host-100.sock"),
            },
            HostSocket { pid: 200, path: live },
        ];
        let (closed, failures) = close_all_sessions(&hosts).await;

        assert_eq!(closed, vec!["abcd1234".to_string()]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("pid 100"));

        cancel.cancel();
        serving.await.unwrap();
    }
}

//! # BridgeMe
//!
//! Share a local interactive shell with a remote operator through an SSH
//! server that does nothing but relay TCP.
//!
//! ## Overview
//!
//! - **Host mode** allocates a session, serves shells on a local port and
//!   registers a reverse tunnel on the relay that leads to that port.
//! - **Client mode** opens a direct channel through the same relay to the
//!   tunnel's port and forwards the local terminal over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────── host process ──────────────────────────┐
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐ │
//! │  │   Session    │   │    Shell     │   │  Terminal provider   │ │
//! │  │   Manager    │◄──│    Server    │──►│   (PTY or pipes)     │ │
//! │  └──────▲───────┘   └──────▲───────┘   └──────────────────────┘ │
//! │         │                  │ localhost:host_port                │
//! │  ┌──────┴──────────────────┴───────┐   ┌──────────────────────┐ │
//! │  │   Relay manager + tunnels       │   │  IPC control socket  │ │
//! │  └──────────────┬──────────────────┘   └──────────────────────┘ │
//! └─────────────────┼───────────────────────────────────────────────┘
//!                   │ SSH, remote listener on relay_port
//!            ┌──────▼──────┐
//!            │ relay sshd  │◄──── direct channel ──── client process
//!            └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bridgeme::host::HostCoordinator;
//! use bridgeme::relay::{RelayTarget, SshConnector};
//! use bridgeme::Config;
//! use protocol::RelayDestination;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let destination = RelayDestination::parse_valid("user@relay.example.com")?;
//!     let target = RelayTarget::resolve(&destination, None, None, &config);
//!
//!     let host = HostCoordinator::new(config, target, Arc::new(SshConnector))?;
//!     let ready = host.start().await?;
//!     println!("{}", ready.banner());
//!
//!     host.wait(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//!     host.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session table and port pool
//! - [`terminal`]: Shell spawning on a PTY or pipes
//! - [`forward`]: Cancellable byte forwarding
//! - [`shell_server`]: Local listener handing out shells
//! - [`relay`]: SSH relay connection, reverse tunnels
//! - [`client`]: Client side of the relay
//! - [`ipc`]: Control socket of host processes
//! - [`host`]: Host-mode coordinator
//! - [`logging`]: Subscriber setup

pub mod client;
pub mod config;
pub mod forward;
pub mod host;
pub mod ipc;
pub mod logging;
pub mod relay;
pub mod session;
pub mod shell_server;
pub mod terminal;

// Re-export protocol for convenience
pub use protocol;

pub use client::{ClientRelay, RetryPolicy};
pub use config::Config;
pub use host::{ExitReason, HostCoordinator, HostState, ReadyInfo};
pub use relay::{RelayConnection, RelayConnector, RelayManager, RelayTarget, SshConnector};
pub use session::{SessionEvent, SessionManager, SessionManagerSettings};
pub use shell_server::ShellServer;
pub use terminal::{TerminalProvider, TerminalSession};

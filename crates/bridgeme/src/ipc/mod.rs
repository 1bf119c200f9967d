//! Unix Domain Socket IPC between the CLI and running host processes.
//!
//! Each host process serves a control socket so that `bridgeme status` and
//! `bridgeme close` can reach sessions living in another process.
//!
//! ## Protocol
//!
//! Newline-delimited JSON: each message is a single JSON object followed by
//! a newline, and every [`IpcRequest`] is answered by one [`IpcResponse`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridgeme::ipc::{discover_hosts, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     for host in discover_hosts() {
//!         let mut client = IpcClient::connect(&host.path).await?;
//!         for session in client.list_sessions().await? {
//!             println!("{} {}", session.id, session.status);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod messages;

#[cfg(unix)]
mod client;
#[cfg(unix)]
pub mod discovery;
#[cfg(unix)]
mod server;

pub use messages::{IpcRequest, IpcResponse};

#[cfg(unix)]
pub use client::{HostStatus, IpcClient};
#[cfg(unix)]
pub use discovery::{discover_hosts, host_socket_path, HostSocket};
#[cfg(unix)]
pub use server::{IpcConnection, IpcError, IpcHandler, IpcServer};

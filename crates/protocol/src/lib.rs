//! # BridgeMe Protocol Library
//!
//! Shared vocabulary for the BridgeMe relay shell:
//!
//! - **Errors**: the single [`BridgeError`] enumeration and its [`ErrorKind`] tag
//! - **Sessions**: [`SessionStatus`] state machine and the [`SessionInfo`] /
//!   [`SessionStats`] snapshots carried over IPC
//! - **Destinations**: `[user@]host[:port]` parsing for relay servers
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{RelayDestination, SessionStatus};
//!
//! let dest = RelayDestination::parse("user@relay.example.com:2222");
//! assert_eq!(dest.hostname, "relay.example.com");
//! assert_eq!(dest.ssh_port(), 2222);
//!
//! assert!(SessionStatus::Waiting.can_transition_to(SessionStatus::Connected));
//! ```

pub mod destination;
pub mod error;
pub mod session;

pub use destination::{
    format_connection_string, split_client_target, validate_ssh_destination, RelayDestination,
    DEFAULT_SSH_PORT,
};
pub use error::{BoxError, BridgeError, ErrorKind, Result};
pub use session::{ClientInfo, SessionId, SessionInfo, SessionStats, SessionStatus};

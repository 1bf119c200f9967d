//! Session management module.
//!
//! This module tracks host-mode sessions: their ports, lifecycle status and
//! activity. Terminals attached to a session live in [`crate::terminal`].

pub mod manager;

pub use manager::{SessionEvent, SessionManager, SessionManagerSettings};
pub use protocol::{SessionId, SessionInfo, SessionStats, SessionStatus};

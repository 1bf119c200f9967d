//! IPC message types for host control.
//!
//! Requests are sent by `bridgeme status` / `bridgeme close` to a running
//! host process; every request gets exactly one response.

use protocol::{SessionId, SessionInfo, SessionStats};
use serde::{Deserialize, Serialize};

/// Requests a controlling CLI can send to a host process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpcRequest {
    /// Check if the host is alive.
    Ping,
    /// Get the host's process and session statistics.
    Status,
    /// List all active sessions.
    ListSessions,
    /// Close one session by ID.
    CloseSession {
        /// The session to close.
        session_id: SessionId,
    },
    /// Close every session of the host.
    CloseAll,
}

/// Responses sent from a host process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Host statistics.
    Status {
        /// Host process id.
        pid: u32,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Session table statistics.
        stats: SessionStats,
    },
    /// Active sessions, oldest first.
    Sessions {
        /// Snapshot of each session.
        sessions: Vec<SessionInfo>,
    },
    /// Confirmation that a session was closed.
    SessionClosed {
        /// The closed session.
        session_id: SessionId,
    },
    /// Confirmation for [`IpcRequest::CloseAll`].
    SessionsClosed {
        /// Every session that was closed.
        session_ids: Vec<SessionId>,
    },
    /// The request could not be served.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

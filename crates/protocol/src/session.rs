//! Session snapshot types.
//!
//! These are the read-only views of host sessions that leave the session
//! manager: they are printed by the CLI, carried over IPC, and used by the
//! host-mode banner.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a session.
pub type SessionId = String;

/// Auxiliary client-connection metadata attached to a session.
pub type ClientInfo = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a host session.
///
/// ```text
/// initializing -> waiting -> connected <-> disconnected
///       \            \           \              \
///        `------------`-----------`--------------`--> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Ports allocated, shell server not yet listening.
    Initializing,
    /// Shell server listening, no client attached yet.
    Waiting,
    /// At least one client is attached.
    Connected,
    /// The last client detached; the session stays alive for reconnection.
    Disconnected,
    /// Terminal state, ports released.
    Closed,
}

impl SessionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Initializing,
        SessionStatus::Waiting,
        SessionStatus::Connected,
        SessionStatus::Disconnected,
        SessionStatus::Closed,
    ];

    /// Returns the lowercase name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Closed => "closed",
        }
    }

    /// Returns whether moving from `self` to `next` is allowed.
    ///
    /// Re-entering the current status is allowed (it only refreshes activity),
    /// except for `closed`, which is final.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (current, next) if *current == next => true,
            (Initializing, Waiting) => true,
            (Waiting, Connected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }

    /// Returns whether the session is still considered active.
    pub fn is_active(&self) -> bool {
        *self != SessionStatus::Closed
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown session status: {}", s))
    }
}

/// Snapshot of a host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier (8 characters).
    pub id: SessionId,
    /// Local port the shell server binds.
    pub host_port: u16,
    /// Remote port on the relay server, once assigned.
    pub relay_port: Option<u16>,
    /// Relay server destination as given by the operator.
    pub relay_server: Option<String>,
    /// SSH username used against the relay.
    pub username: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Unix timestamp (seconds) when the session was created.
    pub created_at: u64,
    /// Seconds since the session was created.
    pub age_secs: u64,
    /// Seconds since the last recorded activity.
    pub idle_secs: u64,
    /// Auxiliary client metadata (e.g. `client_address`).
    #[serde(default)]
    pub client_info: ClientInfo,
}

impl SessionInfo {
    /// Session age in fractional minutes.
    pub fn age_minutes(&self) -> f64 {
        self.age_secs as f64 / 60.0
    }
}

/// Aggregate statistics over the active sessions of one session manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Number of active sessions.
    pub total_sessions: usize,
    /// Number of ports currently held (host and relay).
    pub allocated_ports: usize,
    /// Active sessions grouped by status.
    pub sessions_by_status: BTreeMap<SessionStatus, usize>,
    /// Age in seconds of the oldest active session.
    pub oldest_session_secs: Option<u64>,
    /// Age in seconds of the newest active session.
    pub newest_session_secs: Option<u64>,
}

impl SessionStats {
    /// Folds another manager's statistics into this one.
    pub fn merge(&mut self, other: &SessionStats) {
        self.total_sessions += other.total_sessions;
        self.allocated_ports += other.allocated_ports;
        for (status, count) in &other.sessions_by_status {
            *self.sessions_by_status.entry(*status).or_insert(0) += count;
        }
        self.oldest_session_secs = match (self.oldest_session_secs, other.oldest_session_secs) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.newest_session_secs = match (self.newest_session_secs, other.newest_session_secs) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

//! Error types shared by every BridgeMe component.
//!
//! All core failures are expressed as a single [`BridgeError`] enumeration.
//! Call sites that need to react differently to different failures branch on
//! [`BridgeError::kind`] rather than matching individual variants.

use std::fmt;

use thiserror::Error;

/// Boxed error used as the optional wrapped cause of a [`BridgeError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Every credential was rejected by the relay server.
    Authentication,
    /// Network or SSH transport failure.
    Connection,
    /// Remote listener registration or inbound channel handling failed.
    Tunnel,
    /// Unknown session or invalid session state transition.
    Session,
    /// The port pool is exhausted.
    PortAllocation,
    /// Shell spawn or terminal I/O failure.
    Terminal,
}

impl ErrorKind {
    /// Returns the stable name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Tunnel => "TunnelError",
            ErrorKind::Session => "SessionError",
            ErrorKind::PortAllocation => "PortAllocationError",
            ErrorKind::Terminal => "TerminalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type covering all failure modes of the relay, tunnel, session and
/// terminal layers.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Relay errors
    /// All authentication methods were exhausted.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport-level failure talking to the relay server.
    #[error("connection failed: {message}")]
    Connection {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Reverse tunnel setup or channel handling failed.
    #[error("tunnel error: {message}")]
    Tunnel {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    // Session errors
    /// Session with the given ID was not found.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The missing session identifier.
        session_id: String,
    },

    /// Any other session bookkeeping failure.
    #[error("session error: {0}")]
    Session(String),

    /// No free port could be found.
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    // Terminal errors
    /// Shell spawn or PTY I/O failure.
    #[error("terminal error: {message}")]
    Terminal {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },
}

/// Result type alias for BridgeMe operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Returns the kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Authentication(_) => ErrorKind::Authentication,
            BridgeError::Connection { .. } => ErrorKind::Connection,
            BridgeError::Tunnel { .. } => ErrorKind::Tunnel,
            BridgeError::SessionNotFound { .. } | BridgeError::Session(_) => ErrorKind::Session,
            BridgeError::PortAllocation(_) => ErrorKind::PortAllocation,
            BridgeError::Terminal { .. } => ErrorKind::Terminal,
        }
    }

    /// Creates a connection error without a cause.
    pub fn connection(message: impl Into<String>) -> Self {
        BridgeError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a connection error wrapping `source`.
    pub fn connection_with(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        BridgeError::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a tunnel error without a cause.
    pub fn tunnel(message: impl Into<String>) -> Self {
        BridgeError::Tunnel {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a tunnel error wrapping `source`.
    pub fn tunnel_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BridgeError::Tunnel {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a terminal error without a cause.
    pub fn terminal(message: impl Into<String>) -> Self {
        BridgeError::Terminal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a terminal error wrapping `source`.
    pub fn terminal_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BridgeError::Terminal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a session-not-found error.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        BridgeError::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Returns true if this error came from credential exhaustion.
    pub fn is_authentication(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }
}

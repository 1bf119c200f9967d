//! Relay destination parsing.
//!
//! Destinations are written the way `ssh` accepts them: `[user@]host[:port]`.
//! Client mode appends the relay port: `[user@]host[:ssh_port]:relay_port`.

use std::fmt;

use crate::error::BridgeError;

/// Default SSH port used when a destination omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A parsed `[user@]host[:port]` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDestination {
    /// Username before the `@`, if any.
    pub username: Option<String>,
    /// Host name or address.
    pub hostname: String,
    /// Port after the last `:`, if numeric.
    pub port: Option<u32>,
}

impl RelayDestination {
    /// Parses a destination string.
    ///
    /// The string is split on the first `@` and then on the last `:`. A
    /// non-numeric port segment means the whole remainder is the hostname.
    pub fn parse(destination: &str) -> Self {
        let (username, rest) = match destination.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, destination),
        };

        let (hostname, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u32>() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (rest.to_string(), None),
            },
            None => (rest.to_string(), None),
        };

        Self {
            username,
            hostname,
            port,
        }
    }

    /// Parses and validates a destination.
    pub fn parse_valid(destination: &str) -> Result<Self, BridgeError> {
        let parsed = Self::parse(destination);
        parsed.validate().map_err(|reason| {
            BridgeError::connection(format!(
                "invalid SSH destination '{}': {}",
                destination, reason
            ))
        })?;
        Ok(parsed)
    }

    /// Checks that the hostname is present and the port, if given, is in range.
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.trim().is_empty() {
            return Err("hostname is required".to_string());
        }
        if let Some(port) = self.port {
            if !(1..=65535).contains(&port) {
                return Err(format!("port {} is out of range 1-65535", port));
            }
        }
        Ok(())
    }

    /// Returns the SSH port, defaulting to 22.
    pub fn ssh_port(&self) -> u16 {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_SSH_PORT)
    }
}

impl fmt::Display for RelayDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.hostname)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Returns true if `destination` parses into a usable relay destination.
pub fn validate_ssh_destination(destination: &str) -> bool {
    RelayDestination::parse(destination).validate().is_ok()
}

/// Splits a client-mode target `[user@]host[:ssh_port]:relay_port` into the
/// SSH destination and the relay port.
pub fn split_client_target(target: &str) -> Result<(RelayDestination, u16), BridgeError> {
    let (server, port_str) = target.rsplit_once(':').ok_or_else(|| {
        BridgeError::connection("client destination must be in format SSH_SERVER:PORT")
    })?;

    let relay_port = port_str
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| BridgeError::connection(format!("invalid port number: {}", port_str)))?;

    let destination = RelayDestination::parse_valid(server)?;
    Ok((destination, relay_port))
}

/// Formats a connection string for display: `user@host:port` or `host:port`.
pub fn format_connection_string(hostname: &str, port: u16, username: Option<&str>) -> String {
    match username {
        Some(user) => format!("{}@{}:{}", user, hostname, port),
        None => format!("{}:{}", hostname, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let dest = RelayDestination::parse("alice@relay.example.com:2222");
        assert_eq!(dest.username.as_deref(), Some("alice"));
        assert_eq!(dest.hostname, "relay.example.com");
        assert_eq!(dest.port, Some(2222));
        assert_eq!(dest.ssh_port(), 2222);
    }

    #[test]
    fn test_parse_host_only() {
        let dest = RelayDestination::parse("relay.example.com");
        assert_eq!(dest.username, None);
        assert_eq!(dest.hostname, "relay.example.com");
        assert_eq!(dest.port, None);
        assert_eq!(dest.ssh_port(), DEFAULT_SSH_PORT);
    }

    #[test]
    fn test_parse_user_without_port() {
        let dest = RelayDestination::parse("user@relay.example.com");
        assert_eq!(dest.username.as_deref(), Some("user"));
        assert_eq!(dest.hostname, "relay.example.com");
        assert_eq!(dest.port, None);
    }

    #[test]
    fn test_parse_non_numeric_port_is_hostname() {
        let dest = RelayDestination::parse("host:abc");
        assert_eq!(dest.hostname, "host:abc");
        assert_eq!(dest.port, None);
    }

    #[test]
    fn test_parse_splits_on_first_at() {
        let dest = RelayDestination::parse("a@b@host:22");
        assert_eq!(dest.username.as_deref(), Some("a"));
        assert_eq!(dest.hostname, "b@host");
        assert_eq!(dest.port, Some(22));
    }

    #[test]
    fn test_validate() {
        assert!(validate_ssh_destination("relay.example.com"));
        assert!(validate_ssh_destination("user@relay.example.com:22"));
        assert!(!validate_ssh_destination(""));
        assert!(!validate_ssh_destination("user@"));
        assert!(!validate_ssh_destination("host:0"));
        assert!(!validate_ssh_destination("host:70000"));
        assert!(validate_ssh_destination("host:65535"));
    }

    #[test]
    fn test_parse_valid_rejects_bad_port() {
        let err = RelayDestination::parse_valid("host:99999").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["relay.example.com", "bob@host", "bob@host:2200", "host:22"] {
            assert_eq!(RelayDestination::parse(input).to_string(), input);
        }
    }

    #[test]
    fn test_split_client_target() {
        let (dest, port) = split_client_target("relay.example.com:12345").unwrap();
        assert_eq!(dest.hostname, "relay.example.com");
        assert_eq!(dest.port, None);
        assert_eq!(port, 12345);

        let (dest, port) = split_client_target("bob@relay.example.com:2222:40000").unwrap();
        assert_eq!(dest.username.as_deref(), Some("bob"));
        assert_eq!(dest.port, Some(2222));
        assert_eq!(port, 40000);
    }

    #[test]
    fn test_split_client_target_errors() {
        assert!(split_client_target("relay.example.com").is_err());
        assert!(split_client_target("relay.example.com:notaport").is_err());
        assert!(split_client_target("relay.example.com:0").is_err());
        assert!(split_client_target(":4000").is_err());
    }

    #[test]
    fn test_format_connection_string() {
        assert_eq!(
            format_connection_string("relay.example.com", 4000, Some("bob")),
            "bob@relay.example.com:4000"
        );
        assert_eq!(
            format_connection_string("relay.example.com", 4000, None),
            "relay.example.com:4000"
        );
    }
}

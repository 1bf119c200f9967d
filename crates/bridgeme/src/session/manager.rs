//! Session manager for host-mode sessions.
//!
//! This module provides a thread-safe session table together with the pool
//! of ports allocated to live sessions. Ports are released the moment a
//! session is closed so they can be handed out again immediately.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protocol::{BridgeError, ClientInfo, Result, SessionId, SessionInfo, SessionStats, SessionStatus};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications published by the [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created.
    Created(SessionId),
    /// A session moved to a new status.
    StatusChanged {
        session_id: SessionId,
        status: SessionStatus,
    },
    /// A session was closed and its ports released.
    Closed(SessionId),
}

/// Port pool settings for a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionManagerSettings {
    /// Candidate ports, start inclusive, end exclusive.
    pub port_range: Range<u16>,
    /// Random probes before allocation gives up.
    pub max_port_attempts: u32,
}

impl Default for SessionManagerSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionManagerSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            port_range: config.port_range_start..config.port_range_end,
            max_port_attempts: config.max_port_attempts,
        }
    }
}

/// A live session record.
#[derive(Debug)]
struct Session {
    id: SessionId,
    host_port: u16,
    relay_port: Option<u16>,
    relay_server: Option<String>,
    username: Option<String>,
    status: SessionStatus,
    created_at: u64,
    created: Instant,
    last_activity: Instant,
    client_info: ClientInfo,
}

impl Session {
    fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host_port: self.host_port,
            relay_port: self.relay_port,
            relay_server: self.relay_server.clone(),
            username: self.username.clone(),
            status: self.status,
            created_at: self.created_at,
            age_secs: self.created.elapsed().as_secs(),
            idle_secs: self.last_activity.elapsed().as_secs(),
            client_info: self.client_info.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// State guarded by the manager's single mutex.
#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    allocated_ports: HashSet<u16>,
}

/// Thread-safe session manager.
///
/// The session table and the allocated port set share one mutex. It is only
/// held for the table mutation itself; bind probes and event delivery happen
/// outside of it.
pub struct SessionManager {
    table: Mutex<SessionTable>,
    settings: SessionManagerSettings,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Creates a new session manager.
    pub fn new(settings: SessionManagerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            table: Mutex::new(SessionTable::default()),
            settings,
            events,
        }
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionTable>> {
        self.table
            .lock()
            .map_err(|_| BridgeError::Session("session table lock poisoned".to_string()))
    }

    /// Read-only snapshots tolerate a poisoned lock since they mutate nothing.
    fn read(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Creates a new session with a freshly allocated host port.
    pub fn create_session(
        &self,
        relay_server: Option<String>,
        username: Option<String>,
    ) -> Result<SessionInfo> {
        let host_port = self.allocate_port()?;

        let info = {
            let mut table = match self.lock() {
                Ok(table) => table,
                Err(e) => {
                    self.release_port(host_port);
                    return Err(e);
                }
            };

            let id = loop {
                let candidate = new_session_id();
                if !table.sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let now = Instant::now();
            let session = Session {
                id: id.clone(),
                host_port,
                relay_port: None,
                relay_server,
                username,
                status: SessionStatus::Initializing,
                created_at: unix_now(),
                created: now,
                last_activity: now,
                client_info: ClientInfo::new(),
            };
            let info = session.snapshot();
            table.sessions.insert(id, session);
            info
        };

        tracing::info!(
            session_id = %info.id,
            host_port = info.host_port,
            "Created session"
        );
        self.publish(SessionEvent::Created(info.id.clone()));

        Ok(info)
    }

    /// Returns the relay port of a session, allocating one on first use.
    pub fn allocate_relay_port(&self, session_id: &str) -> Result<u16> {
        {
            let table = self.lock()?;
            let session = table
                .sessions
                .get(session_id)
                .ok_or_else(|| BridgeError::session_not_found(session_id))?;
            if let Some(port) = session.relay_port {
                return Ok(port);
            }
        }

        let port = self.allocate_port()?;

        let mut table = self.lock()?;
        let outcome = table
            .sessions
            .get_mut(session_id)
            .map(|session| match session.relay_port {
                // Lost a race with a concurrent allocation for the same session.
                Some(existing) => existing,
                None => {
                    session.relay_port = Some(port);
                    session.touch();
                    port
                }
            });

        match outcome {
            Some(assigned) if assigned == port => {
                drop(table);
                tracing::debug!(session_id = %session_id, relay_port = port, "Allocated relay port");
                Ok(port)
            }
            Some(existing) => {
                table.allocated_ports.remove(&port);
                Ok(existing)
            }
            None => {
                table.allocated_ports.remove(&port);
                Err(BridgeError::session_not_found(session_id))
            }
        }
    }

    /// Releases a session's relay port, if any.
    ///
    /// Used to roll back a tunnel whose remote listener could not be set up.
    pub fn release_relay_port(&self, session_id: &str) -> Result<Option<u16>> {
        let mut table = self.lock()?;
        let released = table
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BridgeError::session_not_found(session_id))?
            .relay_port
            .take();
        if let Some(port) = released {
            table.allocated_ports.remove(&port);
        }
        Ok(released)
    }

    /// Moves a session to `status` without extra fields.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.update_status(session_id, status, Vec::new())
    }

    /// Moves a session to `status`, applying any extra fields.
    ///
    /// `relay_port`, `relay_server` and `username` update the matching
    /// attributes; every other field is stored in the session's client info.
    pub fn update_status<I>(&self, session_id: &str, status: SessionStatus, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let previous = {
            let mut table = self.lock()?;
            let SessionTable {
                sessions,
                allocated_ports,
            } = &mut *table;

            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| BridgeError::session_not_found(session_id))?;

            if !session.status.can_transition_to(status) {
                return Err(BridgeError::Session(format!(
                    "invalid status transition for session {}: {} -> {}",
                    session_id, session.status, status
                )));
            }

            let fields: Vec<(String, serde_json::Value)> = fields.into_iter().collect();

            // Validate the relay port before touching anything.
            let mut relay_port = None;
            for (key, value) in &fields {
                if key == "relay_port" {
                    let port = value
                        .as_u64()
                        .and_then(|p| u16::try_from(p).ok())
                        .filter(|p| *p != 0)
                        .ok_or_else(|| {
                            BridgeError::Session(format!("invalid relay_port value: {}", value))
                        })?;
                    if session.relay_port != Some(port) && allocated_ports.contains(&port) {
                        return Err(BridgeError::Session(format!(
                            "relay port {} is already allocated",
                            port
                        )));
                    }
                    relay_port = Some(port);
                }
            }

            if let Some(port) = relay_port {
                if let Some(old) = session.relay_port.replace(port) {
                    allocated_ports.remove(&old);
                }
                allocated_ports.insert(port);
            }

            for (key, value) in fields {
                match key.as_str() {
                    "relay_port" => {}
                    "relay_server" => session.relay_server = value.as_str().map(str::to_string),
                    "username" => session.username = value.as_str().map(str::to_string),
                    _ => {
                        session.client_info.insert(key, value);
                    }
                }
            }

            let previous = session.status;
            session.status = status;
            session.touch();
            previous
        };

        if previous != status {
            tracing::info!(
                session_id = %session_id,
                from = %previous,
                to = %status,
                "Session status changed"
            );
            self.publish(SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                status,
            });
        }

        Ok(())
    }

    /// Records activity on a session.
    pub fn touch(&self, session_id: &str) -> Result<()> {
        let mut table = self.lock()?;
        let session = table
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BridgeError::session_not_found(session_id))?;
        session.touch();
        Ok(())
    }

    /// Returns a snapshot of a session.
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.read().sessions.get(session_id).map(Session::snapshot)
    }

    /// Closes a session and frees its ports.
    ///
    /// Returns `false` if no such session exists.
    pub fn close_session(&self, session_id: &str) -> Result<bool> {
        let removed = {
            let mut table = self.lock()?;
            let removed = table.sessions.remove(session_id);
            if let Some(session) = &removed {
                table.allocated_ports.remove(&session.host_port);
                if let Some(relay_port) = session.relay_port {
                    table.allocated_ports.remove(&relay_port);
                }
            }
            removed
        };

        match removed {
            Some(session) => {
                tracing::info!(
                    session_id = %session.id,
                    host_port = session.host_port,
                    relay_port = ?session.relay_port,
                    "Closed session"
                );
                self.publish(SessionEvent::Closed(session.id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lists every session that is not closed, oldest first.
    pub fn list_active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .read()
            .sessions
            .values()
            .filter(|s| s.status.is_active())
            .map(Session::snapshot)
            .collect();
        sessions.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Closes every session idle for longer than `timeout`.
    ///
    /// Returns the number of sessions reaped.
    pub fn cleanup_expired(&self, timeout: Duration) -> Result<usize> {
        let expired: Vec<SessionId> = {
            let table = self.lock()?;
            table
                .sessions
                .values()
                .filter(|s| s.last_activity.elapsed() > timeout)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut reaped = 0;
        for session_id in expired {
            if self.close_session(&session_id)? {
                tracing::info!(session_id = %session_id, "Expired idle session");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Starts a background task that periodically reaps expired sessions.
    ///
    /// A failed sweep is retried after `retry` instead of `interval`. The task
    /// stops when `cancel` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        retry: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                delay = match manager.cleanup_expired(timeout) {
                    Ok(0) => interval,
                    Ok(reaped) => {
                        tracing::info!(reaped, "Session cleanup completed");
                        interval
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, retry_secs = retry.as_secs(), "Session cleanup failed");
                        retry
                    }
                };
            }
            tracing::debug!("Session cleanup task stopped");
        })
    }

    /// Returns aggregate statistics over the active sessions.
    pub fn get_session_stats(&self) -> SessionStats {
        let table = self.read();
        let mut stats = SessionStats {
            total_sessions: table.sessions.len(),
            allocated_ports: table.allocated_ports.len(),
            ..Default::default()
        };

        for session in table.sessions.values() {
            *stats.sessions_by_status.entry(session.status).or_insert(0) += 1;
            let age = session.created.elapsed().as_secs();
            stats.oldest_session_secs = Some(stats.oldest_session_secs.map_or(age, |a| a.max(age)));
            stats.newest_session_secs = Some(stats.newest_session_secs.map_or(age, |a| a.min(age)));
        }

        stats
    }

    /// Returns whether `port` is currently held by a session.
    pub fn is_port_allocated(&self, port: u16) -> bool {
        self.read().allocated_ports.contains(&port)
    }

    /// Closes every remaining session. Returns how many were closed.
    pub fn shutdown(&self) -> Result<usize> {
        let ids: Vec<SessionId> = self.lock()?.sessions.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.close_session(&id)? {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(closed, "Session manager shut down");
        }
        Ok(closed)
    }

    /// Reserves a free port from the configured range.
    ///
    /// Candidates are chosen at random, skipped if already reserved, and
    /// probed for bindability on localhost outside the lock.
    fn allocate_port(&self) -> Result<u16> {
        let range = self.settings.port_range.clone();
        if range.is_empty() {
            return Err(BridgeError::PortAllocation(format!(
                "empty port range {}-{}",
                range.start, range.end
            )));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.settings.max_port_attempts {
            let candidate = rng.gen_range(range.clone());

            if self.lock()?.allocated_ports.contains(&candidate) {
                continue;
            }

            if !is_port_bindable(candidate) {
                continue;
            }

            // Re-check: another caller may have taken it while we probed.
            if self.lock()?.allocated_ports.insert(candidate) {
                return Ok(candidate);
            }
        }

        Err(BridgeError::PortAllocation(format!(
            "no free port in {}-{} after {} attempts",
            range.start, range.end, self.settings.max_port_attempts
        )))
    }

    fn release_port(&self, port: u16) {
        self.read().allocated_ports.remove(&port);
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionManagerSettings::default())
    }
}

fn is_port_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn small_range(start: u16, end: u16) -> SessionManagerSettings {
        SessionManagerSettings {
            port_range: start..end,
            max_port_attempts: 100,
        }
    }

    #[test]
    fn test_create_session() {
        let manager = SessionManager::default();
        let info = manager
            .create_session(Some("relay.example.com".into()), Some("alice".into()))
            .unwrap();

        assert_eq!(info.id.len(), 8);
        assert_eq!(info.status, SessionStatus::Initializing);
        assert!((10000..65000).contains(&info.host_port));
        assert_eq!(info.relay_port, None);
        assert_eq!(info.relay_server.as_deref(), Some("relay.example.com"));
        assert_eq!(info.username.as_deref(), Some("alice"));
        assert!(manager.is_port_allocated(info.host_port));
    }

    #[test]
    fn test_host_ports_unique() {
        let manager = SessionManager::default();
        let mut ports = HashSet::new();
        for _ in 0..20 {
            let info = manager.create_session(None, None).unwrap();
            assert!(ports.insert(info.host_port), "duplicate host port");
        }
        assert_eq!(manager.get_session_stats().allocated_ports, 20);
    }

    #[test]
    fn test_port_exhaustion() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let manager = SessionManager::new(SessionManagerSettings {
            port_range: busy..busy + 1,
            max_port_attempts: 5,
        });

        let err = manager.create_session(None, None).unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::PortAllocation);
    }

    #[test]
    fn test_empty_range_fails() {
        let manager = SessionManager::new(small_range(20000, 20000));
        let err = manager.create_session(None, None).unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::PortAllocation);
    }

    #[test]
    fn test_allocate_relay_port_idempotent() {
        let manager = SessionManager::default();
        let info = manager.create_session(None, None).unwrap();

        let first = manager.allocate_relay_port(&info.id).unwrap();
        let second = manager.allocate_relay_port(&info.id).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, info.host_port);
        assert_eq!(manager.get_session(&info.id).unwrap().relay_port, Some(first));
        assert_eq!(manager.get_session_stats().allocated_ports, 2);
    }

    #[test]
    fn test_release_relay_port() {
        let manager = SessionManager::default();
        let info = manager.create_session(None, None).unwrap();
        let port = manager.allocate_relay_port(&info.id).unwrap();

        assert_eq!(manager.release_relay_port(&info.id).unwrap(), Some(port));
        assert!(!manager.is_port_allocated(port));
        assert_eq!(manager.get_session(&info.id).unwrap().relay_port, None);
        assert_eq!(manager.release_relay_port(&info.id).unwrap(), None);
    }

    #[test]
    fn test_allocate_relay_port_unknown_session() {
        let manager = SessionManager::default();
        let err = manager.allocate_relay_port("missing1").unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotFound { .. }));
    }

    #[test]
    fn test_status_transitions() {
        let manager = SessionManager::default();
        let id = manager.create_session(None, None).unwrap().id;

        manager.set_status(&id, SessionStatus::Waiting).unwrap();
        manager.set_status(&id, SessionStatus::Connected).unwrap();
        manager.set_status(&id, SessionStatus::Disconnected).unwrap();
        manager.set_status(&id, SessionStatus::Connected).unwrap();
        manager.set_status(&id, SessionStatus::Connected).unwrap();

        assert_eq!(manager.get_session(&id).unwrap().status, SessionStatus::Connected);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let manager = SessionManager::default();
        let id = manager.create_session(None, None).unwrap().id;

        let err = manager
            .set_status(&id, SessionStatus::Connected)
            .unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::Session);
        assert_eq!(
            manager.get_session(&id).unwrap().status,
            SessionStatus::Initializing
        );
    }

    #[test]
    fn test_update_status_extra_fields() {
        let manager = SessionManager::default();
        let id = manager.create_session(None, None).unwrap().id;

        manager
            .update_status(
                &id,
                SessionStatus::Waiting,
                [
                    ("client_address".to_string(), json!("127.0.0.1:5555")),
                    ("username".to_string(), json!("bob")),
                    ("relay_server".to_string(), json!("relay.example.com")),
                ],
            )
            .unwrap();

        let info = manager.get_session(&id).unwrap();
        assert_eq!(info.client_info["client_address"], json!("127.0.0.1:5555"));
        assert_eq!(info.username.as_deref(), Some("bob"));
        assert_eq!(info.relay_server.as_deref(), Some("relay.example.com"));
        assert!(!info.client_info.contains_key("username"));
    }

    #[test]
    fn test_update_status_relay_port_field() {
        let manager = SessionManager::new(small_range(30000, 30100));
        let id = manager.create_session(None, None).unwrap().id;

        manager
            .update_status(&id, SessionStatus::Waiting, [("relay_port".to_string(), json!(45000))])
            .unwrap();

        assert_eq!(manager.get_session(&id).unwrap().relay_port, Some(45000));
        assert!(manager.is_port_allocated(45000));

        let err = manager
            .update_status(&id, SessionStatus::Waiting, [("relay_port".to_string(), json!("x"))])
            .unwrap_err();
        assert_eq!(err.kind(), protocol::ErrorKind::Session);
    }

    #[test]
    fn test_update_unknown_session() {
        let manager = SessionManager::default();
        let err = manager
            .set_status("nope0000", SessionStatus::Waiting)
            .unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotFound { .. }));
        assert!(manager.touch("nope0000").is_err());
    }

    #[test]
    fn test_close_session_frees_ports() {
        let manager = SessionManager::default();
        let info = manager.create_session(None, None).unwrap();
        let relay_port = manager.allocate_relay_port(&info.id).unwrap();

        assert!(manager.close_session(&info.id).unwrap());

        assert!(manager.get_session(&info.id).is_none());
        assert!(!manager.is_port_allocated(info.host_port));
        assert!(!manager.is_port_allocated(relay_port));
        assert_eq!(manager.get_session_stats().allocated_ports, 0);
    }

    #[test]
    fn test_close_unknown_session() {
        let manager = SessionManager::default();
        assert!(!manager.close_session("unknown1").unwrap());
    }

    #[test]
    fn test_closed_port_reusable() {
        // A two-port range forces reuse once both are freed.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = SessionManager::new(SessionManagerSettings {
            port_range: port..port + 1,
            max_port_attempts: 50,
        });

        let first = manager.create_session(None, None).unwrap();
        assert_eq!(first.host_port, port);
        assert!(manager.create_session(None, None).is_err());

        manager.close_session(&first.id).unwrap();
        let second = manager.create_session(None, None).unwrap();
        assert_eq!(second.host_port, port);
    }

    #[test]
    fn test_list_active_sessions() {
        let manager = SessionManager::default();
        let a = manager.create_session(None, None).unwrap();
        let b = manager.create_session(None, None).unwrap();

        let listed: HashSet<_> = manager
            .list_active_sessions()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, HashSet::from([a.id.clone(), b.id.clone()]));

        manager.close_session(&a.id).unwrap();
        let listed = manager.list_active_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
    }

    #[test]
    fn test_cleanup_expired() {
        let manager = SessionManager::default();
        let stale = manager.create_session(None, None).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let fresh = manager.create_session(None, None).unwrap();

        let reaped = manager.cleanup_expired(Duration::from_millis(30)).unwrap();

        assert_eq!(reaped, 1);
        assert!(manager.get_session(&stale.id).is_none());
        assert!(manager.get_session(&fresh.id).is_some());
    }

    #[test]
    fn test_touch_keeps_session_alive() {
        let manager = SessionManager::default();
        let id = manager.create_session(None, None).unwrap().id;
        std::thread::sleep(Duration::from_millis(50));
        manager.touch(&id).unwrap();

        assert_eq!(manager.cleanup_expired(Duration::from_millis(30)).unwrap(), 0);
        assert!(manager.get_session(&id).is_some());
    }

    #[test]
    fn test_disconnected_session_survives_until_timeout() {
        let manager = SessionManager::default();
        let id = manager.create_session(None, None).unwrap().id;
        manager.set_status(&id, SessionStatus::Waiting).unwrap();
        manager.set_status(&id, SessionStatus::Connected).unwrap();
        manager.set_status(&id, SessionStatus::Disconnected).unwrap();

        assert_eq!(manager.cleanup_expired(Duration::from_secs(60)).unwrap(), 0);
        assert_eq!(
            manager.get_session(&id).unwrap().status,
            SessionStatus::Disconnected
        );
    }

    #[test]
    fn test_session_stats() {
        let manager = SessionManager::default();
        let a = manager.create_session(None, None).unwrap();
        let _b = manager.create_session(None, None).unwrap();
        manager.set_status(&a.id, SessionStatus::Waiting).unwrap();
        manager.allocate_relay_port(&a.id).unwrap();

        let stats = manager.get_session_stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.allocated_ports, 3);
        assert_eq!(stats.sessions_by_status[&SessionStatus::Waiting], 1);
        assert_eq!(stats.sessions_by_status[&SessionStatus::Initializing], 1);
        assert!(stats.oldest_session_secs.is_some());
        assert!(stats.newest_session_secs <= stats.oldest_session_secs);
    }

    #[test]
    fn test_empty_stats() {
        let stats = SessionManager::default().get_session_stats();
        assert_eq!(stats, SessionStats::default());
    }

    #[test]
    fn test_shutdown_closes_all() {
        let manager = SessionManager::default();
        manager.create_session(None, None).unwrap();
        manager.create_session(None, None).unwrap();

        assert_eq!(manager.shutdown().unwrap(), 2);
        assert!(manager.list_active_sessions().is_empty());
        assert_eq!(manager.get_session_stats().allocated_ports, 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let manager = SessionManager::default();
        let mut events = manager.subscribe();

        let id = manager.create_session(None, None).unwrap().id;
        manager.set_status(&id, SessionStatus::Waiting).unwrap();
        // Same-status update publishes nothing.
        manager.set_status(&id, SessionStatus::Waiting).unwrap();
        manager.close_session(&id).unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Created(id.clone()));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StatusChanged {
                session_id: id.clone(),
                status: SessionStatus::Waiting
            }
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed(id));
    }

    #[tokio::test]
    async fn test_cleanup_task_reaps_and_stops() {
        let manager = Arc::new(SessionManager::default());
        let id = manager.create_session(None, None).unwrap().id;
        let mut events = manager.subscribe();
        let cancel = CancellationToken::new();

        let handle = manager.start_cleanup_task(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(10),
            cancel.clone(),
        );

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("cleanup should run")
            .unwrap();
        assert_eq!(event, SessionEvent::Closed(id));

        cancel.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup task should stop")
            .unwrap();
    }

    #[test]
    fn test_concurrent_creation() {
        let manager = Arc::new(SessionManager::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    (0..5)
                        .map(|_| manager.create_session(None, None).unwrap().host_port)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(ports.insert(port));
            }
        }
        assert_eq!(ports.len(), 40);
        assert_eq!(manager.list_active_sessions().len(), 40);
    }
}

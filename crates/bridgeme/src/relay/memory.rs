//! In-process relay.
//!
//! [`MemoryRelay`] stands in for an SSH relay server inside one process:
//! listeners registered by one connection receive the direct channels
//! opened by any other. It backs the test suite and the benchmarks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{BridgeError, Result};
use tokio::sync::mpsc;

use super::{InboundChannel, RelayConnection, RelayConnector, RelayFuture, RelayStream, RelayTarget};

/// Buffer size of each in-memory channel.
const CHANNEL_BUFFER: usize = 64 * 1024;

struct Listener {
    owner: u64,
    tx: mpsc::UnboundedSender<InboundChannel>,
}

#[derive(Default)]
struct RelayState {
    listeners: DashMap<u16, Listener>,
    next_connection: AtomicU64,
    refuse_listeners: AtomicBool,
    reject_auth: AtomicBool,
    next_originator_port: AtomicU64,
}

/// An in-process relay server.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    /// Creates an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new authenticated connection to this relay.
    pub fn connection(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            id: self.state.next_connection.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
        })
    }

    /// Makes every later listener request fail.
    pub fn refuse_listeners(&self, refuse: bool) {
        self.state.refuse_listeners.store(refuse, Ordering::SeqCst);
    }

    /// Makes every later connect fail authentication.
    pub fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Returns whether a listener is registered on `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        self.state.listeners.contains_key(&port)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.listeners.len()
    }
}

impl RelayConnector for MemoryRelay {
    fn connect<'a>(&'a self, target: &'a RelayTarget) -> RelayFuture<'a, Arc<dyn RelayConnection>> {
        Box::pin(async move {
            if self.state.reject_auth.load(Ordering::SeqCst) {
                return Err(BridgeError::Authentication(format!(
                    "no credential accepted for {}",
                    target.username
                )));
            }
            Ok(self.connection() as Arc<dyn RelayConnection>)
        })
    }
}

/// One connection to a [`MemoryRelay`].
pub struct MemoryConnection {
    state: Arc<RelayState>,
    id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("relay connection is closed"));
        }
        Ok(())
    }
}

impl RelayConnection for MemoryConnection {
    fn request_listener<'a>(
        &'a self,
        _bind_address: &'a str,
        port: u16,
    ) -> RelayFuture<'a, mpsc::UnboundedReceiver<InboundChannel>> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.state.refuse_listeners.load(Ordering::SeqCst) {
                return Err(BridgeError::tunnel(format!("relay refused to listen on port {}", port)));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            match self.state.listeners.entry(port) {
                Entry::Occupied(_) => Err(BridgeError::tunnel(format!("port {} already has a listener", port))),
                Entry::Vacant(entry) => {
                    entry.insert(Listener { owner: self.id, tx });
                    Ok(rx)
                }
            }
        })
    }

    fn cancel_listener<'a>(&'a self, _bind_address: &'a str, port: u16) -> RelayFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .listeners
                .remove_if(&port, |_, listener| listener.owner == self.id);
            Ok(())
        })
    }

    fn open_direct<'a>(&'a self, _host: &'a str, port: u16) -> RelayFuture<'a, RelayStream> {
        Box::pin(async move {
            self.ensure_open()?;
            let tx = self
                .state
                .listeners
                .get(&port)
                .map(|listener| listener.tx.clone())
                .ok_or_else(|| BridgeError::connection(format!("connection refused on port {}", port)))?;

            let (near, far) = tokio::io::duplex(CHANNEL_BUFFER);
            let originator_port = 40000 + (self.state.next_originator_port.fetch_add(1, Ordering::SeqCst) % 20000);
            tx.send(InboundChannel {
                stream: Box::new(far),
                originator_address: "127.0.0.1".to_string(),
                originator_port: originator_port as u32,
            })
            .map_err(|_| BridgeError::connection(format!("connection refused on port {}", port)))?;

            Ok(Box::new(near) as RelayStream)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> RelayFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.state.listeners.retain(|_, listener| listener.owner != self.id);
            }
            Ok(())
        })
    }
}

//! Connection registry and broadcast fan-out.
//!
//! The hub is the only owner of the live connection set. Each connection is
//! a bounded queue drained by the task that owns the client socket; the hub
//! only ever enqueues, with a deadline, so a slow or dead client costs at
//! most `delivery_timeout` per broadcast and is then dropped.
//!
//! Removal happens under the registry write lock and flips the shared state
//! to `Closed` before the lock is released. Broadcasts take their snapshot
//! under the read lock, and a receiver stops yielding payloads as soon as
//! its state leaves `Open`, so nothing reaches a connection after it was
//! unregistered.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Broadcast payload shared by every delivery of one broadcast.
pub type Payload = Arc<str>;

/// Default deadline for queueing one payload on one connection.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Default per-connection queue capacity.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// Process-local connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Per-connection delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Hub side of a connection: the sending half plus shared state.
///
/// Registering the same connection twice is a no-op. A connection that has
/// been unregistered stays `Closed` and cannot be registered again.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    sender: mpsc::Sender<Payload>,
    state: Arc<StateCell>,
}

impl ClientConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }
}

/// Socket side of a connection: yields broadcast payloads in order.
#[derive(Debug)]
pub struct ConnectionReceiver {
    id: ConnectionId,
    receiver: mpsc::Receiver<Payload>,
    state: Arc<StateCell>,
}

impl ConnectionReceiver {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Next payload, or `None` once the connection left the registry.
    pub async fn recv(&mut self) -> Option<Payload> {
        if self.state.load() != ConnectionState::Open {
            return None;
        }
        let payload = self.receiver.recv().await?;
        if self.state.load() != ConnectionState::Open {
            return None;
        }
        Some(payload)
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Payload> {
        if self.state.load() != ConnectionState::Open {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the payload was queued on.
    pub delivered: usize,
    /// Connections dropped because delivery failed.
    pub failed: Vec<ConnectionId>,
}

#[derive(Debug)]
struct Entry {
    sender: mpsc::Sender<Payload>,
    state: Arc<StateCell>,
}

/// Registry of open client connections and broadcast fan-out.
pub struct BroadcastHub {
    connections: RwLock<BTreeMap<ConnectionId, Entry>>,
    /// Serializes broadcasts so every connection sees payloads in call order.
    broadcast_turn: Mutex<()>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    delivery_timeout: Duration,
    client_buffer: usize,
}

impl BroadcastHub {
    pub fn new(delivery_timeout: Duration, client_buffer: usize) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            broadcast_turn: Mutex::new(()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            delivery_timeout,
            client_buffer: client_buffer.max(1),
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// Allocate an id and a bounded queue for a new connection, unregistered.
    pub fn new_connection(&self) -> (ClientConnection, ConnectionReceiver) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.client_buffer);
        let state = Arc::new(StateCell::new(ConnectionState::Open));

        (
            ClientConnection {
                id,
                sender,
                state: Arc::clone(&state),
            },
            ConnectionReceiver {
                id,
                receiver,
                state,
            },
        )
    }

    /// Allocate and register a connection. `None` once the hub was closed.
    pub async fn open(&self) -> Option<ConnectionReceiver> {
        let (connection, receiver) = self.new_connection();
        if self.register(connection).await {
            Some(receiver)
        } else {
            None
        }
    }

    /// Add `connection` in state `Open`.
    ///
    /// Returns `false` without side effects when it is already registered,
    /// no longer open, or the hub has been closed.
    pub async fn register(&self, connection: ClientConnection) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(connection = %connection.id, "Hub closed, registration refused");
            return false;
        }
        if connection.state.load() != ConnectionState::Open {
            debug!(connection = %connection.id, "Connection not open, registration refused");
            return false;
        }

        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection.id) {
            return false;
        }
        // Re-check under the lock: close_all or unregister may have raced us
        if !self.accepting.load(Ordering::SeqCst)
            || connection.state.load() != ConnectionState::Open
        {
            return false;
        }

        connections.insert(
            connection.id,
            Entry {
                sender: connection.sender,
                state: connection.state,
            },
        );
        info!(
            connection = %connection.id,
            connections = connections.len(),
            "Connection registered"
        );
        true
    }

    /// Remove a connection. Unknown or already removed ids are a no-op.
    ///
    /// Returns whether this call removed the entry.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.remove(&id) {
            Some(entry) => {
                entry.state.store(ConnectionState::Closed);
                info!(
                    connection = %id,
                    connections = connections.len(),
                    "Connection unregistered"
                );
                true
            }
            None => {
                debug!(connection = %id, "Unregister for unknown connection ignored");
                false
            }
        }
    }

    /// Queue `payload` on every open connection.
    ///
    /// Deliveries run concurrently and independently; any connection whose
    /// delivery fails is unregistered before this returns.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> BroadcastReport {
        let payload: Payload = payload.into();
        let _turn = self.broadcast_turn.lock().await;

        let targets: Vec<(ConnectionId, mpsc::Sender<Payload>, Arc<StateCell>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, entry)| entry.state.load() == ConnectionState::Open)
                .map(|(id, entry)| (*id, entry.sender.clone(), Arc::clone(&entry.state)))
                .collect()
        };

        if targets.is_empty() {
            debug!("Broadcast with no open connections");
            return BroadcastReport::default();
        }

        let timeout = self.delivery_timeout;
        let deliveries = targets.into_iter().map(|(id, sender, state)| {
            let payload = Arc::clone(&payload);
            async move { (id, deliver(&sender, &state, payload, timeout).await) }
        });
        let outcomes = join_all(deliveries).await;

        let mut report = BroadcastReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Delivery failed, dropping connection");
                    self.unregister(id).await;
                    report.failed.push(id);
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Stop accepting registrations and close every connection.
    ///
    /// Returns how many connections were closed.
    pub async fn close_all(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let mut connections = self.connections.write().await;
        for entry in connections.values() {
            entry.state.store(ConnectionState::Closing);
        }
        let closed = std::mem::take(&mut *connections);
        for entry in closed.values() {
            entry.state.store(ConnectionState::Closed);
        }

        info!(closed = closed.len(), "Closed all connections");
        closed.len()
    }

    /// State of `id` as seen by the registry: `Open` while registered.
    pub async fn state(&self, id: ConnectionId) -> ConnectionState {
        match self.connections.read().await.get(&id) {
            Some(entry) => entry.state.load(),
            None => ConnectionState::Closed,
        }
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT, DEFAULT_CLIENT_BUFFER)
    }
}

async fn deliver(
    sender: &mpsc::Sender<Payload>,
    state: &StateCell,
    payload: Payload,
    timeout: Duration,
) -> Result<(), DeliveryError> {
    if state.load() != ConnectionState::Open {
        return Err(DeliveryError::Closed);
    }
    match sender.send_timeout(payload, timeout).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout(timeout)),
        Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
    }
}

//! Connection registry with ordered fan-out.
//!
//! Every connection owns one bounded outbound queue. Direct sends (sync
//! markers, chunks, resends) and broadcast pixel echoes go through that
//! same queue, so a client always sees them in the order the server
//! enqueued them.
//!
//! ```text
//!                     ┌──────────────────┐
//!  broadcast(msg) ──► │  BroadcastGroup  │ ──► queue A ──► socket A
//!  send_to(B, msg) ─► │  (peer registry) │ ──► queue B ──► socket B
//!                     └──────────────────┘ ──► queue C ──► socket C
//! ```
//!
//! A full queue drops the message for that peer only (counted in stats);
//! slow readers never stall the others.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::DEFAULT_NAME;

/// Encoded text frame queued for a connection.
pub type Outbound = Arc<str>;

/// Opaque identifier for one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side state for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub addr: Option<SocketAddr>,
    /// Sanitized display name, if the client sent one
    pub display_name: Option<String>,
    pub connected_at: Instant,
    /// Whether a full sync has been started for this connection
    pub synced: bool,
}

impl ConnectionState {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            addr,
            display_name: None,
            connected_at: Instant::now(),
            synced: false,
        }
    }

    /// Display name, or "Unknown" when unset.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(DEFAULT_NAME)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, updated without taking the registry write lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Peer {
    state: ConnectionState,
    sender: mpsc::Sender<Outbound>,
}

/// The broadcast set: every registered connection and its outbound queue.
pub struct BroadcastGroup {
    peers: RwLock<HashMap<ConnectionId, Peer>>,

    /// Queue capacity per connection
    capacity: usize,

    /// Maximum simultaneous connections
    max_peers: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_peers,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connection and return the receiving end of its queue.
    ///
    /// Returns `None` when the group is already at `max_peers`.
    pub async fn add_peer(&self, state: ConnectionState) -> Option<mpsc::Receiver<Outbound>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers {
            return None;
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        peers.insert(state.id, Peer { state, sender });
        Some(receiver)
    }

    /// Remove a connection. Its queue closes once in-flight senders drop.
    pub async fn remove_peer(&self, id: &ConnectionId) -> Option<ConnectionState> {
        let mut peers = self.peers.write().await;
        peers.remove(id).map(|peer| peer.state)
    }

    /// Enqueue `msg` for every registered connection, the sender included.
    ///
    /// Returns the number of queues that accepted it.
    pub async fn broadcast(&self, msg: Outbound) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for (id, peer) in peers.iter() {
            match peer.sender.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Outbound queue full for {id}, dropping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Enqueue `msg` for one connection without waiting.
    pub async fn send_to(&self, id: &ConnectionId, msg: Outbound) -> bool {
        match self.sender(id).await {
            Some(sender) => self.try_deliver(id, &sender, msg),
            None => false,
        }
    }

    /// Non-blocking enqueue on an already looked-up sender.
    pub fn try_deliver(&self, id: &ConnectionId, sender: &mpsc::Sender<Outbound>, msg: Outbound) -> bool {
        match sender.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for {id}, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Clone of a connection's queue sender, for paced sends that await capacity.
    pub async fn sender(&self, id: &ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.peers.read().await.get(id).map(|peer| peer.sender.clone())
    }

    /// Mutate a connection's state in place.
    pub async fn update_peer<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut peers = self.peers.write().await;
        peers.get_mut(id).map(|peer| f(&mut peer.state))
    }

    /// Snapshot of one connection's state.
    pub async fn peer(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.peers.read().await.get(id).map(|peer| peer.state.clone())
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ConnectionState> {
        self.peers.read().await.values().map(|peer| peer.state.clone()).collect()
    }

    pub async fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}

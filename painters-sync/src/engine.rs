//! Authoritative canvas owner and per-connection sync state machine.
//!
//! ```text
//! CONNECTED ──[NAME]──► NAMED ──► SYNCING ──► STEADY ──► CLOSED
//!     │                              ▲           │
//!     └──── (sync_trigger=on_connect)┘◄─[MAP/SYNC]┘
//! ```
//!
//! The engine knows nothing about sockets: the server registers a
//! connection, feeds it raw text frames, and drains the returned queue.
//!
//! Locking order is canvas → sessions and canvas → registry. A pixel write
//! and its echo happen under the canvas write lock; a full sync snapshots
//! the canvas and enqueues `[MAP/SEND]` under the read lock. Every echo is
//! therefore queued either before the marker (and included in the
//! snapshot) or after it.
//!
//! Chunk streaming runs as one spawned task per session. Before each send
//! the task waits for queue capacity, then re-checks under the session lock
//! that its session is still the connection's live one, so a task outliving
//! its connection or superseded by a resync never writes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGroup, ConnectionId, ConnectionState, Outbound};
use crate::canvas::{BitCanvas, CanvasError};
use crate::chunk::{self, ChunkError};
use crate::limiter::RateLimiter;
use crate::protocol::{
    sanitize_name, CanvasInfo, ClientMessage, PixelUpdate, ProtocolError, DEFAULT_NAME,
    SYNC_END, SYNC_START,
};
use crate::server::{ServerConfig, ServerStats, SyncTrigger};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection limit of {max} reached")]
    ConnectionLimitExceeded { max: usize },
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Outbound queue full for {0}")]
    OutboundFull(ConnectionId),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

/// Why a pixel update was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PixelRejection {
    #[error("Invalid pixel coordinates: ({x}, {y})")]
    OutOfRangeCoordinate { x: u32, y: u32 },
    #[error("Invalid color value: {0}")]
    InvalidColor(u32),
    #[error("Rate limited")]
    RateLimited,
}

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Chunks of one connection's current sync session, kept for resends.
#[derive(Default)]
struct SyncSession {
    id: u64,
    cache: HashMap<u32, Outbound>,
    task: Option<JoinHandle<()>>,
}

type Sessions = Arc<Mutex<HashMap<ConnectionId, SyncSession>>>;

pub struct SyncEngine {
    config: ServerConfig,
    canvas: RwLock<BitCanvas>,
    group: Arc<BroadcastGroup>,
    sessions: Sessions,
    limiter: Mutex<RateLimiter>,
    stats: Arc<RwLock<ServerStats>>,
    next_session: AtomicU64,
    /// Canvas changed since the last snapshot was taken for saving
    dirty: AtomicBool,
}

impl SyncEngine {
    /// Create an engine with a zero-filled canvas.
    pub fn new(config: ServerConfig) -> Self {
        let canvas = BitCanvas::new(config.canvas_width, config.canvas_height);
        Self::with_canvas(config, canvas)
    }

    pub fn with_canvas(config: ServerConfig, canvas: BitCanvas) -> Self {
        let group = Arc::new(BroadcastGroup::new(
            config.outbound_capacity,
            config.max_clients,
        ));
        let limiter = RateLimiter::new(config.rate_limit());
        Self {
            config,
            canvas: RwLock::new(canvas),
            group,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            limiter: Mutex::new(limiter),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_session: AtomicU64::new(1),
            dirty: AtomicBool::new(false),
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Register a new connection.
    ///
    /// Returns its id and the queue the transport must drain to the socket.
    pub async fn connect(
        &self,
        addr: Option<SocketAddr>,
    ) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), EngineError> {
        let state = ConnectionState::new(addr);
        let id = state.id;
        let Some(receiver) = self.group.add_peer(state).await else {
            self.stats.write().await.rejected_connections += 1;
            return Err(EngineError::ConnectionLimitExceeded {
                max: self.config.max_clients,
            });
        };

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        if self.config.announce_canvas {
            let info = self.canvas_info().to_wire();
            self.group.send_to(&id, Arc::from(info)).await;
        }

        if self.config.sync_trigger == SyncTrigger::OnConnect {
            if let Err(e) = self.start_full_sync(&id).await {
                log::warn!("Initial sync for {id} failed: {e}");
            }
        }

        Ok((id, receiver))
    }

    /// Deregister a connection and drop its sync session.
    pub async fn disconnect(&self, id: &ConnectionId) -> Option<ConnectionState> {
        let state = self.group.remove_peer(id).await;

        if let Some(session) = self.sessions.lock().await.remove(id) {
            if let Some(task) = session.task {
                task.abort();
            }
        }
        self.limiter.lock().await.forget(id);

        if state.is_some() {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        state
    }

    // ─── Inbound frames ───────────────────────────────────────────────

    /// Handle one text frame from a connection.
    ///
    /// Nothing is ever sent back on failure; bad input is logged and dropped.
    pub async fn handle_message(&self, id: &ConnectionId, raw: &str) -> Disposition {
        self.stats.write().await.total_messages += 1;

        let msg = match ClientMessage::parse(raw, self.config.max_message_len) {
            Ok(msg) => msg,
            Err(ProtocolError::Oversized { len, .. }) => {
                log::debug!("Received long message ({len} bytes) from {id}, ignoring");
                self.stats.write().await.dropped_messages += 1;
                return Disposition::Continue;
            }
            Err(e) => {
                log::debug!("Dropping message from {id}: {e}");
                self.stats.write().await.dropped_messages += 1;
                return Disposition::Continue;
            }
        };

        match msg {
            ClientMessage::Stop => {
                log::info!("Received STOP command from {id}, closing connection");
                return Disposition::Close;
            }
            ClientMessage::SyncRequest => {
                log::info!("Client {id} requested canvas sync");
                if let Err(e) = self.start_full_sync(id).await {
                    log::warn!("Sync for {id} failed: {e}");
                }
            }
            ClientMessage::Resend { sequence_id } => {
                self.resend_chunk(id, sequence_id).await;
            }
            ClientMessage::Name(name) => {
                self.set_name(id, &name).await;
            }
            ClientMessage::Pixel(update) => {
                if let Err(rejection) = self.apply_pixel(id, raw, update).await {
                    match rejection {
                        PixelRejection::RateLimited => {
                            log::debug!("Rate limited pixel from {id}");
                            self.stats.write().await.pixels_rate_limited += 1;
                        }
                        other => {
                            log::warn!("{other} from {id}");
                            self.stats.write().await.pixels_rejected += 1;
                        }
                    }
                }
            }
        }
        Disposition::Continue
    }

    /// Store a sanitized display name. Empty names are ignored.
    ///
    /// With [`SyncTrigger::OnName`], the first accepted name starts the
    /// connection's initial full sync.
    pub async fn set_name(&self, id: &ConnectionId, raw: &str) -> Option<String> {
        let Some(name) = sanitize_name(raw) else {
            log::info!("Invalid name received from {id}, ignoring");
            return None;
        };

        let needs_sync = self
            .group
            .update_peer(id, |s| {
                s.display_name = Some(name.clone());
                !s.synced
            })
            .await?;
        log::info!("Client {id} set name to: {name}");

        if needs_sync && self.config.sync_trigger == SyncTrigger::OnName {
            if let Err(e) = self.start_full_sync(id).await {
                log::warn!("Initial sync for {name} failed: {e}");
            }
        }
        Some(name)
    }

    /// Validate, rate-limit, apply, then echo the raw frame to every connection.
    ///
    /// Returns the number of connections the echo was queued for.
    pub async fn apply_pixel(
        &self,
        id: &ConnectionId,
        raw: &str,
        update: PixelUpdate,
    ) -> Result<usize, PixelRejection> {
        if update.x >= self.config.canvas_width || update.y >= self.config.canvas_height {
            return Err(PixelRejection::OutOfRangeCoordinate {
                x: update.x,
                y: update.y,
            });
        }
        if !update.has_valid_color() {
            return Err(PixelRejection::InvalidColor(update.color));
        }
        if !self.limiter.lock().await.allow(*id, Instant::now()) {
            return Err(PixelRejection::RateLimited);
        }

        let name = self
            .group
            .peer(id)
            .await
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| DEFAULT_NAME.to_string());

        let delivered = {
            let mut canvas = self.canvas.write().await;
            canvas.set(update.x, update.y, update.is_painted());
            self.dirty.store(true, Ordering::SeqCst);
            self.group.broadcast(Arc::from(raw)).await
        };

        self.stats.write().await.pixels_applied += 1;
        log::info!(
            "{name}: Set pixel at ({}, {}) to color {}",
            update.x,
            update.y,
            if update.is_painted() { "black" } else { "white" }
        );
        Ok(delivered)
    }

    // ─── Full sync ────────────────────────────────────────────────────

    /// Start a new full-sync session for one connection.
    ///
    /// Supersedes any session in flight for that connection; other
    /// connections are unaffected.
    pub async fn start_full_sync(&self, id: &ConnectionId) -> Result<(), EngineError> {
        let sender = self
            .group
            .sender(id)
            .await
            .ok_or(EngineError::UnknownConnection(*id))?;
        let name = self
            .group
            .peer(id)
            .await
            .map_or_else(|| DEFAULT_NAME.to_string(), |s| s.name().to_string());
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        let snapshot = {
            let canvas = self.canvas.read().await;
            let snapshot = canvas.raw_bytes().to_vec();
            chunk::encode(&snapshot, self.config.max_chunk_len)?;

            // A superseded task re-checks the session id under this lock,
            // so it cannot slip a chunk in after the new marker.
            let mut sessions = self.sessions.lock().await;
            if !self.group.try_deliver(id, &sender, Arc::from(SYNC_START)) {
                return Err(EngineError::OutboundFull(*id));
            }
            let session = sessions.entry(*id).or_default();
            if let Some(previous) = session.task.take() {
                previous.abort();
            }
            session.id = session_id;
            session.cache.clear();
            snapshot
        };
        self.group.update_peer(id, |s| s.synced = true).await;

        self.stats.write().await.full_syncs += 1;
        log::info!("Sending canvas to {name} ({} bytes)", snapshot.len());

        let task = tokio::spawn(stream_session(SessionStream {
            connection: *id,
            session_id,
            snapshot,
            max_len: self.config.max_chunk_len,
            delay: self.config.chunk_delay(),
            sender,
            sessions: self.sessions.clone(),
            stats: self.stats.clone(),
            name,
        }));

        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(session) if session.id == session_id => session.task = Some(task),
            _ => task.abort(),
        }
        Ok(())
    }

    /// Resend a chunk from the connection's current session, if cached.
    pub async fn resend_chunk(&self, id: &ConnectionId, sequence_id: u32) -> bool {
        let Some(sender) = self.group.sender(id).await else {
            return false;
        };

        let sent = {
            let sessions = self.sessions.lock().await;
            match sessions.get(id).and_then(|s| s.cache.get(&sequence_id)) {
                Some(wire) => self.group.try_deliver(id, &sender, wire.clone()),
                None => {
                    log::debug!("No cached chunk {sequence_id} for {id}, ignoring resend");
                    return false;
                }
            }
        };

        if sent {
            self.stats.write().await.chunks_resent += 1;
            log::info!("Client {id} requested resend of chunk {sequence_id}, resent");
        }
        sent
    }

    // ─── Canvas access ────────────────────────────────────────────────

    /// Copy of the packed canvas buffer.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.canvas.read().await.raw_bytes().to_vec()
    }

    /// Copy of the canvas if it changed since the last call; clears the flag.
    pub async fn snapshot_if_dirty(&self) -> Option<Vec<u8>> {
        let canvas = self.canvas.read().await;
        self.dirty
            .swap(false, Ordering::SeqCst)
            .then(|| canvas.raw_bytes().to_vec())
    }

    /// Flag the canvas as unsaved, e.g. after a failed write.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Replace the canvas with a recovered snapshot.
    pub async fn restore(&self, bytes: &[u8]) -> Result<(), CanvasError> {
        self.canvas.write().await.load_raw(bytes)
    }

    /// Cell value, or `None` when out of range.
    pub async fn pixel(&self, x: u32, y: u32) -> Option<bool> {
        let canvas = self.canvas.read().await;
        canvas.contains(x, y).then(|| canvas.get(x, y))
    }

    pub fn canvas_info(&self) -> CanvasInfo {
        CanvasInfo {
            width: self.config.canvas_width,
            height: self.config.canvas_height,
        }
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn connection_count(&self) -> usize {
        self.group.peer_count().await
    }

    pub async fn connections(&self) -> Vec<ConnectionState> {
        self.group.peers().await
    }

    /// Number of chunks cached for resend on a connection.
    pub async fn cached_chunks(&self, id: &ConnectionId) -> usize {
        self.sessions
            .lock()
            .await
            .get(id)
            .map_or(0, |s| s.cache.len())
    }

    pub(crate) async fn record_snapshot_saved(&self) {
        self.stats.write().await.snapshots_saved += 1;
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.dropped_broadcasts = self.group.stats().await.messages_dropped;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

struct SessionStream {
    connection: ConnectionId,
    session_id: u64,
    snapshot: Vec<u8>,
    max_len: usize,
    delay: Duration,
    sender: mpsc::Sender<Outbound>,
    sessions: Sessions,
    stats: Arc<RwLock<ServerStats>>,
    name: String,
}

/// Send every chunk of `snapshot`, paced by `delay`, then the end marker.
async fn stream_session(stream: SessionStream) {
    let Ok(encoder) = chunk::encode(&stream.snapshot, stream.max_len) else {
        return;
    };

    let mut sent = 0usize;
    for chunk in encoder {
        if sent > 0 {
            tokio::time::sleep(stream.delay).await;
        }
        let wire: Outbound = Arc::from(chunk.to_wire());
        if !deliver(&stream, wire, Some(chunk.sequence_id)).await {
            log::debug!("Sync session {} for {} cancelled", stream.session_id, stream.connection);
            return;
        }
        sent += 1;
        stream.stats.write().await.chunks_sent += 1;
    }

    tokio::time::sleep(stream.delay).await;
    if deliver(&stream, Arc::from(SYNC_END), None).await {
        log::info!(
            "Canvas sent to {}: {sent} chunks, {} bytes",
            stream.name,
            stream.snapshot.len()
        );
    }
}

/// Wait for queue space, then enqueue only if the session is still live.
async fn deliver(stream: &SessionStream, wire: Outbound, sequence_id: Option<u32>) -> bool {
    let Ok(permit) = stream.sender.reserve().await else {
        return false;
    };
    let mut sessions = stream.sessions.lock().await;
    match sessions.get_mut(&stream.connection) {
        Some(session) if session.id == stream.session_id => {
            if let Some(sequence_id) = sequence_id {
                session.cache.insert(sequence_id, wire.clone());
            }
            permit.send(wire);
            true
        }
        _ => false,
    }
}

//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── handle_connection ── SyncEngine ── BitCanvas (authority)
//! Client B ──┘         ▲    │               │
//!                      │    ▼               ├── BroadcastGroup (ordered queues)
//!              outbound queue              └── Persister ── snapshot file
//! ```
//!
//! Each connection task owns its socket. Text frames go to the engine;
//! everything the engine queues for the connection is drained back out in
//! order. The engine decides, the task only moves bytes.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionId, Outbound};
use crate::canvas::BitCanvas;
use crate::engine::{Disposition, SyncEngine};
use crate::storage::{Persister, SnapshotStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// What starts a connection's first full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The first accepted `[NAME]` message
    #[default]
    OnName,
    /// Accepting the connection
    OnConnect,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Concurrent connections accepted before new ones are closed
    pub max_clients: usize,
    /// Inbound frames longer than this are dropped unread
    pub max_message_len: usize,
    /// Transport ceiling: larger WebSocket frames or messages close the connection
    pub max_frame_bytes: usize,
    /// Upper bound for one encoded chunk frame
    pub max_chunk_len: usize,
    /// Pause between chunk frames of a full sync
    pub chunk_delay_ms: u64,
    /// Minimum time between two pixel writes from one connection
    pub rate_limit_ms: u64,
    pub save_interval_secs: u64,
    /// Snapshot file (None = in-memory only)
    pub snapshot_path: Option<PathBuf>,
    pub sync_trigger: SyncTrigger,
    /// Send `[CANVAS]w:..,h:..` on connect
    pub announce_canvas: bool,
    /// Outbound queue depth per connection
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            canvas_width: 200,
            canvas_height: 200,
            max_clients: 75,
            max_message_len: 50,
            max_frame_bytes: 1024,
            max_chunk_len: 128,
            chunk_delay_ms: 250,
            rate_limit_ms: 1000,
            save_interval_secs: 60,
            snapshot_path: None,
            sync_trigger: SyncTrigger::OnName,
            announce_canvas: true,
            outbound_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Local bind, no pacing or rate limit, short save interval.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            chunk_delay_ms: 1,
            rate_limit_ms: 0,
            save_interval_secs: 1,
            ..Self::default()
        }
    }

    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            snapshot_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    /// WebSocket limits applied to every accepted connection.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes))
    }

    /// Size of the packed canvas and of its snapshot file.
    pub fn canvas_byte_len(&self) -> usize {
        BitCanvas::byte_len_for(self.canvas_width, self.canvas_height)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    /// Oversized, unknown or unparsable frames
    pub dropped_messages: u64,
    /// Queued messages lost to full outbound queues
    pub dropped_broadcasts: u64,
    pub pixels_applied: u64,
    pub pixels_rejected: u64,
    pub pixels_rate_limited: u64,
    pub full_syncs: u64,
    pub chunks_sent: u64,
    pub chunks_resent: u64,
    pub snapshots_saved: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    /// Snapshot persistence (optional)
    persister: Option<Arc<Persister>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let engine = Arc::new(SyncEngine::new(config.clone()));
        let persister = config.snapshot_path.as_ref().map(|path| {
            let store = SnapshotStore::new(path, config.canvas_byte_len());
            Arc::new(Persister::new(store, engine.clone(), config.save_interval()))
        });
        Self {
            config,
            engine,
            persister,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig::with_storage(bind_addr, path))
    }

    /// Load the persisted canvas, if storage is configured.
    pub async fn recover(&self) -> bool {
        match &self.persister {
            Some(persister) => persister.load_into_engine().await,
            None => false,
        }
    }

    /// Bind and serve until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves, then close every
    /// connection and save the canvas.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        if self.recover().await {
            log::info!("Recovered canvas from persistent storage");
        }
        log::info!(
            "Sync server listening on {} ({}x{} canvas)",
            listener.local_addr()?,
            self.config.canvas_width,
            self.config.canvas_height
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let timer = self
            .persister
            .as_ref()
            .map(|p| p.clone().spawn_timer(stop_rx.clone()));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let engine = self.engine.clone();
                    let persister = self.persister.clone();
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, engine, persister, stop).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutting down sync server");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        if let Some(timer) = timer {
            let _ = timer.await;
        }
        if let Some(persister) = &self.persister {
            // Failures are logged by the persister
            let _ = persister.save_now().await;
        }
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        persister: Option<Arc<Persister>>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_config = engine.config().websocket_config();
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let (id, outbound) = match engine.connect(Some(addr)).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Rejecting connection from {addr}: {e}");
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };
        log::info!(
            "Client {id} connected from {addr} ({} connected)",
            engine.connection_count().await
        );

        let result = Self::pump(id, &engine, ws_sender, ws_receiver, outbound, stop).await;

        let state = engine.disconnect(&id).await;
        let remaining = engine.connection_count().await;
        log::info!(
            "Client {} ({id}) disconnected from {addr} ({remaining} connected)",
            state.as_ref().map_or("Unknown", |s| s.name())
        );

        if remaining == 0 {
            if let Some(persister) = persister {
                let _ = persister.save_if_dirty().await;
            }
        }
        result
    }

    /// Move frames between the socket and the engine until either side closes.
    async fn pump(
        id: ConnectionId,
        engine: &SyncEngine,
        mut ws_sender: WsSink,
        mut ws_receiver: WsSource,
        mut outbound: mpsc::Receiver<Outbound>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if engine.handle_message(&id, text.as_str()).await == Disposition::Close {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {id}");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {id}: {e}");
                            break;
                        }
                    }
                }

                msg = outbound.recv() => {
                    match msg {
                        Some(text) => ws_sender.send(Message::text(text.to_string())).await?,
                        None => break,
                    }
                }

                _ = stop.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.engine.stats().await
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Get the persistence scheduler (if configured).
    pub fn persister(&self) -> Option<&Arc<Persister>> {
        self.persister.as_ref()
    }
}

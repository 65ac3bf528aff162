//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, join by name, disconnect)
//! - A local canvas mirror kept current by [`MirrorReconciler`]
//! - Optimistic local painting sent as pixel updates
//!
//! Two background tasks share the mirror: the reader applies server frames,
//! the caller's thread paints and reads snapshots. Every access takes the
//! mirror lock briefly and never across an await. Disconnect flips a stop
//! flag and joins both tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::canvas::BitCanvas;
use crate::mirror::{MirrorEvent, MirrorPhase, MirrorReconciler};
use crate::protocol::{ClientMessage, PixelUpdate, ProtocolError, CLIENT_STOP, DEFAULT_NAME};

/// State of the client's link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// The mirror changed
    Mirror(MirrorEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Sent as `[NAME]` right after connecting
    pub display_name: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            display_name: DEFAULT_NAME.to_string(),
            canvas_width: 200,
            canvas_height: 200,
        }
    }
}

const CHANNEL_CAPACITY: usize = 256;

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<LinkState>>,

    /// Local canvas mirror shared with the reader task
    mirror: Arc<Mutex<MirrorReconciler>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Cooperative stop flag for both tasks
    stop_tx: Option<watch::Sender<bool>>,

    tasks: Vec<JoinHandle<()>>,
}

fn lock(mirror: &Mutex<MirrorReconciler>) -> MutexGuard<'_, MirrorReconciler> {
    mirror.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue a mirror request for the writer, waiting for room.
///
/// If the writer is gone the mirror forgets the resend, so a later gap or
/// end marker asks for it again.
async fn forward_request(
    requests: &mpsc::Sender<String>,
    mirror: &Mutex<MirrorReconciler>,
    request: ClientMessage,
) -> bool {
    let wire = request.to_wire();
    log::debug!("Requesting {wire}");
    if requests.send(wire).await.is_ok() {
        return true;
    }
    if let ClientMessage::Resend { sequence_id } = request {
        lock(mirror).forget_request(sequence_id);
    }
    log::debug!("Outgoing queue closed, request not sent");
    false
}

impl SyncClient {
    /// Create a new, unconnected sync client.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mirror = MirrorReconciler::new(config.canvas_width, config.canvas_height);
        Self {
            config,
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            mirror: Arc::new(Mutex::new(mirror)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            stop_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and send our display name.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if *self.state.read().await == LinkState::Connected {
            return Ok(());
        }
        *self.state.write().await = LinkState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = LinkState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        *self.state.write().await = LinkState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        // Writer task: forward the outgoing channel to the socket, queued frames first
        let mut stop = stop_rx.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = out_rx.recv() => {
                        let Some(text) = msg else { break };
                        if ws_writer.send(Message::text(text)).await.is_err() {
                            return;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            while let Ok(text) = out_rx.try_recv() {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: feed server frames to the mirror
        let mirror = self.mirror.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let requests = out_tx.clone();
        let mut stop = stop_rx;
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = ws_reader.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let outcome = lock(&mirror).receive(text.as_str());
                                if let Some(request) = outcome.request {
                                    forward_request(&requests, &mirror, request).await;
                                }
                                if !matches!(outcome.event, MirrorEvent::Duplicate | MirrorEvent::Ignored) {
                                    if event_tx.try_send(SyncEvent::Mirror(outcome.event)).is_err() {
                                        log::debug!("Event queue full, dropping mirror event");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            // Connection lost
            *state.write().await = LinkState::Disconnected;
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        let join = ClientMessage::Name(self.config.display_name.clone()).to_wire();
        let _ = out_tx.send(join).await;

        self.outgoing_tx = Some(out_tx);
        self.stop_tx = Some(stop_tx);
        self.tasks = vec![writer, reader];

        log::info!("Connected to {} as {}", self.config.server_url, self.config.display_name);
        Ok(())
    }

    /// Flip a cell locally and send its new value.
    pub async fn toggle_pixel(&self, x: u32, y: u32) -> Result<PixelUpdate, ProtocolError> {
        self.ensure_connected().await?;
        let update = lock(&self.mirror)
            .toggle_local(x, y)
            .ok_or(ProtocolError::OutOfBounds { x, y })?;
        self.send(ClientMessage::Pixel(update)).await?;
        Ok(update)
    }

    /// Set a cell locally and send it.
    pub async fn set_pixel(&self, x: u32, y: u32, painted: bool) -> Result<PixelUpdate, ProtocolError> {
        self.ensure_connected().await?;
        let update = lock(&self.mirror)
            .set_local(x, y, painted)
            .ok_or(ProtocolError::OutOfBounds { x, y })?;
        self.send(ClientMessage::Pixel(update)).await?;
        Ok(update)
    }

    /// Ask the server for a fresh full sync.
    pub async fn request_resync(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SyncRequest).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.to_wire())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn ensure_connected(&self) -> Result<(), ProtocolError> {
        match *self.state.read().await {
            LinkState::Connected => Ok(()),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send the stop message, stop both tasks and wait for them.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(CLIENT_STOP.to_string()).await;
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        *self.state.write().await = LinkState::Disconnected;
        log::info!("Disconnected from {}", self.config.server_url);
    }

    /// Copy of the local mirror for rendering.
    pub fn snapshot(&self) -> BitCanvas {
        lock(&self.mirror).snapshot()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<bool> {
        lock(&self.mirror).pixel(x, y)
    }

    pub fn phase(&self) -> MirrorPhase {
        lock(&self.mirror).phase()
    }

    pub fn bytes_received(&self) -> usize {
        lock(&self.mirror).bytes_received()
    }

    pub async fn connection_state(&self) -> LinkState {
        *self.state.read().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

//! Persistence integration tests.
//!
//! Verifies:
//! - Canvas survives a server restart through the snapshot file
//! - The last client leaving triggers a save
//! - Graceful shutdown saves unconditionally
//! - Periodic saves while clients are connected
//! - Missing or wrong-sized snapshots start a blank canvas

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use painters_sync::server::{ServerConfig, SyncServer};
use painters_sync::storage::SnapshotStore;
use tempfile::tempdir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;
const BYTES: usize = 32;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct RunningServer {
    server: Arc<SyncServer>,
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn start(snapshot: &Path, save_interval_secs: u64) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Arc::new(SyncServer::new(ServerConfig {
            canvas_width: WIDTH,
            canvas_height: HEIGHT,
            snapshot_path: Some(snapshot.to_path_buf()),
            save_interval_secs,
            ..ServerConfig::for_testing()
        }));

        let (shutdown, rx) = oneshot::channel::<()>();
        let running = server.clone();
        let task = tokio::spawn(async move {
            running
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            server,
            port,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> Arc<SyncServer> {
        let _ = self.shutdown.send(());
        timeout(Duration::from_secs(3), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
        self.server
    }
}

async fn join(port: u16, name: &str) -> (Ws, Vec<u8>) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    assert!(next_text(&mut ws).await.starts_with("[CANVAS]"));
    ws.send(Message::text(format!("[NAME]{name}"))).await.unwrap();

    assert_eq!(next_text(&mut ws).await, "[MAP/SEND]");
    let mut bytes = Vec::new();
    loop {
        let frame = next_text(&mut ws).await;
        if frame == "[MAP/END]" {
            return (ws, bytes);
        }
        let chunk = painters_sync::chunk::decode(&frame).unwrap();
        bytes.extend_from_slice(&chunk.bytes);
    }
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

async fn paint(ws: &mut Ws, x: u32, y: u32) {
    let frame = format!("[PIXEL]x:{x},y:{y},c:1");
    ws.send(Message::text(frame.clone())).await.unwrap();
    assert_eq!(next_text(ws).await, frame);
}

async fn wait_for_file(path: &PathBuf, pred: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    timeout(Duration::from_secs(4), async {
        loop {
            if let Ok(bytes) = std::fs::read(path) {
                if pred(&bytes) {
                    return bytes;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("snapshot never reached the expected state")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_canvas_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.bin");

    let first = RunningServer::start(&path, 60).await;
    let (mut ws, _) = join(first.port, "Alice").await;
    paint(&mut ws, 1, 0).await;
    paint(&mut ws, 15, 15).await;
    drop(ws);

    // Last client gone: the changed canvas is written right away
    let saved = wait_for_file(&path, |b| b.len() == BYTES && b[0] == 0x02).await;
    assert_eq!(saved[BYTES - 1], 0x80);
    first.stop().await;

    let second = RunningServer::start(&path, 60).await;
    let (_ws, bytes) = join(second.port, "Bob").await;
    assert_eq!(bytes, saved);
    assert_eq!(second.server.engine().pixel(15, 15).await, Some(true));
    second.stop().await;
}

#[tokio::test]
async fn test_shutdown_saves_with_clients_connected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.bin");

    let running = RunningServer::start(&path, 60).await;
    let (mut ws, _) = join(running.port, "Alice").await;
    paint(&mut ws, 0, 1).await;

    let server = running.stop().await;
    let store = SnapshotStore::new(&path, BYTES);
    let saved = store.load().unwrap();
    assert_eq!(saved[2], 0x01);
    assert!(server.stats().await.snapshots_saved >= 1);
}

#[tokio::test]
async fn test_periodic_save_while_connected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.bin");

    let running = RunningServer::start(&path, 1).await;
    let (mut ws, _) = join(running.port, "Alice").await;
    paint(&mut ws, 3, 0).await;

    // Still connected; only the timer can have written this
    let saved = wait_for_file(&path, |b| b.len() == BYTES && b[0] == 0x08).await;
    assert_eq!(saved.iter().map(|b| b.count_ones()).sum::<u32>(), 1);

    drop(ws);
    running.stop().await;
}

#[tokio::test]
async fn test_idle_server_does_not_write_on_timer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.bin");

    let running = RunningServer::start(&path, 1).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!path.exists());

    // Shutdown still writes the (blank) canvas
    running.stop().await;
    assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; BYTES]);
}

#[tokio::test]
async fn test_missing_snapshot_starts_blank() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested/canvas.bin");

    let running = RunningServer::start(&path, 60).await;
    let (_ws, bytes) = join(running.port, "Alice").await;
    assert_eq!(bytes, vec![0u8; BYTES]);
    running.stop().await;
    assert!(path.exists());
}

#[tokio::test]
async fn test_wrong_size_snapshot_starts_blank() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.bin");
    std::fs::write(&path, vec![0xFFu8; BYTES + 3]).unwrap();

    let running = RunningServer::start(&path, 60).await;
    let (_ws, bytes) = join(running.port, "Alice").await;
    assert_eq!(bytes, vec![0u8; BYTES]);

    running.stop().await;
    assert_eq!(std::fs::read(&path).unwrap().len(), BYTES);
}

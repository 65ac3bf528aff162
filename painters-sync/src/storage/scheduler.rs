//! When the canvas gets written to disk.
//!
//! - once at startup: load (missing → zeroed canvas, wrong size → logged, zeroed)
//! - every `interval`: save if anyone is connected and the canvas changed
//! - when the last client leaves: save if the canvas changed
//! - at shutdown: save unconditionally
//!
//! Saves copy the buffer under the canvas lock and do the file I/O on the
//! blocking pool. A failed save leaves the canvas flagged dirty so the next
//! attempt picks it up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::SyncEngine;
use crate::storage::snapshot::{SnapshotStore, StoreError};

pub struct Persister {
    store: Arc<SnapshotStore>,
    engine: Arc<SyncEngine>,
    interval: Duration,
}

impl Persister {
    pub fn new(store: SnapshotStore, engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            store: Arc::new(store),
            engine,
            interval,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Restore the engine's canvas from disk. Returns whether a snapshot was applied.
    pub async fn load_into_engine(&self) -> bool {
        let store = self.store.clone();
        let loaded = match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
        };

        match loaded {
            Ok(bytes) => match self.engine.restore(&bytes).await {
                Ok(()) => {
                    log::info!(
                        "Loaded canvas snapshot from {} ({} bytes)",
                        self.store.path().display(),
                        bytes.len()
                    );
                    true
                }
                Err(e) => {
                    log::error!("Failed to restore canvas snapshot: {e}");
                    false
                }
            },
            Err(StoreError::NotFound(path)) => {
                log::info!("No canvas snapshot at {}, starting blank", path.display());
                false
            }
            Err(e) => {
                log::error!("Failed to load canvas snapshot: {e}, starting blank");
                false
            }
        }
    }

    /// Periodic save: skipped while nobody is connected or nothing changed.
    pub async fn tick(&self) -> Result<bool, StoreError> {
        if self.engine.connection_count().await == 0 {
            return Ok(false);
        }
        self.save_if_dirty().await
    }

    /// Save only if the canvas changed since the last save.
    pub async fn save_if_dirty(&self) -> Result<bool, StoreError> {
        match self.engine.snapshot_if_dirty().await {
            Some(bytes) => self.write(bytes).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Save regardless of the dirty flag.
    pub async fn save_now(&self) -> Result<(), StoreError> {
        let bytes = self.engine.snapshot().await;
        self.write(bytes).await
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let store = self.store.clone();
        let len = bytes.len();
        let result = match tokio::task::spawn_blocking(move || store.save(&bytes)).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
        };

        match &result {
            Ok(()) => {
                self.engine.record_snapshot_saved().await;
                log::info!("Saved canvas snapshot ({len} bytes) to {}", self.store.path().display());
            }
            Err(e) => {
                self.engine.mark_dirty();
                log::error!("Failed to save canvas snapshot: {e}");
            }
        }
        result
    }

    /// Run [`tick`](Self::tick) every interval until `stop` flips to true.
    pub fn spawn_timer(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Errors are logged in `write`; the next tick retries
                        let _ = self.tick().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Persistence timer stopped");
        })
    }
}

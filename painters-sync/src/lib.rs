//! # painters-sync: shared 1-bit canvas synchronization
//!
//! One server owns a bit-packed canvas; any number of WebSocket clients
//! mirror it, paint on it, and see each other's strokes live.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    text frames      │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────────┐                 ┌─────────────┐     ┌───────────┐
//! │ MirrorReconciler│                 │ SyncEngine  │ ──► │ Persister │
//! │ (local mirror)  │                 │ (authority) │     │ (snapshot)│
//! └─────────────────┘                 └──────┬──────┘     └───────────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`canvas`]: bit-packed grid (`BitCanvas`)
//! - [`chunk`]: size-bounded chunk codec for full syncs
//! - [`protocol`]: tagged text messages for both directions
//! - [`limiter`]: per-connection pixel cooldown
//! - [`broadcast`]: connection registry with ordered per-connection queues
//! - [`engine`]: server-side sync state machine
//! - [`server`]: WebSocket listener driving the engine
//! - [`storage`]: snapshot file and save scheduling
//! - [`mirror`]: client-side reconciliation of chunks and pixel updates
//! - [`client`]: WebSocket client driving the mirror

pub mod broadcast;
pub mod canvas;
pub mod chunk;
pub mod client;
pub mod engine;
pub mod limiter;
pub mod mirror;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, ConnectionState, Outbound};
pub use canvas::{BitCanvas, CanvasError};
pub use chunk::{Chunk, ChunkEncoder, ChunkError, DecodedChunk};
pub use client::{ClientConfig, LinkState, SyncClient, SyncEvent};
pub use engine::{Disposition, EngineError, PixelRejection, SyncEngine};
pub use limiter::RateLimiter;
pub use mirror::{MirrorEvent, MirrorPhase, MirrorReconciler, Outcome};
pub use protocol::{CanvasInfo, ClientMessage, PixelUpdate, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer, SyncTrigger};
pub use storage::{Persister, SnapshotStore, StoreError};

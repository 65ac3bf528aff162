//! Persistence for the shared canvas.
//!
//! ```text
//! ┌─────────────┐  copy under lock  ┌────────────┐  temp + rename  ┌───────────────┐
//! │ SyncEngine  │ ────────────────► │ Persister  │ ──────────────► │ snapshot file │
//! │ (BitCanvas) │ ◄──────────────── │ (timer)    │ ◄────────────── │ (raw bits)    │
//! └─────────────┘     restore       └────────────┘      load       └───────────────┘
//! ```
//!
//! The snapshot file is the packed bit buffer with no header, exactly
//! `ceil(width * height / 8)` bytes. Dimensions come from configuration.

pub mod scheduler;
pub mod snapshot;

pub use scheduler::Persister;
pub use snapshot::{SnapshotStore, StoreError};

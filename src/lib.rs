//! Offline-first sync engine for a multi-platform live-stream viewer.
//!
//! One `SyncOrchestrator` per entity type keeps the on-device store consistent with the backend.
//! Mutations are applied locally and queued, realtime pushes from the backend are applied as
//! they arrive, and divergent versions are merged field by field.

pub mod backend;
pub mod config;
pub mod models;
pub mod network;
pub mod sync;
pub mod utils;

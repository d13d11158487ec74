//! Remote store integration for the sync backend
//!
//! This module provides the adapter contract and the implementations used to reach the
//! authoritative backend. The backend exposes one row-oriented table per entity type plus a
//! realtime channel delivering row-level change events keyed by the authenticated user.

/// REST + realtime WebSocket client
mod client;
/// In-memory backend for tests and offline runs
mod memory;
/// Adapter trait, realtime events and error types
mod types;

pub use client::RestBackend;
pub use memory::{InjectedFailure, MemoryBackend, RemoteCall};
pub use types::*;

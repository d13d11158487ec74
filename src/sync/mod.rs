//! Sync Engine Module
//!
//! This module provides the core logic for keeping the on-device store consistent with the
//! backend under intermittent connectivity. It is composed of several submodules, each
//! responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The main entry point. Drives the connection state machine and every drain pass for one entity type.
//! - `queue`: Durable, ordered queue of pending operations with coalescing and bounded retries.
//! - `repositories`: Local store adapters and queue persistence.
//! - `conflict`: Field-partitioned merge of divergent local and remote versions.
//! - `realtime`: Applies inbound realtime events and runs the subscription pump.
//! - `events`: Event types, the handler trait and the dispatcher fanning events out to collaborators.
//! - `progress_tracker`: Counters per orchestrator and the per-pass conflict cycle guard.
//! - `entity`: The contract every synchronized record type implements.
//!
//! Local mutations never wait on the network. They are written to the local store, appended to
//! the persisted queue, and sent by the orchestrator's worker once it is connected.

/// Conflict resolution between local and remote snapshots
pub mod conflict;
/// Contract for synchronized record types
pub mod entity;
/// Event system for decoupled communication with collaborators
pub mod events;
/// Main coordinator of the sync process
pub mod orchestrator;
/// Counters and the conflict cycle guard
pub mod progress_tracker;
/// Durable operation queue
pub mod queue;
/// Realtime event application
pub mod realtime;
/// Local store and queue persistence
pub mod repositories;
mod types;

pub use entity::SyncEntity;
pub use events::{EventDispatcher, SyncEvent, SyncEventHandler};
pub use orchestrator::{ForceSyncOutcome, SyncOrchestrator};
pub use progress_tracker::SyncStats;
pub use queue::{OperationQueue, RetryPolicy};
pub use repositories::{
    FileLocalStore, FileQueueRepository, LocalStore, MemoryLocalStore, MemoryQueueRepository,
    QueueRepository,
};
pub use types::*;

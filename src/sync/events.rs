//! Event system for the sync engine.
//!
//! This module defines the events an orchestrator produces, the handler trait collaborators
//! implement to observe them, and the dispatcher that fans each event out to every registered
//! handler. The UI layer usually consumes events through the broadcast channel returned by
//! `SyncOrchestrator::subscribe_events`, which is backed by `ChannelEventHandler`.

use crate::sync::{ConflictRecord, EntityKind, SyncError, SyncOperation, SyncStatus};

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events produced by an orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The connection state changed
    StatusChanged(SyncStatus),
    /// An operation for the entity was confirmed by the backend
    EntitySynced {
        entity_type: EntityKind,
        entity_id: String,
    },
    /// A remote update conflicted with local state and was merged
    ConflictResolved(ConflictRecord),
    /// An operation was dropped without reaching the backend
    OperationPermanentlyFailed {
        operation: SyncOperation,
        reason: String,
    },
    /// A local write inside `mutate` failed; nothing was enqueued
    LocalStoreFailed { entity_id: String, reason: String },
    /// A reconciliation pass enqueued a resync for every local entity
    ReconciliationStarted {
        entity_type: EntityKind,
        entities: usize,
    },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in the order they are registered. A failing handler is logged and does
/// not stop the others.
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn SyncEventHandler>>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    pub fn register_handler(&self, handler: Arc<dyn SyncEventHandler>) {
        debug!("Registering sync event handler {}", handler.name());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Dispatch an event to all registered handlers.
    pub async fn dispatch(&self, event: &SyncEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards events into a broadcast channel.
pub struct ChannelEventHandler {
    tx: broadcast::Sender<SyncEvent>,
}

impl ChannelEventHandler {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for ChannelEventHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        // No receivers is not an error; events are fire-and-forget.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Logs every event.
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for TracingEventHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::StatusChanged(status) => info!("Sync status: {}", status),
            SyncEvent::EntitySynced {
                entity_type,
                entity_id,
            } => debug!("Synced {} {}", entity_type, entity_id),
            SyncEvent::ConflictResolved(record) => {
                info!("Conflict resolved for {}", record.entity_id)
            }
            SyncEvent::OperationPermanentlyFailed { operation, reason } => error!(
                "Dropped {:?} for {} {}: {}",
                operation.operation_kind, operation.entity_type, operation.entity_id, reason
            ),
            SyncEvent::LocalStoreFailed { entity_id, reason } => {
                warn!("Local write for {} failed: {}", entity_id, reason)
            }
            SyncEvent::ReconciliationStarted {
                entity_type,
                entities,
            } => info!("Reconciling {} {} entities", entities, entity_type),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

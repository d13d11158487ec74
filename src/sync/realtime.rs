//! Realtime event application.
//!
//! `RealtimeDispatcher` applies inbound change events to the local store. It runs under the
//! engine's apply lock, which outbound sends also hold, so an inbound update and an outbound send
//! for the same entity never interleave. Every decision compares against the current local copy,
//! which makes re-delivered events no-ops.

use crate::backend::{RealtimeEvent, RealtimeStream};
use crate::config::EngineConfig;
use crate::sync::conflict::ConflictResolver;
use crate::sync::entity::same_content;
use crate::sync::events::{EventDispatcher, SyncEvent};
use crate::sync::progress_tracker::SyncProgressTracker;
use crate::sync::queue::OperationQueue;
use crate::sync::repositories::LocalStore;
use crate::sync::{ConflictRecord, OperationKind, SyncEntity, SyncError, SyncOperation};

use futures_util::StreamExt;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What applying one event did to the local store
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The remote snapshot was written verbatim.
    Written,
    /// The entity was removed.
    Removed,
    /// Local and remote diverged; the merge was written and queued for push-back.
    Merged(ConflictRecord),
    /// The event was already reflected locally.
    Ignored,
    /// The entity already went through conflict resolution this pass; local state was kept and
    /// the remote snapshot is replayed when the next pass starts.
    Deferred,
}

/// Applies realtime events for one entity type
pub struct RealtimeDispatcher<E, L> {
    local: Arc<Mutex<L>>,
    queue: Arc<OperationQueue>,
    resolver: ConflictResolver,
    tracker: Arc<Mutex<SyncProgressTracker>>,
    /// Latest remote snapshot per entity whose conflict the cycle guard postponed
    deferred: Mutex<HashMap<String, E>>,
    events: Arc<EventDispatcher>,
    apply_lock: Arc<tokio::sync::Mutex<()>>,
    drain_signal: Arc<Notify>,
    _entity: PhantomData<fn() -> E>,
}

impl<E, L> RealtimeDispatcher<E, L>
where
    E: SyncEntity,
    L: LocalStore<E>,
{
    pub fn new(
        local: Arc<Mutex<L>>,
        queue: Arc<OperationQueue>,
        events: Arc<EventDispatcher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            local,
            queue,
            resolver: ConflictResolver::new(config.conflict_audit_capacity),
            tracker: Arc::new(Mutex::new(SyncProgressTracker::new())),
            deferred: Mutex::new(HashMap::new()),
            events,
            apply_lock: Arc::new(tokio::sync::Mutex::new(())),
            drain_signal: Arc::new(Notify::new()),
            _entity: PhantomData,
        }
    }

    /// Lock serializing realtime apply with outbound sends
    pub fn apply_lock(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.apply_lock
    }

    /// Notified whenever an apply enqueued an operation
    pub fn drain_signal(&self) -> &Arc<Notify> {
        &self.drain_signal
    }

    pub fn tracker(&self) -> &Arc<Mutex<SyncProgressTracker>> {
        &self.tracker
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    fn store(&self) -> MutexGuard<'_, L> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress(&self) -> MutexGuard<'_, SyncProgressTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn postponed(&self) -> MutexGuard<'_, HashMap<String, E>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of postponed conflicts waiting for the next pass
    pub fn deferred_len(&self) -> usize {
        self.postponed().len()
    }

    /// Re-apply the conflicts the cycle guard postponed. Call right after starting a pass.
    ///
    /// Entities removed locally in the meantime are skipped. Returns how many snapshots were
    /// applied again.
    pub async fn replay_deferred(&self) -> usize {
        let postponed: Vec<E> = std::mem::take(&mut *self.postponed()).into_values().collect();
        let mut replayed = 0;

        for remote in postponed {
            let _guard = self.apply_lock.lock().await;
            let present = matches!(self.store().fetch_one(remote.id()), Ok(Some(_)));
            if !present {
                debug!("Dropping postponed conflict for removed {} {}", E::KIND, remote.id());
                continue;
            }
            let id = remote.id().to_string();
            match self.apply_unlocked(RealtimeEvent::Update(remote)).await {
                Ok(_) => replayed += 1,
                Err(e) => warn!("Replaying postponed conflict for {} {} failed: {}", E::KIND, id, e),
            }
        }
        replayed
    }

    /// Apply one event under the apply lock.
    pub async fn apply(&self, event: RealtimeEvent<E>) -> Result<ApplyOutcome, SyncError> {
        let _guard = self.apply_lock.lock().await;
        self.apply_unlocked(event).await
    }

    /// Apply one event. The caller must hold the apply lock.
    pub async fn apply_unlocked(&self, event: RealtimeEvent<E>) -> Result<ApplyOutcome, SyncError> {
        let entity_id = event.entity_id().to_string();
        let kind = event.kind();
        let outcome = self.apply_to_store(event)?;

        match &outcome {
            ApplyOutcome::Written | ApplyOutcome::Removed => {
                debug!("Applied remote {:?} for {} {}", kind, E::KIND, entity_id);
                self.progress().record_applied();
            }
            ApplyOutcome::Ignored => {
                debug!("Remote {:?} for {} {} already applied", kind, E::KIND, entity_id);
                self.progress().record_duplicate();
            }
            ApplyOutcome::Deferred => {
                info!(
                    "Conflict on {} {} deferred to the next reconciliation pass",
                    E::KIND,
                    entity_id
                );
            }
            ApplyOutcome::Merged(record) => {
                self.progress().record_applied();
                self.drain_signal.notify_one();
                self.events
                    .dispatch(&SyncEvent::ConflictResolved(record.clone()))
                    .await;
            }
        }
        Ok(outcome)
    }

    fn apply_to_store(&self, event: RealtimeEvent<E>) -> Result<ApplyOutcome, SyncError> {
        let mut store = self.store();
        // A later event supersedes whatever was postponed for the entity.
        self.postponed().remove(event.entity_id());

        let remote = match event {
            RealtimeEvent::Delete { id } => {
                return Ok(match store.remove(&id)? {
                    Some(_) => ApplyOutcome::Removed,
                    None => ApplyOutcome::Ignored,
                });
            }
            RealtimeEvent::Insert(remote) | RealtimeEvent::Update(remote) => remote,
        };

        let Some(local) = store.fetch_one(remote.id())? else {
            // Deleted here, the delete just has not reached the backend yet.
            if self
                .queue
                .has_pending_kind(E::KIND, remote.id(), OperationKind::Delete)
            {
                return Ok(ApplyOutcome::Ignored);
            }
            store.put(remote)?;
            return Ok(ApplyOutcome::Written);
        };

        if same_content(&local, &remote) {
            return Ok(ApplyOutcome::Ignored);
        }
        if local.updated_at() < remote.updated_at() {
            store.put(remote)?;
            return Ok(ApplyOutcome::Written);
        }

        // Local is at least as new and diverges.
        let merged = self.resolver.merge(&local, &remote)?;
        if same_content(&merged, &local) {
            return Ok(ApplyOutcome::Ignored);
        }
        if !self.progress().begin_resolution(local.id()) {
            self.postponed().insert(remote.id().to_string(), remote);
            return Ok(ApplyOutcome::Deferred);
        }

        let (merged, record) = self.resolver.resolve(&local, &remote)?;
        store.put(merged.clone())?;
        drop(store);

        let resync = SyncOperation::new(
            E::KIND,
            merged.id(),
            OperationKind::Resync,
            merged.owner_id(),
            None,
            self.queue.policy().max_retries,
        );
        if let Err(e) = self.queue.enqueue(resync) {
            // The merge is stored; the next reconciliation pass pushes it instead.
            error!("Failed to enqueue push-back of {} {}: {}", E::KIND, merged.id(), e);
        }
        Ok(ApplyOutcome::Merged(record))
    }
}

/// A running subscription pump. Dropping it cancels the subscription.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Apply events from `stream` in arrival order until it ends, then call `on_closed`.
pub fn spawn_pump<E, L, F>(
    mut stream: RealtimeStream<E>,
    dispatcher: Arc<RealtimeDispatcher<E, L>>,
    on_closed: F,
) -> Subscription
where
    E: SyncEntity,
    L: LocalStore<E>,
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if let Err(e) = dispatcher.apply(event).await {
                        warn!("Failed to apply realtime event for {}: {}", E::KIND, e);
                    }
                }
                Err(e) => warn!("Skipping undecodable realtime event for {}: {}", E::KIND, e),
            }
        }
        info!("Realtime subscription for {} ended", E::KIND);
        on_closed();
    });
    Subscription { handle }
}

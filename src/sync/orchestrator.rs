//! Sync orchestrator and integration point for all sync services.
//!
//! This module defines the `SyncOrchestrator`, which keeps one entity type of the on-device store
//! consistent with the backend. It wires together the local store, the remote adapter, the
//! operation queue and the realtime dispatcher, and drives them from a single worker task.
//!
//! The orchestrator is responsible for:
//! - Moving between `disconnected`, `connecting` and `connected` as reachability and the session change
//! - Subscribing to realtime changes once connected and reconnecting with backoff when that fails
//! - Draining the queue on connect, on every mutation, when retries become due, and on reconciliation
//! - Running the periodic reconciliation pass that repairs missed realtime events
//! - Accepting local mutations at any time without touching the network
//!
//! Everything that can trigger a drain funnels into the worker's `select!` loop, so one
//! orchestrator never runs two drain passes at once.

use crate::backend::{BackendError, RealtimeEvent, RemoteStore};
use crate::config::EngineConfig;
use crate::network::{NetworkMonitor, Reachability};
use crate::sync::entity::same_content;
use crate::sync::events::{
    ChannelEventHandler, EventDispatcher, SyncEvent, SyncEventHandler, TracingEventHandler,
};
use crate::sync::progress_tracker::SyncStats;
use crate::sync::queue::{DrainReport, OperationOutcome, OperationQueue};
use crate::sync::realtime::{RealtimeDispatcher, Subscription, spawn_pump};
use crate::sync::repositories::{LocalStore, QueueRepository};
use crate::sync::{
    AuthSession, ConflictRecord, OperationKind, SyncEntity, SyncError, SyncOperation, SyncStatus,
};

use backoff::ExponentialBackoffBuilder;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the broadcast channel behind `subscribe_events`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of `SyncOrchestrator::force_sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceSyncOutcome {
    /// The backend confirmed the entity before returning.
    Synced,
    /// The push did not happen now; a resync operation is queued.
    Queued,
    /// The local write failed; nothing was queued.
    Failed(String),
}

enum Command {
    SessionChanged,
    Reconcile,
    SubscriptionClosed(u64),
    Shutdown,
}

/// State shared between the public handle and the worker
struct Shared<E, L, R> {
    local: Arc<Mutex<L>>,
    remote: Arc<R>,
    queue: Arc<OperationQueue>,
    dispatcher: Arc<RealtimeDispatcher<E, L>>,
    events: Arc<EventDispatcher>,
    channel: Arc<ChannelEventHandler>,
    network: Arc<NetworkMonitor>,
    status: watch::Sender<SyncStatus>,
    session: RwLock<Option<AuthSession>>,
    config: EngineConfig,
}

impl<E, L, R> Shared<E, L, R>
where
    E: SyncEntity,
    L: LocalStore<E>,
    R: RemoteStore<E>,
{
    fn store(&self) -> MutexGuard<'_, L> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Option<AuthSession> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    fn is_online(&self) -> bool {
        self.network.current().is_reachable() && self.status() == SyncStatus::Connected
    }

    fn user_for(&self, owner_id: &str) -> String {
        self.session()
            .map(|session| session.user_id)
            .unwrap_or_else(|| owner_id.to_string())
    }

    async fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("{} sync is now {}", E::KIND, status);
            self.events.dispatch(&SyncEvent::StatusChanged(status)).await;
        }
    }

    /// Write locally and enqueue under one store lock, so queue order matches write order.
    fn mutate_local(&self, entity: E, kind: OperationKind) -> Result<(), SyncError> {
        let entity_id = entity.id().to_string();
        let user_id = self.user_for(entity.owner_id());

        let mut store = self.store();
        let payload = match kind {
            OperationKind::Create => Some(serde_json::to_value(store.insert(entity)?)?),
            OperationKind::Update => Some(serde_json::to_value(store.update(entity)?)?),
            OperationKind::Delete => {
                if !store.delete(&entity_id)? {
                    debug!("Deleting {} {} that is not stored locally", E::KIND, entity_id);
                }
                None
            }
            OperationKind::Resync => None,
        };

        let operation = SyncOperation::new(
            E::KIND,
            entity_id,
            kind,
            user_id,
            payload,
            self.config.retry.max_retries,
        );
        self.queue.enqueue(operation)?;
        Ok(())
    }

    fn enqueue_resync(&self, entity: &E) -> Result<(), SyncError> {
        let operation = SyncOperation::new(
            E::KIND,
            entity.id(),
            OperationKind::Resync,
            self.user_for(entity.owner_id()),
            None,
            self.config.retry.max_retries,
        );
        self.queue.enqueue(operation)?;
        Ok(())
    }

    /// Drain handler: send one operation and classify the result.
    async fn send_operation(&self, operation: SyncOperation) -> OperationOutcome {
        if !self.is_online() {
            return OperationOutcome::Deferred;
        }

        let _guard = self.dispatcher.apply_lock().lock().await;
        match self.push(&operation).await {
            Ok(()) => OperationOutcome::Completed,
            Err(SyncError::BackendError(e)) if e.is_not_found() => {
                debug!("{} {} is gone remotely", E::KIND, operation.entity_id);
                OperationOutcome::AlreadyGone
            }
            Err(SyncError::BackendError(e)) if e.is_retryable() => {
                OperationOutcome::Retry(e.to_string())
            }
            Err(e) => OperationOutcome::Reject(e.to_string()),
        }
    }

    async fn push(&self, operation: &SyncOperation) -> Result<(), SyncError> {
        let id = operation.entity_id.as_str();
        match operation.operation_kind {
            OperationKind::Create => {
                let entity: E = match &operation.payload {
                    Some(payload) => serde_json::from_value(payload.clone())?,
                    None => match self.store().fetch_one(id)? {
                        Some(entity) => entity,
                        None => return Ok(()),
                    },
                };
                self.remote.create(&entity).await?;
            }
            OperationKind::Update => {
                let delta = match &operation.payload {
                    Some(payload) => payload.clone(),
                    None => match self.store().fetch_one(id)? {
                        Some(entity) => serde_json::to_value(&entity)?,
                        None => return Ok(()),
                    },
                };
                self.remote.update(id, &delta).await?;
            }
            OperationKind::Delete => self.remote.delete(id).await?,
            OperationKind::Resync => self.resync(id).await?,
        }
        Ok(())
    }

    /// Compare the local copy with the backend and repair whichever side is behind.
    async fn resync(&self, id: &str) -> Result<(), SyncError> {
        let Some(local) = self.store().fetch_one(id)? else {
            return Ok(());
        };

        match self.remote.fetch_one(id).await? {
            None => {
                self.remote.create(&local).await?;
            }
            Some(remote) if remote.updated_at() > local.updated_at() => {
                self.dispatcher
                    .apply_unlocked(RealtimeEvent::Update(remote))
                    .await?;
            }
            Some(remote) if same_content(&local, &remote) => {}
            Some(_) => {
                self.remote
                    .update(id, &serde_json::to_value(&local)?)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fetch-then-write push of one entity, retried with backoff until `force_sync_timeout`.
    async fn push_now(&self, entity: &E) -> Result<(), BackendError> {
        let timeout = self.config.force_sync_timeout();
        let retry = &self.config.retry;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(retry.base_delay_ms))
            .with_multiplier(retry.multiplier)
            .with_max_interval(Duration::from_millis(retry.max_delay_ms))
            .with_max_elapsed_time(Some(timeout))
            .build();

        let snapshot = &serde_json::to_value(entity)?;
        let attempt = || async move {
            let result = match self.remote.fetch_one(entity.id()).await {
                Ok(None) => self.remote.create(entity).await.map(|_| ()),
                Ok(Some(_)) => self.remote.update(entity.id(), snapshot).await.map(|_| ()),
                Err(e) => Err(e),
            };
            result.map_err(|e| {
                if e.is_retryable() {
                    debug!("Forced push of {} {} failed: {}", E::KIND, entity.id(), e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        };

        match tokio::time::timeout(timeout, backoff::future::retry(policy, attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Unavailable(format!(
                "no confirmation within {:?}",
                timeout
            ))),
        }
    }

    async fn report(&self, report: DrainReport) {
        {
            let mut tracker = self
                .dispatcher
                .tracker()
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            tracker.record_synced(report.completed.len());
            tracker.record_failed(report.failed.len());
        }

        for operation in report.completed {
            self.events
                .dispatch(&SyncEvent::EntitySynced {
                    entity_type: operation.entity_type,
                    entity_id: operation.entity_id,
                })
                .await;
        }
        for (operation, reason) in report.failed {
            self.events
                .dispatch(&SyncEvent::OperationPermanentlyFailed { operation, reason })
                .await;
        }
    }
}

/// Sync orchestrator for one entity type.
///
/// Construct one per entity type with injected adapters, register handlers, then `start` it on a
/// tokio runtime. Mutations are accepted before `start` and while offline; they are persisted and
/// sent once the orchestrator reaches `connected`.
pub struct SyncOrchestrator<E, L, R> {
    shared: Arc<Shared<E, L, R>>,
    commands: mpsc::UnboundedSender<Command>,
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E, L, R> SyncOrchestrator<E, L, R>
where
    E: SyncEntity,
    L: LocalStore<E>,
    R: RemoteStore<E>,
{
    /// Create an orchestrator. The persisted queue is loaded before this returns.
    pub fn new(
        local: L,
        remote: R,
        queue_repository: impl QueueRepository + 'static,
        network: Arc<NetworkMonitor>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let local = Arc::new(Mutex::new(local));
        let queue = Arc::new(OperationQueue::open(queue_repository, config.retry.clone())?);

        let events = Arc::new(EventDispatcher::new());
        let channel = Arc::new(ChannelEventHandler::new(EVENT_CHANNEL_CAPACITY));
        events.register_handler(channel.clone());
        events.register_handler(Arc::new(TracingEventHandler));

        let dispatcher = Arc::new(RealtimeDispatcher::new(
            local.clone(),
            queue.clone(),
            events.clone(),
            &config,
        ));
        let (status, _) = watch::channel(SyncStatus::Disconnected);
        let (commands, pending_commands) = mpsc::unbounded_channel();

        info!(
            "Created {} sync orchestrator with {} pending operations",
            E::KIND,
            queue.len()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                local,
                remote: Arc::new(remote),
                queue,
                dispatcher,
                events,
                channel,
                network,
                status,
                session: RwLock::new(None),
                config,
            }),
            commands,
            pending_commands: Mutex::new(Some(pending_commands)),
            worker: Mutex::new(None),
        })
    }

    /// Register an additional event handler.
    pub fn register_handler(&self, handler: Arc<dyn SyncEventHandler>) {
        self.shared.events.register_handler(handler);
    }

    /// Spawn the worker task. Must be called within a tokio runtime.
    pub fn start(&self) {
        let Some(commands) = self
            .pending_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("{} sync orchestrator already started", E::KIND);
            return;
        };

        let worker = Worker::new(self.shared.clone(), commands, self.commands.downgrade());
        let handle = tokio::spawn(worker.run());
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Write `entity` locally and queue the matching operation.
    ///
    /// Never touches the network and never fails from the caller's perspective. A failed local
    /// write is reported as `SyncEvent::LocalStoreFailed`.
    pub async fn mutate(&self, entity: E, kind: OperationKind) {
        let entity_id = entity.id().to_string();
        match self.shared.mutate_local(entity, kind) {
            Ok(()) => self.shared.dispatcher.drain_signal().notify_one(),
            Err(e) => {
                error!("Local {:?} of {} {} failed: {}", kind, E::KIND, entity_id, e);
                self.shared
                    .events
                    .dispatch(&SyncEvent::LocalStoreFailed {
                        entity_id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Write `entity` locally and try to push it right away.
    ///
    /// Falls back to queueing a resync when offline, when earlier operations for the entity are
    /// still pending, or when the push is not confirmed within `force_sync_timeout`.
    pub async fn force_sync(&self, entity: E) -> ForceSyncOutcome {
        let shared = &self.shared;
        let entity_id = entity.id().to_string();
        let stored = shared.store().update(entity);
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                error!("Local write of {} {} failed: {}", E::KIND, entity_id, e);
                shared
                    .events
                    .dispatch(&SyncEvent::LocalStoreFailed {
                        entity_id,
                        reason: e.to_string(),
                    })
                    .await;
                return ForceSyncOutcome::Failed(e.to_string());
            }
        };

        if shared.is_online() && !shared.queue.has_pending(E::KIND, stored.id()) {
            let result = {
                let _guard = shared.dispatcher.apply_lock().lock().await;
                shared.push_now(&stored).await
            };
            match result {
                Ok(()) => {
                    shared
                        .dispatcher
                        .tracker()
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .record_synced(1);
                    shared
                        .events
                        .dispatch(&SyncEvent::EntitySynced {
                            entity_type: E::KIND,
                            entity_id: stored.id().to_string(),
                        })
                        .await;
                    return ForceSyncOutcome::Synced;
                }
                Err(e) => warn!(
                    "Forced sync of {} {} failed, queueing: {}",
                    E::KIND,
                    stored.id(),
                    e
                ),
            }
        }

        if let Err(e) = shared.enqueue_resync(&stored) {
            error!("Failed to queue {} {}: {}", E::KIND, stored.id(), e);
            return ForceSyncOutcome::Failed(e.to_string());
        }
        shared.dispatcher.drain_signal().notify_one();
        ForceSyncOutcome::Queued
    }

    pub fn current_status(&self) -> SyncStatus {
        self.shared.status()
    }

    /// Receiver that observes every status transition
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.channel.subscribe()
    }

    /// Replace the authenticated session. `None` signs out and disconnects.
    pub fn set_session(&self, session: Option<AuthSession>) {
        self.shared.remote.authorize(session.as_ref());
        *self
            .shared
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner()) = session;
        let _ = self.commands.send(Command::SessionChanged);
    }

    /// Run a reconciliation pass now instead of waiting for the timer.
    pub fn reconcile_now(&self) {
        let _ = self.commands.send(Command::Reconcile);
    }

    pub fn fetch_local(&self, id: &str) -> Result<Option<E>, SyncError> {
        self.shared.store().fetch_one(id)
    }

    pub fn fetch_all_local(&self) -> Result<Vec<E>, SyncError> {
        self.shared.store().fetch_all()
    }

    /// Operations not yet confirmed, in the order they will be sent
    pub fn pending_operations(&self) -> Vec<SyncOperation> {
        self.shared.queue.pending()
    }

    pub fn stats(&self) -> SyncStats {
        self.shared
            .dispatcher
            .tracker()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_stats()
    }

    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.shared.dispatcher.resolver().audit_log()
    }

    /// Stop the worker, cancel the subscription and every pending timer.
    ///
    /// Pending operations stay in the persisted queue.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("{} sync worker panicked: {}", E::KIND, e);
                }
            }
        }
        info!("{} sync orchestrator stopped", E::KIND);
    }
}

impl<E, L, R> Drop for SyncOrchestrator<E, L, R> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// The single task that owns connection state and runs every drain pass
struct Worker<E, L, R> {
    shared: Arc<Shared<E, L, R>>,
    commands: mpsc::UnboundedReceiver<Command>,
    loopback: mpsc::WeakUnboundedSender<Command>,
    network: watch::Receiver<Reachability>,
    subscription: Option<Subscription>,
    connected_session: Option<AuthSession>,
    generation: u64,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl<E, L, R> Worker<E, L, R>
where
    E: SyncEntity,
    L: LocalStore<E>,
    R: RemoteStore<E>,
{
    fn new(
        shared: Arc<Shared<E, L, R>>,
        commands: mpsc::UnboundedReceiver<Command>,
        loopback: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let network = shared.network.subscribe();
        Self {
            shared,
            commands,
            loopback,
            network,
            subscription: None,
            connected_session: None,
            generation: 0,
            reconnect_at: None,
            reconnect_attempts: 0,
        }
    }

    async fn run(mut self) {
        info!("Starting {} sync worker", E::KIND);

        let period = self.shared.config.reconcile_interval();
        let mut reconcile = tokio::time::interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let drain_signal = self.shared.dispatcher.drain_signal().clone();
        let mut network_open = true;

        self.network.borrow_and_update();
        self.evaluate().await;

        loop {
            let connected = self.shared.status() == SyncStatus::Connected;
            let retry_at = if connected {
                self.shared.queue.next_due()
            } else {
                None
            };
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::SessionChanged) => self.evaluate().await,
                    Some(Command::Reconcile) => self.reconcile().await,
                    Some(Command::SubscriptionClosed(generation)) => {
                        self.subscription_closed(generation).await
                    }
                },
                changed = self.network.changed(), if network_open => {
                    if changed.is_err() {
                        warn!("Network monitor went away; keeping last known reachability");
                        network_open = false;
                    } else {
                        self.network.borrow_and_update();
                        self.evaluate().await;
                    }
                }
                _ = reconcile.tick() => {
                    if connected {
                        self.reconcile().await;
                    }
                }
                _ = drain_signal.notified() => {
                    if connected {
                        self.drain().await;
                    }
                }
                _ = sleep_until_opt(retry_at), if retry_at.is_some() => self.drain().await,
                _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.evaluate().await;
                }
            }
        }

        self.disconnect().await;
        info!("{} sync worker stopped", E::KIND);
    }

    /// Bring connection state in line with reachability and the session.
    async fn evaluate(&mut self) {
        let reachable = self.network.borrow().is_reachable();
        let session = self.shared.session();

        match (reachable, session) {
            (true, Some(session)) => {
                let current = self.shared.status();
                if current == SyncStatus::Connected
                    && self.connected_session.as_ref() == Some(&session)
                {
                    return;
                }
                if current == SyncStatus::Connected {
                    info!("Session changed, resubscribing {}", E::KIND);
                    self.disconnect().await;
                }
                if self.reconnect_at.is_some() {
                    // Backing off; the reconnect timer retries.
                    return;
                }
                self.connect(session).await;
            }
            (reachable, session) => {
                if !reachable {
                    debug!("{} sync offline", E::KIND);
                } else if session.is_none() {
                    debug!("{} sync has no session", E::KIND);
                }
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.disconnect().await;
            }
        }
    }

    async fn connect(&mut self, session: AuthSession) {
        self.shared.set_status(SyncStatus::Connecting).await;
        self.shared.remote.authorize(Some(&session));

        match self.shared.remote.subscribe(&session).await {
            Ok(stream) => {
                self.generation += 1;
                let generation = self.generation;
                let loopback = self.loopback.clone();
                self.subscription = Some(spawn_pump(
                    stream,
                    self.shared.dispatcher.clone(),
                    move || {
                        if let Some(tx) = loopback.upgrade() {
                            let _ = tx.send(Command::SubscriptionClosed(generation));
                        }
                    },
                ));
                self.connected_session = Some(session);
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.shared.set_status(SyncStatus::Connected).await;
                self.drain().await;
            }
            Err(e) => {
                self.shared.set_status(SyncStatus::Disconnected).await;
                if !e.is_retryable() {
                    error!(
                        "{} subscription refused, waiting for a session or network change: {}",
                        E::KIND,
                        e
                    );
                } else {
                    warn!("{} subscription failed: {}", E::KIND, e);
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempts += 1;
        let delay = self.shared.config.retry.delay_for(self.reconnect_attempts);
        info!(
            "Reconnecting {} in {:?} (attempt {})",
            E::KIND,
            delay,
            self.reconnect_attempts
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn disconnect(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.connected_session = None;
        self.shared.set_status(SyncStatus::Disconnected).await;
    }

    async fn subscription_closed(&mut self, generation: u64) {
        if generation != self.generation || self.subscription.is_none() {
            return;
        }
        warn!("{} realtime subscription closed by the backend", E::KIND);
        self.disconnect().await;
        self.schedule_reconnect();
    }

    async fn drain(&mut self) {
        if self.shared.status() != SyncStatus::Connected {
            return;
        }

        let shared = self.shared.clone();
        let report = self
            .shared
            .queue
            .drain(|operation| {
                let shared = shared.clone();
                async move { shared.send_operation(operation).await }
            })
            .await;

        if !report.completed.is_empty() || !report.failed.is_empty() {
            debug!(
                "{} drain: {} sent, {} failed, {} retrying, {} pending",
                E::KIND,
                report.completed.len(),
                report.failed.len(),
                report.retried,
                self.shared.queue.len()
            );
        }
        self.shared.report(report).await;
    }

    /// Queue a resync for every local entity, then drain.
    async fn reconcile(&mut self) {
        if self.shared.status() != SyncStatus::Connected {
            debug!("Skipping {} reconciliation while offline", E::KIND);
            return;
        }

        self.shared
            .dispatcher
            .tracker()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start_pass();

        let replayed = self.shared.dispatcher.replay_deferred().await;
        if replayed > 0 {
            info!("Replayed {} postponed {} conflicts", replayed, E::KIND);
        }

        let entities = match self.shared.store().fetch_all() {
            Ok(entities) => entities,
            Err(e) => {
                error!("Reconciliation of {} could not read the local store: {}", E::KIND, e);
                return;
            }
        };
        for entity in &entities {
            if let Err(e) = self.shared.enqueue_resync(entity) {
                error!("Failed to queue resync of {} {}: {}", E::KIND, entity.id(), e);
            }
        }

        self.shared
            .events
            .dispatch(&SyncEvent::ReconciliationStarted {
                entity_type: E::KIND,
                entities: entities.len(),
            })
            .await;
        self.drain().await;

        self.shared
            .dispatcher
            .tracker()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log_progress();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! In-memory backend with realtime fan-out and failure injection.
//!
//! `MemoryBackend` behaves like a single authoritative table: writes are stored, echoed to all
//! realtime subscribers, and recorded in a call log. Clones share state, so a test can hold one
//! handle while the engine owns another, and `push_remote_*` simulates writes made by another
//! device of the same user.

use super::types::*;
use crate::sync::{AuthSession, SyncEntity};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One recorded call against the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    FetchOne(String),
    Create(String),
    Update(String),
    Delete(String),
    Subscribe(String),
}

/// Failure to inject into backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transient network failure.
    Network,
    /// The session is no longer authorized.
    Unauthorized,
    /// The backend refuses the request for good.
    Rejected,
}

impl InjectedFailure {
    fn to_error(self) -> BackendError {
        match self {
            InjectedFailure::Network => BackendError::Unavailable("injected network failure".into()),
            InjectedFailure::Unauthorized => {
                BackendError::Unauthorized("injected authorization failure".into())
            }
            InjectedFailure::Rejected => BackendError::Rejected("injected rejection".into()),
        }
    }
}

struct MemoryState<E> {
    rows: BTreeMap<String, E>,
    subscribers: Vec<mpsc::UnboundedSender<Result<RealtimeEvent<E>, BackendError>>>,
    calls: Vec<(RemoteCall, Instant)>,
    failure: Option<InjectedFailure>,
    /// Remaining failing calls; `None` fails until cleared.
    failures_left: Option<usize>,
}

/// Shared in-memory table for one entity type
pub struct MemoryBackend<E> {
    state: Arc<Mutex<MemoryState<E>>>,
}

impl<E> Clone for MemoryBackend<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E: SyncEntity> Default for MemoryBackend<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SyncEntity> MemoryBackend<E> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                rows: BTreeMap::new(),
                subscribers: Vec::new(),
                calls: Vec::new(),
                failure: None,
                failures_left: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail calls with `failure`, for `times` calls or until cleared when `None`.
    pub fn inject_failure(&self, failure: InjectedFailure, times: Option<usize>) {
        let mut state = self.lock();
        if times == Some(0) {
            state.failure = None;
            state.failures_left = None;
            return;
        }
        state.failure = Some(failure);
        state.failures_left = times;
    }

    pub fn clear_failure(&self) {
        let mut state = self.lock();
        state.failure = None;
        state.failures_left = None;
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.iter().map(|(call, _)| call.clone()).collect()
    }

    /// All calls with the instant they were made.
    pub fn timed_calls(&self) -> Vec<(RemoteCall, Instant)> {
        self.lock().calls.clone()
    }

    pub fn row(&self, id: &str) -> Option<E> {
        self.lock().rows.get(id).cloned()
    }

    pub fn rows(&self) -> Vec<E> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Store a row without notifying subscribers.
    pub fn seed(&self, entity: E) {
        self.lock().rows.insert(entity.id().to_string(), entity);
    }

    /// Simulate another device writing `entity`.
    pub fn push_remote_update(&self, entity: E) {
        let mut state = self.lock();
        let existed = state
            .rows
            .insert(entity.id().to_string(), entity.clone())
            .is_some();
        let event = if existed {
            RealtimeEvent::Update(entity)
        } else {
            RealtimeEvent::Insert(entity)
        };
        Self::broadcast(&mut state, event);
    }

    /// Simulate another device deleting `id`.
    pub fn push_remote_delete(&self, id: &str) {
        let mut state = self.lock();
        state.rows.remove(id);
        Self::broadcast(&mut state, RealtimeEvent::Delete { id: id.to_string() });
    }

    /// Deliver an event to subscribers without touching the rows.
    pub fn deliver(&self, event: RealtimeEvent<E>) {
        let mut state = self.lock();
        Self::broadcast(&mut state, event);
    }

    /// Close all realtime subscriptions from the backend side.
    pub fn drop_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    fn broadcast(state: &mut MemoryState<E>, event: RealtimeEvent<E>) {
        state
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Record the call and apply any injected failure.
    fn begin(&self, call: RemoteCall) -> Result<MutexGuard<'_, MemoryState<E>>, BackendError> {
        let mut state = self.lock();
        state.calls.push((call, Instant::now()));

        if let Some(failure) = state.failure {
            match state.failures_left {
                Some(n) if n > 1 => state.failures_left = Some(n - 1),
                Some(_) => {
                    state.failure = None;
                    state.failures_left = None;
                }
                None => {}
            }
            return Err(failure.to_error());
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl<E: SyncEntity> RemoteStore<E> for MemoryBackend<E> {
    async fn fetch_one(&self, id: &str) -> Result<Option<E>, BackendError> {
        let state = self.begin(RemoteCall::FetchOne(id.to_string()))?;
        Ok(state.rows.get(id).cloned())
    }

    async fn create(&self, entity: &E) -> Result<E, BackendError> {
        let mut state = self.begin(RemoteCall::Create(entity.id().to_string()))?;
        let existed = state
            .rows
            .insert(entity.id().to_string(), entity.clone())
            .is_some();
        let event = if existed {
            RealtimeEvent::Update(entity.clone())
        } else {
            RealtimeEvent::Insert(entity.clone())
        };
        Self::broadcast(&mut state, event);
        Ok(entity.clone())
    }

    async fn update(&self, id: &str, delta: &serde_json::Value) -> Result<E, BackendError> {
        let mut state = self.begin(RemoteCall::Update(id.to_string()))?;
        let current = state
            .rows
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

        let mut merged = serde_json::to_value(&current)?;
        match (merged.as_object_mut(), delta.as_object()) {
            (Some(row), Some(changes)) => {
                for (field, value) in changes {
                    row.insert(field.clone(), value.clone());
                }
            }
            _ => return Err(BackendError::Rejected("update delta must be an object".into())),
        }
        let updated: E = serde_json::from_value(merged)?;

        state.rows.insert(id.to_string(), updated.clone());
        Self::broadcast(&mut state, RealtimeEvent::Update(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.begin(RemoteCall::Delete(id.to_string()))?;
        if state.rows.remove(id).is_none() {
            return Err(BackendError::NotFound(id.to_string()));
        }
        Self::broadcast(&mut state, RealtimeEvent::Delete { id: id.to_string() });
        Ok(())
    }

    async fn subscribe(&self, session: &AuthSession) -> Result<RealtimeStream<E>, BackendError> {
        let mut state = self.begin(RemoteCall::Subscribe(session.user_id.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

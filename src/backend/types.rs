//! Types for the remote backend: adapter trait, realtime events and errors

use crate::sync::{AuthSession, SyncEntity};

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Row-level change kind as delivered by the realtime channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A realtime change event, decoded into the entity type at the adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent<E> {
    /// A row was inserted on the backend.
    Insert(E),
    /// A row was updated on the backend.
    Update(E),
    /// A row was deleted on the backend. Only the id survives a delete.
    Delete { id: String },
}

impl<E: SyncEntity> RealtimeEvent<E> {
    /// Id of the entity this event refers to.
    pub fn entity_id(&self) -> &str {
        match self {
            RealtimeEvent::Insert(entity) | RealtimeEvent::Update(entity) => entity.id(),
            RealtimeEvent::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            RealtimeEvent::Insert(_) => ChangeKind::Insert,
            RealtimeEvent::Update(_) => ChangeKind::Update,
            RealtimeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Raw change payload pushed by the backend for one table.
///
/// `record` carries the new row for inserts and updates; deletes only carry `oldRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub event_type: ChangeKind,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
}

impl ChangePayload {
    /// Decode the untyped payload into a typed realtime event.
    pub fn decode<E: SyncEntity>(self) -> Result<RealtimeEvent<E>, BackendError> {
        match self.event_type {
            ChangeKind::Insert | ChangeKind::Update => {
                let record = self.record.ok_or_else(|| {
                    BackendError::Protocol(format!("{:?} event without record", self.event_type))
                })?;
                let entity: E = serde_json::from_value(record)?;
                Ok(if self.event_type == ChangeKind::Insert {
                    RealtimeEvent::Insert(entity)
                } else {
                    RealtimeEvent::Update(entity)
                })
            }
            ChangeKind::Delete => {
                let id = self
                    .old_record
                    .as_ref()
                    .or(self.record.as_ref())
                    .and_then(|r| r.get("id"))
                    .and_then(|id| id.as_str())
                    .ok_or_else(|| BackendError::Protocol("DELETE event without id".to_string()))?;
                Ok(RealtimeEvent::Delete { id: id.to_string() })
            }
        }
    }
}

/// Stream of realtime events. Dropping it cancels the subscription.
pub type RealtimeStream<E> =
    Pin<Box<dyn futures_util::Stream<Item = Result<RealtimeEvent<E>, BackendError>> + Send>>;

/// CRUD and realtime subscription against the authoritative backend.
#[async_trait::async_trait]
pub trait RemoteStore<E: SyncEntity>: Send + Sync + 'static {
    /// Fetch a single row by id, `None` if it does not exist.
    async fn fetch_one(&self, id: &str) -> Result<Option<E>, BackendError>;

    /// Create the row. Replaying a create for an existing id must be harmless.
    async fn create(&self, entity: &E) -> Result<E, BackendError>;

    /// Apply a partial update and return the stored row.
    async fn update(&self, id: &str, delta: &serde_json::Value) -> Result<E, BackendError>;

    /// Delete the row.
    async fn delete(&self, id: &str) -> Result<(), BackendError>;

    /// Subscribe to row changes for the session's user.
    async fn subscribe(&self, session: &AuthSession) -> Result<RealtimeStream<E>, BackendError>;

    /// Hand the current credentials to the adapter.
    fn authorize(&self, _session: Option<&AuthSession>) {}
}

/// Error types for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Realtime protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Transient failures that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::HttpError(e) => !e.is_decode() && !e.is_builder(),
            BackendError::WebSocketError(_)
            | BackendError::Unavailable(_)
            | BackendError::Protocol(_) => true,
            BackendError::JsonError(_)
            | BackendError::Unauthorized(_)
            | BackendError::NotFound(_)
            | BackendError::Rejected(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }
}

use crate::backend::BackendError;
use crate::utils::generate_id;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity types participating in sync, one backend table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Stream,
    Layout,
    Session,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Stream => "stream",
            EntityKind::Layout => "layout",
            EntityKind::Session => "session",
        }
    }

    /// Backend table holding rows of this kind
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Stream => "streams",
            EntityKind::Layout => "layouts",
            EntityKind::Session => "sessions",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation a queued operation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Re-read the local entity at send time and reconcile it with the backend.
    Resync,
}

impl OperationKind {
    /// Kinds where a newer pending operation supersedes an older one.
    pub fn coalesces(&self) -> bool {
        matches!(self, OperationKind::Update | OperationKind::Resync)
    }
}

/// A single intended mutation against the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique id, used for idempotent dedup.
    pub id: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation_kind: OperationKind,
    pub user_id: String,
    /// Snapshot or delta to send. `None` means re-read from the local store at send time.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    pub fn new(
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        operation_kind: OperationKind,
        user_id: impl Into<String>,
        payload: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: generate_id(),
            entity_type,
            entity_id: entity_id.into(),
            operation_kind,
            user_id: user_id.into(),
            payload,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        }
    }

    /// True once the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether both operations target the same entity
    pub fn same_target(&self, other: &SyncOperation) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }
}

/// Process-wide connection state of one orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Remote metadata wins, local preference fields are kept.
    FieldPartitioned,
}

/// Outcome of merging a divergent local and remote version of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub entity_id: String,
    pub local_snapshot: serde_json::Value,
    pub remote_snapshot: serde_json::Value,
    pub resolution_strategy: ResolutionStrategy,
    pub resolved_snapshot: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Authenticated session supplied by the authentication collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
}

impl AuthSession {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

/// Error types for the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    BackendError(#[from] BackendError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Merge error: {0}")]
    MergeError(String),

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Sync engine is not running")]
    EngineStopped,
}

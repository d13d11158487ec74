//! Field-partitioned conflict resolution.
//!
//! Remote values win for server-authoritative fields, local values win for the entity's
//! `LOCAL_FIELDS`, and the merged `updatedAt` lands strictly after both inputs.

use crate::sync::entity::UPDATED_AT_FIELD;
use crate::sync::{ConflictRecord, ResolutionStrategy, SyncEntity, SyncError};

use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Added to the newer input timestamp so the merge is newer than both.
pub const MERGE_EPSILON_MS: i64 = 1;

/// Merges divergent versions of one entity and keeps a bounded audit log.
pub struct ConflictResolver {
    log: Mutex<VecDeque<ConflictRecord>>,
    capacity: usize,
}

impl ConflictResolver {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Merge `local` and `remote` without recording anything.
    pub fn merge<E: SyncEntity>(&self, local: &E, remote: &E) -> Result<E, SyncError> {
        let merged = merge_snapshots(
            &serde_json::to_value(local)?,
            &serde_json::to_value(remote)?,
            E::LOCAL_FIELDS,
            merged_timestamp(local, remote),
        )?;
        Ok(serde_json::from_value(merged)?)
    }

    /// Merge `local` and `remote` and record the resolution.
    pub fn resolve<E: SyncEntity>(
        &self,
        local: &E,
        remote: &E,
    ) -> Result<(E, ConflictRecord), SyncError> {
        let local_snapshot = serde_json::to_value(local)?;
        let remote_snapshot = serde_json::to_value(remote)?;

        let merged_snapshot = merge_snapshots(
            &local_snapshot,
            &remote_snapshot,
            E::LOCAL_FIELDS,
            merged_timestamp(local, remote),
        )?;
        let merged: E = serde_json::from_value(merged_snapshot.clone())?;

        debug!(
            "Resolved conflict on {} {} (local {}, remote {})",
            E::KIND,
            local.id(),
            local.updated_at(),
            remote.updated_at()
        );

        let record = ConflictRecord {
            entity_id: local.id().to_string(),
            local_snapshot,
            remote_snapshot,
            resolution_strategy: ResolutionStrategy::FieldPartitioned,
            resolved_snapshot: Some(merged_snapshot),
            timestamp: Utc::now(),
        };
        self.record(record.clone());

        Ok((merged, record))
    }

    fn record(&self, record: ConflictRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Most recent resolutions, oldest first
    pub fn audit_log(&self) -> Vec<ConflictRecord> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

fn merged_timestamp<E: SyncEntity>(local: &E, remote: &E) -> i64 {
    local
        .updated_at()
        .max(remote.updated_at())
        .saturating_add(MERGE_EPSILON_MS)
}

/// Merge two serialized snapshots.
///
/// Starts from `remote`, then copies each of `local_fields` from `local`. A local field that is
/// absent locally is absent from the merge too.
pub fn merge_snapshots(
    local: &Value,
    remote: &Value,
    local_fields: &[&str],
    updated_at: i64,
) -> Result<Value, SyncError> {
    let (Value::Object(local), Value::Object(remote)) = (local, remote) else {
        return Err(SyncError::MergeError(
            "snapshots must be JSON objects".to_string(),
        ));
    };

    let mut merged = remote.clone();
    for field in local_fields {
        match local.get(*field) {
            Some(value) => {
                merged.insert((*field).to_string(), value.clone());
            }
            None => {
                merged.remove(*field);
            }
        }
    }
    merged.insert(UPDATED_AT_FIELD.to_string(), Value::from(updated_at));

    Ok(Value::Object(merged))
}

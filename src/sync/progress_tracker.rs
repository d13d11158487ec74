//! Progress tracking for the sync engine.
//!
//! `SyncProgressTracker` counts what each orchestrator did (passes, confirmed and dropped
//! operations, applied realtime events, conflicts) and carries the per-pass cycle guard that
//! bounds how often one entity can go through conflict resolution.

use std::collections::HashSet;
use tracing::{debug, info};

/// Counters and per-pass state of one orchestrator
#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
    /// Reconciliation passes started
    passes: u64,
    /// Operations confirmed by the backend
    operations_synced: u64,
    /// Operations dropped as permanently failed
    operations_failed: u64,
    /// Realtime events that changed local state
    events_applied: u64,
    /// Realtime events that were already reflected locally
    duplicates_ignored: u64,
    conflicts_resolved: u64,
    /// Conflicts postponed by the cycle guard
    conflicts_deferred: u64,
    /// Entities that went through conflict resolution in the current pass
    resolved_this_pass: HashSet<String>,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reconciliation pass, clearing the cycle guard.
    pub fn start_pass(&mut self) {
        self.passes += 1;
        if !self.resolved_this_pass.is_empty() {
            debug!(
                "Clearing cycle guard for {} entities",
                self.resolved_this_pass.len()
            );
        }
        self.resolved_this_pass.clear();
    }

    /// Claim the one conflict resolution `entity_id` gets per pass.
    ///
    /// Returns false if the entity was already resolved in this pass.
    pub fn begin_resolution(&mut self, entity_id: &str) -> bool {
        if self.resolved_this_pass.insert(entity_id.to_string()) {
            self.conflicts_resolved += 1;
            true
        } else {
            self.conflicts_deferred += 1;
            false
        }
    }

    pub fn record_synced(&mut self, count: usize) {
        self.operations_synced += count as u64;
    }

    pub fn record_failed(&mut self, count: usize) {
        self.operations_failed += count as u64;
    }

    pub fn record_applied(&mut self) {
        self.events_applied += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_ignored += 1;
    }

    /// Log the counters
    pub fn log_progress(&self) {
        info!("{}", self.get_stats().summary());
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            passes: self.passes,
            operations_synced: self.operations_synced,
            operations_failed: self.operations_failed,
            events_applied: self.events_applied,
            duplicates_ignored: self.duplicates_ignored,
            conflicts_resolved: self.conflicts_resolved,
            conflicts_deferred: self.conflicts_deferred,
        }
    }
}

/// Snapshot of the counters of one orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub passes: u64,
    pub operations_synced: u64,
    pub operations_failed: u64,
    pub events_applied: u64,
    pub duplicates_ignored: u64,
    pub conflicts_resolved: u64,
    pub conflicts_deferred: u64,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "{} passes: {} operations synced, {} failed, {} events applied ({} duplicates), {} conflicts resolved{}",
            self.passes,
            self.operations_synced,
            self.operations_failed,
            self.events_applied,
            self.duplicates_ignored,
            self.conflicts_resolved,
            if self.conflicts_deferred == 0 {
                String::new()
            } else {
                format!(" ({} deferred)", self.conflicts_deferred)
            }
        )
    }
}

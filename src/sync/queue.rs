//! Durable operation queue with per-entity FIFO, coalescing and bounded retries.

use crate::sync::repositories::QueueRepository;
use crate::sync::{EntityKind, OperationKind, SyncError, SyncOperation};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exponential backoff between attempts of one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    /// Attempts before an operation is dropped as permanently failed.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            max_jitter_ms: 250,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` failures (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let scaled = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.max_jitter_ms)
        };
        let millis = (scaled.min(self.max_delay_ms as f64) as u64).saturating_add(jitter);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// Result of `OperationQueue::enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Appended,
    /// An earlier pending operation of the same kind was superseded in place.
    Coalesced,
}

/// What the drain handler did with one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    /// The remote row no longer exists; nothing left to do.
    AlreadyGone,
    /// Transient failure, try again later.
    Retry(String),
    /// Non-retryable failure, drop now.
    Reject(String),
    /// Not sent at all, e.g. because the connection went away. Ends the pass.
    Deferred,
}

/// Summary of one drain pass
#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: Vec<SyncOperation>,
    pub failed: Vec<(SyncOperation, String)>,
    pub retried: usize,
    pub deferred: bool,
    /// Earliest instant a backed-off operation becomes due.
    pub next_due: Option<Instant>,
}

struct QueueState {
    operations: Vec<SyncOperation>,
    in_flight: Option<String>,
    not_before: HashMap<String, Instant>,
}

type Target = (EntityKind, String);

fn target_of(op: &SyncOperation) -> Target {
    (op.entity_type, op.entity_id.clone())
}

/// Durable ordered record of pending operations for one entity type.
///
/// All mutations are flushed through the repository before they return; an in-memory change is
/// rolled back if that flush fails.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    repository: Box<dyn QueueRepository>,
    policy: RetryPolicy,
    drain_lock: tokio::sync::Mutex<()>,
}

impl OperationQueue {
    /// Load the persisted queue. Runs synchronously so it completes before any mutation.
    pub fn open(
        repository: impl QueueRepository + 'static,
        policy: RetryPolicy,
    ) -> Result<Self, SyncError> {
        let operations = repository.load()?;
        if !operations.is_empty() {
            info!("Restored {} pending operations", operations.len());
        }
        Ok(Self {
            state: Mutex::new(QueueState {
                operations,
                in_flight: None,
                not_before: HashMap::new(),
            }),
            repository: Box::new(repository),
            policy,
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, op: SyncOperation) -> Result<EnqueueResult, SyncError> {
        let mut state = self.lock();

        let latest = state
            .operations
            .iter()
            .rposition(|pending| pending.same_target(&op));
        let supersede = latest.filter(|&index| {
            let pending = &state.operations[index];
            pending.operation_kind == op.operation_kind
                && op.operation_kind.coalesces()
                && state.in_flight.as_deref() != Some(pending.id.as_str())
        });

        match supersede {
            Some(index) => {
                let pending = &mut state.operations[index];
                let previous = pending.clone();
                pending.payload = op.payload;
                pending.user_id = op.user_id;
                if let Err(e) = self.repository.save(&state.operations) {
                    state.operations[index] = previous;
                    return Err(e);
                }
                debug!(
                    "Coalesced {:?} for {} {}",
                    op.operation_kind, op.entity_type, op.entity_id
                );
                Ok(EnqueueResult::Coalesced)
            }
            None => {
                debug!(
                    "Enqueued {:?} for {} {}",
                    op.operation_kind, op.entity_type, op.entity_id
                );
                state.operations.push(op);
                if let Err(e) = self.repository.save(&state.operations) {
                    state.operations.pop();
                    return Err(e);
                }
                Ok(EnqueueResult::Appended)
            }
        }
    }

    /// Pending operations in insertion order
    pub fn pending(&self) -> Vec<SyncOperation> {
        self.lock().operations.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().operations.is_empty()
    }

    pub fn has_pending(&self, entity_type: EntityKind, entity_id: &str) -> bool {
        self.lock()
            .operations
            .iter()
            .any(|op| op.entity_type == entity_type && op.entity_id == entity_id)
    }

    pub fn has_pending_kind(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        kind: OperationKind,
    ) -> bool {
        self.lock().operations.iter().any(|op| {
            op.entity_type == entity_type && op.entity_id == entity_id && op.operation_kind == kind
        })
    }

    /// Earliest retry deadline among pending operations
    pub fn next_due(&self) -> Option<Instant> {
        self.lock().not_before.values().min().copied()
    }

    /// Run one pass over the queue in insertion order.
    ///
    /// An operation that is backed off, fails, or is retried blocks every later operation of the
    /// same entity for the rest of the pass. Operations enqueued during the pass are picked up by
    /// it.
    pub async fn drain<F, Fut>(&self, mut handler: F) -> DrainReport
    where
        F: FnMut(SyncOperation) -> Fut,
        Fut: Future<Output = OperationOutcome>,
    {
        let _pass = self.drain_lock.lock().await;
        let mut report = DrainReport::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<Target> = HashSet::new();

        loop {
            let Some(op) = self.next_candidate(&mut visited, &mut blocked) else {
                break;
            };

            debug!(
                "Sending {:?} for {} {} (attempt {})",
                op.operation_kind,
                op.entity_type,
                op.entity_id,
                op.retry_count + 1
            );
            let outcome = handler(op.clone()).await;

            match outcome {
                OperationOutcome::Deferred => {
                    self.lock().in_flight = None;
                    report.deferred = true;
                    break;
                }
                OperationOutcome::Completed | OperationOutcome::AlreadyGone => {
                    match self.finish(&op.id) {
                        Ok(()) => report.completed.push(op),
                        Err(e) => {
                            error!("Failed to persist completion of {}: {}", op.id, e);
                            blocked.insert(target_of(&op));
                        }
                    }
                }
                OperationOutcome::Reject(reason) => {
                    error!(
                        "{:?} for {} {} rejected: {}",
                        op.operation_kind, op.entity_type, op.entity_id, reason
                    );
                    blocked.insert(target_of(&op));
                    match self.finish(&op.id) {
                        Ok(()) => report.failed.push((op, reason)),
                        Err(e) => error!("Failed to persist removal of {}: {}", op.id, e),
                    }
                }
                OperationOutcome::Retry(reason) => {
                    blocked.insert(target_of(&op));
                    match self.record_failure(&op.id) {
                        Ok(Some(exhausted)) => {
                            error!(
                                "{:?} for {} {} failed after {} attempts: {}",
                                exhausted.operation_kind,
                                exhausted.entity_type,
                                exhausted.entity_id,
                                exhausted.retry_count,
                                reason
                            );
                            report.failed.push((exhausted, reason));
                        }
                        Ok(None) => {
                            warn!(
                                "{:?} for {} {} will be retried: {}",
                                op.operation_kind, op.entity_type, op.entity_id, reason
                            );
                            report.retried += 1;
                        }
                        Err(e) => error!("Failed to persist retry of {}: {}", op.id, e),
                    }
                }
            }
        }

        report.next_due = self.next_due();
        report
    }

    /// Pick the next due operation, marking it in flight.
    fn next_candidate(
        &self,
        visited: &mut HashSet<String>,
        blocked: &mut HashSet<Target>,
    ) -> Option<SyncOperation> {
        let now = Instant::now();
        let mut state = self.lock();

        let mut candidate = None;
        for op in &state.operations {
            if visited.contains(&op.id) {
                continue;
            }
            let target = target_of(op);
            if blocked.contains(&target) {
                continue;
            }
            visited.insert(op.id.clone());
            let due = state
                .not_before
                .get(&op.id)
                .is_none_or(|deadline| *deadline <= now);
            if !due {
                blocked.insert(target);
                continue;
            }
            candidate = Some(op.clone());
            break;
        }

        if let Some(op) = &candidate {
            state.not_before.remove(&op.id);
            state.in_flight = Some(op.id.clone());
        }
        candidate
    }

    /// Remove an operation after it completed or was dropped.
    fn finish(&self, id: &str) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.in_flight = None;
        let Some(index) = state.operations.iter().position(|op| op.id == id) else {
            return Ok(());
        };
        let removed = state.operations.remove(index);
        if let Err(e) = self.repository.save(&state.operations) {
            state.operations.insert(index, removed);
            return Err(e);
        }
        state.not_before.remove(id);
        Ok(())
    }

    /// Count a failed attempt. Returns the operation if its retry budget is now spent.
    fn record_failure(&self, id: &str) -> Result<Option<SyncOperation>, SyncError> {
        let mut state = self.lock();
        state.in_flight = None;
        let Some(index) = state.operations.iter().position(|op| op.id == id) else {
            return Ok(None);
        };

        state.operations[index].retry_count += 1;
        let op = state.operations[index].clone();

        if op.is_exhausted() {
            state.operations.remove(index);
            if let Err(e) = self.repository.save(&state.operations) {
                let mut restored = op;
                restored.retry_count -= 1;
                state.operations.insert(index, restored);
                return Err(e);
            }
            state.not_before.remove(id);
            return Ok(Some(op));
        }

        if let Err(e) = self.repository.save(&state.operations) {
            state.operations[index].retry_count -= 1;
            return Err(e);
        }
        let delay = self.policy.delay_for(op.retry_count);
        state.not_before.insert(id.to_string(), Instant::now() + delay);
        Ok(None)
    }
}

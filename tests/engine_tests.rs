use multistream_sync::backend::{InjectedFailure, MemoryBackend, RemoteCall};
use multistream_sync::config::EngineConfig;
use multistream_sync::models::{Platform, StreamEntity};
use multistream_sync::network::{NetworkMonitor, Reachability};
use multistream_sync::sync::{
    AuthSession, ForceSyncOutcome, MemoryLocalStore, MemoryQueueRepository, OperationKind,
    RetryPolicy, SyncEvent, SyncOrchestrator, SyncStatus,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Engine =
    SyncOrchestrator<StreamEntity, MemoryLocalStore<StreamEntity>, MemoryBackend<StreamEntity>>;

fn test_config() -> EngineConfig {
    EngineConfig {
        reconcile_interval_secs: 3_600,
        retry: RetryPolicy {
            max_jitter_ms: 0,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

fn engine(
    backend: &MemoryBackend<StreamEntity>,
    network: &Arc<NetworkMonitor>,
    queue: MemoryQueueRepository,
    config: EngineConfig,
) -> Engine {
    let engine = SyncOrchestrator::new(
        MemoryLocalStore::new(),
        backend.clone(),
        queue,
        network.clone(),
        config,
    )
    .unwrap();
    engine.set_session(Some(AuthSession::new("u1", "token")));
    engine
}

async fn wait_for_status(engine: &Engine, status: SyncStatus) {
    let mut rx = engine.watch_status();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == status))
        .await
        .expect("status not reached")
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn next_matching(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

fn calls_for(backend: &MemoryBackend<StreamEntity>, id: &str) -> Vec<RemoteCall> {
    backend
        .calls()
        .into_iter()
        .filter(|call| match call {
            RemoteCall::FetchOne(x)
            | RemoteCall::Create(x)
            | RemoteCall::Update(x)
            | RemoteCall::Delete(x) => x == id,
            RemoteCall::Subscribe(_) => false,
        })
        .collect()
}

async fn connected_engine(backend: &MemoryBackend<StreamEntity>, config: EngineConfig) -> Engine {
    let network = Arc::new(NetworkMonitor::new(Reachability::Reachable));
    let engine = engine(backend, &network, MemoryQueueRepository::new(), config);
    engine.start();
    wait_for_status(&engine, SyncStatus::Connected).await;
    engine
}

#[tokio::test(start_paused = true)]
async fn create_while_disconnected_stays_local_until_connected() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Unreachable));
    let engine = engine(&backend, &network, MemoryQueueRepository::new(), test_config());
    engine.start();

    let e2 = StreamEntity::new("u1", Platform::Twitch, "e2");
    engine.mutate(e2.clone(), OperationKind::Create).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(engine.current_status(), SyncStatus::Disconnected);
    assert_eq!(engine.fetch_local(&e2.id).unwrap().unwrap().channel, "e2");
    let pending = engine.pending_operations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_kind, OperationKind::Create);
    assert_eq!(pending[0].entity_id, e2.id);
    assert!(backend.calls().is_empty());

    network.report(Reachability::Reachable);
    wait_for_status(&engine, SyncStatus::Connected).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    assert_eq!(backend.row(&e2.id), engine.fetch_local(&e2.id).unwrap());
    assert_eq!(calls_for(&backend, &e2.id), vec![RemoteCall::Create(e2.id.clone())]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn operations_for_one_entity_are_sent_in_submission_order() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;
    backend.inject_failure(InjectedFailure::Network, Some(1));

    let mut s1 = StreamEntity::new("u1", Platform::Kick, "s1");
    let s2 = StreamEntity::new("u1", Platform::Kick, "s2");
    engine.mutate(s1.clone(), OperationKind::Create).await;
    engine.mutate(s2.clone(), OperationKind::Create).await;
    s1.title = "renamed".into();
    engine.mutate(s1.clone(), OperationKind::Update).await;
    engine.mutate(s1.clone(), OperationKind::Delete).await;

    eventually(|| engine.pending_operations().is_empty()).await;

    assert_eq!(
        calls_for(&backend, &s1.id),
        vec![
            RemoteCall::Create(s1.id.clone()),
            RemoteCall::Create(s1.id.clone()),
            RemoteCall::Update(s1.id.clone()),
            RemoteCall::Delete(s1.id.clone()),
        ]
    );
    assert!(backend.row(&s1.id).is_none());
    assert!(backend.row(&s2.id).is_some());

    // The other entity was not held back by the failing one.
    let calls = backend.calls();
    let s2_create = calls
        .iter()
        .position(|c| *c == RemoteCall::Create(s2.id.clone()))
        .unwrap();
    let s1_retry = calls
        .iter()
        .rposition(|c| *c == RemoteCall::Create(s1.id.clone()))
        .unwrap();
    assert!(s2_create < s1_retry);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_operation_is_attempted_three_times_then_dropped() {
    let mut config = test_config();
    config.retry.max_retries = 3;
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, config).await;
    let mut events = engine.subscribe_events();
    backend.inject_failure(InjectedFailure::Network, None);

    let s1 = StreamEntity::new("u1", Platform::Rumble, "s1");
    engine.mutate(s1.clone(), OperationKind::Create).await;

    let event = next_matching(&mut events, |e| {
        matches!(e, SyncEvent::OperationPermanentlyFailed { .. })
    })
    .await;
    let SyncEvent::OperationPermanentlyFailed { operation, .. } = event else {
        unreachable!();
    };
    assert_eq!(operation.entity_id, s1.id);
    assert_eq!(operation.retry_count, 3);

    tokio::time::sleep(Duration::from_secs(30)).await;

    let attempts: Vec<_> = backend
        .timed_calls()
        .into_iter()
        .filter(|(call, _)| *call == RemoteCall::Create(s1.id.clone()))
        .map(|(_, at)| at)
        .collect();
    assert_eq!(attempts.len(), 3);

    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1_100));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2_100));
    assert!(engine.pending_operations().is_empty());
    // The local write is kept even though it never reached the backend.
    assert!(engine.fetch_local(&s1.id).unwrap().is_some());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unauthorized_operation_is_dropped_without_retry() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;
    let mut events = engine.subscribe_events();
    backend.inject_failure(InjectedFailure::Unauthorized, None);

    let s1 = StreamEntity::new("u1", Platform::Twitch, "s1");
    engine.mutate(s1.clone(), OperationKind::Create).await;

    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::OperationPermanentlyFailed { .. })
    })
    .await;
    assert_eq!(calls_for(&backend, &s1.id).len(), 1);
    assert!(engine.pending_operations().is_empty());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn older_remote_update_converges_on_merged_snapshot() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;
    let mut events = engine.subscribe_events();

    let mut s1 = StreamEntity::new("u1", Platform::Youtube, "s1");
    s1.title = "A".into();
    engine.mutate(s1.clone(), OperationKind::Create).await;
    s1.muted = true;
    engine.mutate(s1.clone(), OperationKind::Update).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    let local = engine.fetch_local(&s1.id).unwrap().unwrap();
    assert!(local.muted);

    let mut remote = local.clone();
    remote.title = "B".into();
    remote.viewer_count = 1_200;
    remote.muted = false;
    remote.updated_at = local.updated_at - 10;
    backend.push_remote_update(remote);

    next_matching(&mut events, |e| matches!(e, SyncEvent::ConflictResolved(_))).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    let merged = engine.fetch_local(&s1.id).unwrap().unwrap();
    assert_eq!(merged.title, "B");
    assert_eq!(merged.viewer_count, 1_200);
    assert!(merged.muted);
    assert!(merged.updated_at > local.updated_at);
    assert_eq!(backend.row(&s1.id), Some(merged));
    assert_eq!(engine.conflict_log().len(), 1);
    assert_eq!(engine.stats().conflicts_resolved, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_restores_pending_operations_exactly() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Unreachable));
    let queue = MemoryQueueRepository::new();

    let first = engine(&backend, &network, queue.clone(), test_config());
    let mut created = Vec::new();
    for channel in ["a", "b", "c"] {
        let stream = StreamEntity::new("u1", Platform::Twitch, channel);
        first.mutate(stream.clone(), OperationKind::Create).await;
        created.push(stream);
    }
    let mut renamed = created[0].clone();
    renamed.title = "renamed".into();
    first.mutate(renamed, OperationKind::Update).await;
    let before = first.pending_operations();
    assert_eq!(before.len(), 4);
    drop(first);

    let second = engine(&backend, &network, queue, test_config());
    assert_eq!(second.pending_operations(), before);

    second.start();
    network.report(Reachability::Reachable);
    eventually(|| second.pending_operations().is_empty()).await;
    assert_eq!(backend.rows().len(), 3);
    assert_eq!(backend.row(&created[0].id).unwrap().title, "renamed");
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconciliation_repairs_missed_remote_changes() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;
    let mut events = engine.subscribe_events();

    let s1 = StreamEntity::new("u1", Platform::Kick, "s1");
    engine.mutate(s1.clone(), OperationKind::Create).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    // Changed on the backend without a realtime event reaching us.
    let mut changed = engine.fetch_local(&s1.id).unwrap().unwrap();
    changed.title = "changed elsewhere".into();
    changed.updated_at += 1_000;
    backend.seed(changed.clone());

    engine.reconcile_now();
    let started = next_matching(&mut events, |e| {
        matches!(e, SyncEvent::ReconciliationStarted { .. })
    })
    .await;
    assert_eq!(
        started,
        SyncEvent::ReconciliationStarted {
            entity_type: multistream_sync::sync::EntityKind::Stream,
            entities: 1,
        }
    );

    eventually(|| {
        engine
            .fetch_local(&s1.id)
            .unwrap()
            .is_some_and(|s| s.title == "changed elsewhere")
    })
    .await;
    assert_eq!(engine.fetch_local(&s1.id).unwrap(), Some(changed));
    assert_eq!(engine.stats().passes, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn losing_the_network_disconnects_and_regaining_it_reconnects() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Reachable));
    let engine = engine(&backend, &network, MemoryQueueRepository::new(), test_config());
    engine.start();
    wait_for_status(&engine, SyncStatus::Connected).await;
    assert_eq!(backend.subscriber_count(), 1);

    network.report(Reachability::Unreachable);
    wait_for_status(&engine, SyncStatus::Disconnected).await;
    eventually(|| backend.subscriber_count() == 0).await;

    let s1 = StreamEntity::new("u1", Platform::Twitch, "s1");
    engine.mutate(s1.clone(), OperationKind::Create).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(backend.row(&s1.id).is_none());

    network.report(Reachability::Reachable);
    wait_for_status(&engine, SyncStatus::Connected).await;
    eventually(|| backend.row(&s1.id).is_some()).await;
    engine.shutdown().await;
    assert_eq!(engine.current_status(), SyncStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn closed_subscription_is_reestablished_with_backoff() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;

    backend.drop_subscribers();
    wait_for_status(&engine, SyncStatus::Disconnected).await;
    wait_for_status(&engine, SyncStatus::Connected).await;

    let subscribes = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RemoteCall::Subscribe(_)))
        .count();
    assert_eq!(subscribes, 2);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_sync_pushes_now_when_connected_and_queues_when_offline() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Reachable));
    let engine = engine(&backend, &network, MemoryQueueRepository::new(), test_config());
    engine.start();
    wait_for_status(&engine, SyncStatus::Connected).await;

    let mut s1 = StreamEntity::new("u1", Platform::Youtube, "s1");
    assert_eq!(engine.force_sync(s1.clone()).await, ForceSyncOutcome::Synced);
    assert_eq!(backend.row(&s1.id), engine.fetch_local(&s1.id).unwrap());
    assert!(engine.pending_operations().is_empty());

    network.report(Reachability::Unreachable);
    wait_for_status(&engine, SyncStatus::Disconnected).await;

    s1.volume = 0.5;
    assert_eq!(engine.force_sync(s1.clone()).await, ForceSyncOutcome::Queued);
    let pending = engine.pending_operations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_kind, OperationKind::Resync);
    assert_eq!(engine.fetch_local(&s1.id).unwrap().unwrap().volume, 0.5);

    network.report(Reachability::Reachable);
    eventually(|| engine.pending_operations().is_empty()).await;
    assert_eq!(backend.row(&s1.id).unwrap().volume, 0.5);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_sync_falls_back_to_the_queue_after_its_timeout() {
    let mut config = test_config();
    config.force_sync_timeout_ms = 2_000;
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, config).await;
    backend.inject_failure(InjectedFailure::Network, None);

    let s1 = StreamEntity::new("u1", Platform::Kick, "s1");
    assert_eq!(engine.force_sync(s1.clone()).await, ForceSyncOutcome::Queued);
    assert_eq!(engine.pending_operations().len(), 1);

    backend.clear_failure();
    eventually(|| engine.pending_operations().is_empty()).await;
    assert!(backend.row(&s1.id).is_some());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn conflict_postponed_by_the_cycle_guard_lands_on_the_next_pass() {
    let backend = MemoryBackend::new();
    let engine = connected_engine(&backend, test_config()).await;

    let mut s1 = StreamEntity::new("u1", Platform::Twitch, "s1");
    s1.title = "A".into();
    engine.mutate(s1.clone(), OperationKind::Create).await;
    eventually(|| engine.pending_operations().is_empty()).await;
    let local = engine.fetch_local(&s1.id).unwrap().unwrap();

    let mut first = local.clone();
    first.title = "B".into();
    first.updated_at = local.updated_at - 20;
    backend.push_remote_update(first);
    eventually(|| engine.stats().conflicts_resolved == 1).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    let mut second = local.clone();
    second.title = "C".into();
    second.viewer_count = 999;
    second.updated_at = local.updated_at - 5;
    backend.push_remote_update(second);
    eventually(|| engine.stats().conflicts_deferred == 1).await;
    assert_eq!(engine.fetch_local(&s1.id).unwrap().unwrap().title, "B");

    engine.reconcile_now();
    eventually(|| engine.stats().conflicts_resolved == 2).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    let merged = engine.fetch_local(&s1.id).unwrap().unwrap();
    assert_eq!(merged.title, "C");
    assert_eq!(merged.viewer_count, 999);
    let row = backend.row(&s1.id).unwrap();
    assert_eq!(row.title, "C");
    assert_eq!(row.viewer_count, 999);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resync_recreates_a_row_missing_from_the_backend() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Unreachable));
    let engine = engine(&backend, &network, MemoryQueueRepository::new(), test_config());
    engine.start();

    let s1 = StreamEntity::new("u1", Platform::Youtube, "s1");
    assert_eq!(engine.force_sync(s1.clone()).await, ForceSyncOutcome::Queued);
    assert!(backend.row(&s1.id).is_none());

    network.report(Reachability::Reachable);
    wait_for_status(&engine, SyncStatus::Connected).await;
    eventually(|| engine.pending_operations().is_empty()).await;

    assert_eq!(
        calls_for(&backend, &s1.id),
        vec![
            RemoteCall::FetchOne(s1.id.clone()),
            RemoteCall::Create(s1.id.clone()),
        ]
    );
    assert_eq!(backend.row(&s1.id), engine.fetch_local(&s1.id).unwrap());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_subscription_is_not_retried() {
    let backend = MemoryBackend::new();
    let network = Arc::new(NetworkMonitor::new(Reachability::Reachable));
    backend.inject_failure(InjectedFailure::Rejected, None);
    let engine = engine(&backend, &network, MemoryQueueRepository::new(), test_config());
    engine.start();

    tokio::time::sleep(Duration::from_secs(60)).await;

    let subscribes = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RemoteCall::Subscribe(_)))
        .count();
    assert_eq!(subscribes, 1);
    assert_eq!(engine.current_status(), SyncStatus::Disconnected);
    engine.shutdown().await;
}

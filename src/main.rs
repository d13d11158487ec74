use multistream_sync::backend::RestBackend;
use multistream_sync::config::AppConfig;
use multistream_sync::models::{LayoutEntity, SessionEntity, StreamEntity};
use multistream_sync::network::{HttpProbe, NetworkMonitor, Reachability};
use multistream_sync::sync::{
    AuthSession, FileLocalStore, FileQueueRepository, SyncEntity, SyncEvent, SyncOrchestrator,
};

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

type Orchestrator<E> = SyncOrchestrator<E, FileLocalStore<E>, RestBackend<E>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber with debug logging for the sync engine
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multistream_sync=debug".parse()?)
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .init();

    info!("Starting multistream sync service");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;
    info!("Using data directory {:?}", config.data_dir);

    let network = Arc::new(NetworkMonitor::new(Reachability::Unreachable));
    let probe = HttpProbe::new(
        config.backend.health_url.clone(),
        Duration::from_secs(config.backend.probe_interval_secs.max(1)),
    )?
    .spawn(network.clone());

    let streams: Orchestrator<StreamEntity> = build(&config, &network)?;
    let layouts: Orchestrator<LayoutEntity> = build(&config, &network)?;
    let sessions: Orchestrator<SessionEntity> = build(&config, &network)?;

    let printers = vec![
        tokio::spawn(print_events("streams", streams.subscribe_events())),
        tokio::spawn(print_events("layouts", layouts.subscribe_events())),
        tokio::spawn(print_events("sessions", sessions.subscribe_events())),
    ];

    let session = session_from_env();
    if session.is_none() {
        warn!("MULTISTREAM_USER_ID / MULTISTREAM_ACCESS_TOKEN not set, staying offline");
    }
    streams.set_session(session.clone());
    layouts.set_session(session.clone());
    sessions.set_session(session);

    streams.start();
    layouts.start();
    sessions.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for (name, stats) in [
        ("streams", streams.stats()),
        ("layouts", layouts.stats()),
        ("sessions", sessions.stats()),
    ] {
        info!("{}: {}", name, stats.summary());
    }

    streams.shutdown().await;
    layouts.shutdown().await;
    sessions.shutdown().await;
    probe.abort();
    for printer in printers {
        printer.abort();
    }

    Ok(())
}

fn build<E: SyncEntity>(
    config: &AppConfig,
    network: &Arc<NetworkMonitor>,
) -> Result<Orchestrator<E>, Box<dyn Error>> {
    let data_dir: &Path = &config.data_dir;
    let orchestrator = SyncOrchestrator::new(
        FileLocalStore::open(data_dir)?,
        RestBackend::new(config.backend.clone())?,
        FileQueueRepository::new(data_dir, E::KIND)?,
        network.clone(),
        config.engine.clone(),
    )?;
    Ok(orchestrator)
}

fn session_from_env() -> Option<AuthSession> {
    let user_id = std::env::var("MULTISTREAM_USER_ID").ok()?;
    let access_token = std::env::var("MULTISTREAM_ACCESS_TOKEN").ok()?;
    Some(AuthSession::new(user_id, access_token))
}

async fn print_events(name: &'static str, mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::StatusChanged(status)) => info!("[{}] {}", name, status),
            Ok(SyncEvent::ConflictResolved(record)) => {
                info!("[{}] merged conflicting versions of {}", name, record.entity_id)
            }
            Ok(SyncEvent::OperationPermanentlyFailed { operation, reason }) => warn!(
                "[{}] gave up on {:?} {}: {}",
                name, operation.operation_kind, operation.entity_id, reason
            ),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[{}] missed {} events", name, skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

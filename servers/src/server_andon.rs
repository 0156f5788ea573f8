use anyhow::{Context, Result};
use lib_andon::connections::db_postgres::PgStore;
use lib_andon::ingestors::RedisIngestor;
use lib_andon::{Dispatcher, MemoryStore, Reports, Sequencer, TelemetryStore, TransportError};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

mod andon_logic;
use andon_logic::config::{self, Settings};
use andon_logic::{downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let settings = config::load_config().into_settings()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match settings.database_url.clone() {
        Some(url) => {
            let store = PgStore::connect(&url, settings.db_pool_size, settings.planned_count)
                .await
                .context("failed to open the PostgreSQL store")?;
            log::info!("Persisting to PostgreSQL.");
            run_pipeline(settings, Arc::new(store), shutdown).await
        }
        None => {
            log::warn!("No database configured; using the in-memory store. Nothing survives a restart.");
            let store = MemoryStore::new(settings.planned_count);
            run_pipeline(settings, Arc::new(store), shutdown).await
        }
    }
}

/// Wires ingestor, sequencer and downstream server around `store` and runs them until
/// shutdown. Whichever of the ingestor or the downstream server stops first stops the rest;
/// a transport that gives up or a server that fails is returned as an error once everything
/// stopped.
async fn run_pipeline<S: TelemetryStore>(settings: Settings, store: Arc<S>, shutdown: CancellationToken) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(settings.subscriber_buffer));
    let reports = Reports::new(Arc::clone(&store), settings.layout.categories().clone(), settings.timezone);
    let (mut sequencer, handle) = Sequencer::new(
        settings.layout.clone(),
        settings.timezone,
        store,
        Arc::clone(&dispatcher),
    );
    sequencer
        .rehydrate()
        .await
        .context("failed to load open fault records")?;

    let ingestor = RedisIngestor::new(&settings.broker_url, &settings.topic_prefix, settings.reconnect)?;
    let app_state = state::ServerState::new(dispatcher, handle.clone(), ingestor.status(), reports, shutdown.clone());

    let worker_handle = tokio::spawn(sequencer.run(shutdown.clone()));
    let mut downstream_handle = tokio::spawn(downstream::run(settings.port, app_state));
    let ingest = ingestor.run(handle, shutdown.clone());
    tokio::pin!(ingest);

    let first = tokio::select! {
        ingested = &mut ingest => Stopped::Ingestor(ingested),
        served = &mut downstream_handle => Stopped::Downstream(served),
    };
    // Whatever stopped first stops everything else too.
    shutdown.cancel();
    let (ingested, served) = match first {
        Stopped::Ingestor(ingested) => (ingested, downstream_handle.await),
        Stopped::Downstream(served) => {
            if !matches!(served, Ok(Ok(()))) {
                log::error!("Downstream server stopped unexpectedly; shutting down.");
            }
            (ingest.await, served)
        }
    };
    worker_handle.await?;
    log::info!("Shutdown complete.");

    served?.context("downstream server failed")?;
    ingested.map_err(|e| {
        log::error!("Fatal transport error: {}", e);
        e.into()
    })
}

/// The half of `run_pipeline` that finished first, with what it returned.
enum Stopped {
    Ingestor(std::result::Result<(), TransportError>),
    Downstream(std::result::Result<Result<()>, JoinError>),
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term_signal) => {
                    term_signal.recv().await;
                }
                Err(e) => {
                    log::error!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            // On non-unix platforms, just wait forever.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

use anyhow::{anyhow, Context};
use ledger_sync::bootstrap;
use ledger_sync::cache::{CacheStore, RedisCacheStore};
use ledger_sync::config::Config;
use ledger_sync::ingestion::IngestionWorker;
use ledger_sync::ledger::{LedgerStore, PgLedgerStore};
use ledger_sync::publisher::SyntheticPublisher;
use ledger_sync::queue::JetStreamQueue;
use ledger_sync::retry::{ExhaustionPolicy, RetryExecutor};
use ledger_sync::scheduler::SyncScheduler;
use ledger_sync::server::{self, AppState};
use ledger_sync::{SERVICE_NAME, VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.logging.json);
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    info!(service = SERVICE_NAME, version = VERSION, "Ledger sync starting...");

    let cancel = CancellationToken::new();
    let strict = RetryExecutor::new(
        config.retry.to_retry_config(ExhaustionPolicy::Propagate),
        cancel.clone(),
    );

    // Stores; dependencies that come up late are retried like any other call
    let pg = strict
        .execute_strict("connect_ledger", || PgLedgerStore::connect(&config.database))
        .await?;
    strict
        .execute_strict("ensure_schema", || pg.ensure_schema())
        .await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(pg);

    let redis = strict
        .execute_strict("connect_cache", || {
            RedisCacheStore::connect(&config.redis.url, &config.sync.cursor_key)
        })
        .await?;
    let cache: Arc<dyn CacheStore> = Arc::new(redis);

    let queue = Arc::new(
        strict
            .execute_strict("connect_queue", || JetStreamQueue::connect(&config.queue))
            .await?,
    );

    let providers =
        bootstrap::seed_providers(Arc::clone(&ledger), &config.bootstrap.providers, &strict)
            .await?;
    info!("Providers ready: {}", providers.len());

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&ledger),
        Arc::clone(&cache),
        strict.clone(),
        config.sync.interval(),
    ));

    if config.sync.fill_cache_on_startup {
        scheduler
            .fill_cache()
            .await
            .context("Startup cache fill failed")?;
    }

    let mut tasks = Vec::new();

    let worker = IngestionWorker::new(Arc::clone(&ledger), strict.clone());
    tasks.push(tokio::spawn(run_ingestion(
        worker,
        Arc::clone(&queue),
        cancel.clone(),
    )));

    tasks.push(tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    }));

    if config.publisher.enabled {
        let lenient = RetryExecutor::new(
            config.retry.to_retry_config(ExhaustionPolicy::Skip),
            cancel.clone(),
        );
        let publisher =
            SyntheticPublisher::new(queue.clone(), Arc::clone(&ledger), lenient, &config.publisher)?;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { publisher.run(cancel).await }));
    }

    let state = AppState {
        cache: Arc::clone(&cache),
    };
    let server = server::serve(&config.server, state, cancel.clone());
    tokio::pin!(server);

    info!("Ledger sync running");

    let server_finished = tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
            true
        }
        _ = shutdown_signal() => false,
    };

    info!("Shutting down ledger sync...");
    cancel.cancel();

    if !server_finished {
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("Ledger sync stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_file(true).with_line_number(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_file(true).with_line_number(true))
            .init();
    }
}

/// Keep the ingestion worker attached to the queue, reopening the delivery
/// stream after it ends
async fn run_ingestion(worker: IngestionWorker, queue: Arc<JetStreamQueue>, cancel: CancellationToken) {
    loop {
        match queue.deliveries().await {
            Ok(deliveries) => worker.run(deliveries, cancel.clone()).await,
            Err(e) => error!("Failed to open delivery stream: {}", e),
        }

        if cancel.is_cancelled() {
            break;
        }

        warn!("Ingestion stream ended. Restarting in 5 seconds...");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

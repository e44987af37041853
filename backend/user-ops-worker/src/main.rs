use anyhow::{Context, Result};
use cache_invalidation::{CacheInvalidator, EntityType, NoopInvalidator, RedisCacheInvalidator};
use db_pool::create_pool;
use job_queue::{JobQueue, RedisQueueConfig, RedisStreamQueue};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use user_ops_worker::cache::InvalidationHook;
use user_ops_worker::config::{Config, LogFormat};
use user_ops_worker::db::PgUserStore;
use user_ops_worker::{metrics, Dispatcher, Worker, SERVICE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(LogFormat::from_env());

    info!("Starting User Ops Worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        app_env = %config.app_env,
        queue = %config.queue.name,
        concurrency = config.worker.concurrency,
        chunk_size = config.worker.chunk_size,
        cache_invalidation = config.cache.invalidation_enabled,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );

    // Each in-flight job holds one connection for its whole transaction
    if config.database.max_connections < config.worker.concurrency as u32 {
        tracing::warn!(
            max_connections = config.database.max_connections,
            concurrency = config.worker.concurrency,
            "Pool is smaller than worker concurrency; slots will wait for connections"
        );
    }

    config.database.log_config();
    let pool = create_pool(config.database.clone())
        .await
        .context("Failed to connect to PostgreSQL")?;

    let redis_client = redis::Client::open(config.redis_url.as_str())
        .context("Invalid REDIS_URL")?;

    let queue = RedisStreamQueue::connect(
        redis_client.clone(),
        RedisQueueConfig {
            queue_name: config.queue.name.clone(),
            policy: config.queue.retry_policy(),
            lease_timeout: config.queue.lease_timeout,
            ..Default::default()
        },
    )
    .await
    .context("Failed to connect to Redis queue")?;
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let invalidator: Arc<dyn CacheInvalidator> = if config.cache.invalidation_enabled {
        let manager = redis::aio::ConnectionManager::new(redis_client)
            .await
            .context("Failed to connect to Redis cache")?;
        let mut invalidator =
            RedisCacheInvalidator::new(manager, EntityType::User, SERVICE_NAME.to_string());
        if config.cache.broadcast_enabled {
            invalidator = invalidator.with_broadcast(RedisCacheInvalidator::DEFAULT_CHANNEL);
        }
        Arc::new(invalidator)
    } else {
        info!("Cache invalidation disabled by configuration");
        Arc::new(NoopInvalidator)
    };

    let dispatcher = Dispatcher::new(PgUserStore::new(pool.clone()), InvalidationHook::new(invalidator))
        .with_chunk_size(config.worker.chunk_size);

    let worker = Worker::new(dispatcher, queue)
        .with_concurrency(config.worker.concurrency)
        .with_block(config.queue.block);

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut metrics_shutdown = shutdown_tx.subscribe();
    let metrics_port = config.metrics_port;
    let metrics_server = tokio::spawn(async move {
        let stop = async move {
            let _ = metrics_shutdown.recv().await;
        };
        if let Err(e) = metrics::serve(metrics_port, stop).await {
            error!(port = metrics_port, error = %e, "Metrics server failed");
        }
    });

    // Finishes current jobs and their cache invalidations before returning
    let run = tokio::spawn(worker.run(shutdown_tx.clone()));

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    if let Err(e) = run.await {
        error!(error = %e, "Worker task panicked");
    }
    let _ = metrics_server.await;

    pool.close().await;
    info!("User Ops Worker shutdown complete");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}

use developer_key_service::{
    build_router,
    config::DeveloperKeyConfig,
    models::Account,
    services::{
        CacheBackend, JobQueueConfig, MemoryCache, MemoryStore, RedisCache, Stores, TokenIssuer,
        TracingErrorReporter,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = DeveloperKeyConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    developer_key_service::services::metrics::init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting developer key service"
    );

    let cache_backend: Arc<dyn CacheBackend> = match &config.redis {
        Some(redis) => Arc::new(RedisCache::new(redis).await?),
        None => {
            tracing::warn!("REDIS_URL not set, using in-process developer key cache");
            Arc::new(MemoryCache::new())
        }
    };

    let site_admin = Account::new_site_admin(config.site_admin.account_id, config.site_admin.shard_id);
    let stores = Stores::from_single(Arc::new(MemoryStore::new(site_admin)));
    tracing::info!("Stores initialized");

    let tokens = TokenIssuer::new(&config.jwt)?;
    tracing::info!("Token issuer initialized");

    let state = AppState::new(
        config.clone(),
        stores,
        cache_backend,
        Arc::new(TracingErrorReporter),
        tokens,
        JobQueueConfig::default(),
    )?;
    let jobs = state.jobs.clone();

    let app = build_router(state);

    let addr: SocketAddr = config
        .common
        .bind_address()
        .parse()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e)))?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(pending = jobs.pending(), "Draining tool management jobs");
    jobs.drain().await;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

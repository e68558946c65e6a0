pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{extract::State, middleware::from_fn, routing::get, Json, Router};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::DeveloperKeyConfig;
use crate::models::ScopeRegistry;
use crate::services::{
    AccountChainResolver, BindingResolver, CacheBackend, DeveloperKeyCache, DeveloperKeyService,
    ErrorReporter, JobQueue, JobQueueConfig, KeyAuthorizer, SpecialKeyRegistry, StaticTopology,
    Stores, TokenIssuer, ToolLifecycleCoordinator,
};

#[derive(Clone)]
pub struct AppState {
    pub config: DeveloperKeyConfig,
    pub stores: Stores,
    pub cache: Arc<DeveloperKeyCache>,
    pub authorizer: Arc<KeyAuthorizer>,
    pub developer_keys: Arc<DeveloperKeyService>,
    pub tokens: Arc<TokenIssuer>,
    pub jobs: JobQueue,
}

impl AppState {
    /// Wire every service over `stores` and the cache backend.
    pub fn new(
        config: DeveloperKeyConfig,
        stores: Stores,
        cache_backend: Arc<dyn CacheBackend>,
        reporter: Arc<dyn ErrorReporter>,
        tokens: TokenIssuer,
        job_queue_config: JobQueueConfig,
    ) -> Result<Self, AppError> {
        let topology: StaticTopology = config
            .topology
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let home_shard = config.site_admin.shard_id;

        let cache = Arc::new(DeveloperKeyCache::new(
            cache_backend,
            stores.clone(),
            home_shard,
            config.cache.ttl_seconds,
        ));
        let chains = Arc::new(AccountChainResolver::new(stores.accounts.clone()));
        let resolver = Arc::new(BindingResolver::new(
            chains,
            stores.bindings.clone(),
            cache.clone(),
        ));
        let authorizer = Arc::new(KeyAuthorizer::new(
            resolver,
            stores.accounts.clone(),
            stores.settings.clone(),
            config.test_cluster.clone(),
        ));

        let jobs = JobQueue::new(reporter.clone(), job_queue_config);
        let tools = Arc::new(ToolLifecycleCoordinator::new(
            &stores,
            Arc::new(topology),
            jobs.clone(),
            reporter,
            config.tool_management.clone(),
        ));
        let special_keys = Arc::new(SpecialKeyRegistry::new(stores.settings.clone()));
        let developer_keys = Arc::new(DeveloperKeyService::new(
            stores.clone(),
            cache.clone(),
            tools,
            special_keys,
            Arc::new(ScopeRegistry::builtin()),
            home_shard,
        ));

        Ok(Self {
            config,
            stores,
            cache,
            authorizer,
            developer_keys,
            tokens: Arc::new(tokens),
            jobs,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/login/oauth2/jwks", get(handlers::well_known::jwks))
        .layer(from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Service health check
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.cache.backend().health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Cache health check failed");
        AppError::InternalError(e)
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "cache": "up",
            "pending_jobs": state.jobs.pending(),
        }
    })))
}

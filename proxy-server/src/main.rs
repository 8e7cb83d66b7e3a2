mod auth;
mod background_jobs;
mod config;
mod coordinator;
mod envelope;
mod error;
mod handlers;
mod upstream;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use config::Config;
use coordinator::{CoordinatorStore, MemoryStore, RedisStore};
use upstream::{HttpUpstream, Upstream};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn CoordinatorStore>,
    pub upstream: Arc<dyn Upstream>,
}

/// Every request other than `GET /` is proxied.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            get(handlers::banner::banner).fallback(handlers::proxy::proxy),
        )
        .fallback(handlers::proxy::proxy)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idempotent_proxy=debug,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = Arc::new(Config::from_env()?);
    config.validate()?;
    info!(
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        cache_ttl_ms = config.cache_ttl.as_millis() as u64,
        ecdsa_keys = config.trusted_keys.ecdsa.len(),
        ed25519_keys = config.trusted_keys.ed25519.len(),
        url_vars = config.url_vars.len(),
        header_vars = config.header_vars.len(),
        "Config loaded successfully"
    );

    // Coordinator backend
    let store: Arc<dyn CoordinatorStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url, config.cache_ttl).await?),
        None => {
            let memory = MemoryStore::new(config.cache_ttl);
            tokio::spawn(background_jobs::run_idle_sweep(
                memory.clone(),
                background_jobs::IdleSweepConfig::default(),
            ));
            Arc::new(memory)
        }
    };
    info!("Idempotency coordinator backend: {}", store.backend());

    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(config.request_timeout)?);

    let state = AppState {
        config: config.clone(),
        store,
        upstream,
    };
    let app = create_router(state);

    // Start HTTP server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Idempotent proxy listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

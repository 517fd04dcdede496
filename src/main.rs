//! Composition root: configuration, shared clients, workers, HTTP server.

use anyhow::{Context, Result};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use orderserver::api;
use orderserver::blob::{InvoiceBlobStore, TextInvoiceRenderer};
use orderserver::llm::AnthropicExtractor;
use orderserver::queue::{run_extraction_worker, run_webhook_worker, JobQueue, QueueConfig};
use orderserver::security::{correlation_middleware, JwksCache, TierRateLimiter};
use orderserver::shared::config::{AppConfig, Environment};
use orderserver::shared::state::{create_pool, AppState};
use orderserver::storage::OrderStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("configuration")?;
    init_tracing(config.env);

    if config.error_reporting_dsn.is_some() {
        info!("error reporting DSN configured");
    }

    let pool = create_pool(&config.database)?;
    let redis_client =
        redis::Client::open(config.redis_url.clone()).context("redis client")?;

    let llm = Arc::new(AnthropicExtractor::new(config.llm.clone())?);
    let jwks = Arc::new(JwksCache::new(&config.auth));
    let limiter = Arc::new(TierRateLimiter::new(config.rate_limits.clone()));
    let extraction_queue = Arc::new(JobQueue::new(
        redis_client.clone(),
        QueueConfig::extraction(),
    ));
    let webhook_queue = Arc::new(JobQueue::new(redis_client.clone(), QueueConfig::webhook()));
    let blob = Arc::new(InvoiceBlobStore::connect(&config.blob).await?);

    let port = config.port;
    let state = Arc::new(AppState {
        store: OrderStore::new(pool.clone()),
        conn: pool,
        redis: redis_client,
        llm,
        jwks,
        limiter,
        extraction_queue,
        webhook_queue,
        blob,
        renderer: Arc::new(TextInvoiceRenderer),
        config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let extraction_worker = tokio::spawn(run_extraction_worker(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    let webhook_worker = tokio::spawn(run_webhook_worker(Arc::clone(&state), shutdown_rx));

    let app = api::configure(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(correlation_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("orderserver listening on {addr}");

    let drain_tx = shutdown_tx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        let _ = drain_tx.send(true);
    })
    .await
    .context("http server")?;

    // The listener has drained; close the workers and wait for in-flight
    // jobs to finish.
    let _ = shutdown_tx.send(true);
    let _ = extraction_worker.await;
    let _ = webhook_worker.await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(env: Environment) {
    let default_level = if env.is_production() { "info" } else { "debug" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("orderserver={default_level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

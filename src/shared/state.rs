use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use std::sync::Arc;

use crate::blob::{InvoiceBlobStore, InvoiceRenderer};
use crate::llm::OrderExtractor;
use crate::queue::JobQueue;
use crate::security::{JwksCache, TierRateLimiter};
use crate::shared::config::{AppConfig, DatabaseConfig};
use crate::storage::OrderStore;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.url);
    Pool::builder()
        .max_size(config.max_connections)
        .build(manager)
        .context("failed to build database pool")
}

/// Everything the request path and the workers share. Constructed once at
/// the composition root and passed around explicitly; no process globals.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub store: OrderStore,
    pub redis: redis::Client,
    pub llm: Arc<dyn OrderExtractor>,
    pub jwks: Arc<JwksCache>,
    pub limiter: Arc<TierRateLimiter>,
    pub extraction_queue: Arc<JobQueue>,
    pub webhook_queue: Arc<JobQueue>,
    pub blob: Arc<InvoiceBlobStore>,
    pub renderer: Arc<dyn InvoiceRenderer>,
}

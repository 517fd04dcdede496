//! Per-tenant sliding-window rate limiting.
//!
//! Each request resolves its organization's tier, picks the tier's window
//! maximum (5x for reads), and checks a sliding window keyed by org id (or
//! client IP when no org resolved). Window instances are memoized by
//! resolved maximum so limiters are not rebuilt per request. Tier lookup
//! failures fall back to the free tier.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use diesel::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use super::auth::AuthContext;
use crate::shared::config::TierLimitConfig;
use crate::shared::error::ApiError;
use crate::shared::models::{schema, Tier};
use crate::shared::state::{AppState, DbPool};

const READ_MULTIPLIER: u32 = 5;

pub struct SlidingWindow {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key`, or reports how many seconds remain until the
    /// oldest hit slides out of the window.
    pub async fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let entries = hits.entry(key.to_string()).or_default();

        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() as u32 >= self.max {
            let oldest = entries.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entries.push_back(now);
        Ok(())
    }
}

pub struct TierRateLimiter {
    limits: TierLimitConfig,
    window: Duration,
    windows: RwLock<HashMap<u32, Arc<SlidingWindow>>>,
}

impl TierRateLimiter {
    pub fn new(limits: TierLimitConfig) -> Self {
        let window = Duration::from_secs(limits.window_secs);
        Self {
            limits,
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.limits.free,
            Tier::Pro => self.limits.pro,
            Tier::Enterprise => self.limits.enterprise,
        }
    }

    async fn window_for(&self, max: u32) -> Arc<SlidingWindow> {
        if let Some(window) = self.windows.read().await.get(&max) {
            return Arc::clone(window);
        }
        let mut windows = self.windows.write().await;
        Arc::clone(
            windows
                .entry(max)
                .or_insert_with(|| Arc::new(SlidingWindow::new(max, self.window))),
        )
    }

    pub async fn check(&self, key: &str, max: u32) -> Result<(), u64> {
        self.window_for(max).await.check(key).await
    }
}

/// Cheapest-quota fallback: a tier that cannot be resolved is treated as free.
async fn resolve_tier(pool: &DbPool, org_id: Uuid) -> Tier {
    let pool = pool.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<String, anyhow::Error> {
        use schema::organizations::dsl::*;
        let mut conn = pool.get()?;
        Ok(organizations
            .filter(id.eq(org_id))
            .select(tier)
            .first::<String>(&mut conn)?)
    })
    .await;

    match result {
        Ok(Ok(value)) => Tier::parse(&value).unwrap_or(Tier::Free),
        Ok(Err(err)) => {
            warn!(org_id = %org_id, "tier lookup failed, using free tier: {err}");
            Tier::Free
        }
        Err(err) => {
            warn!(org_id = %org_id, "tier lookup task failed, using free tier: {err}");
            Tier::Free
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let org = request
        .extensions()
        .get::<AuthContext>()
        .and_then(|ctx| ctx.org_id);

    let (key, tier) = match org {
        Some(org_id) => (org_id.to_string(), resolve_tier(&state.conn, org_id).await),
        None => (addr.ip().to_string(), Tier::Free),
    };

    let mut max = state.limiter.limit_for(tier);
    if request.method() == Method::GET {
        max = max.saturating_mul(READ_MULTIPLIER);
    }

    state
        .limiter
        .check(&key, max)
        .await
        .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })?;

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TierLimitConfig {
        TierLimitConfig {
            free: 2,
            pro: 5,
            enterprise: 10,
            window_secs: 60,
        }
    }

    #[tokio::test]
    async fn window_blocks_after_max() {
        let window = SlidingWindow::new(2, Duration::from_secs(60));
        assert!(window.check("org-a").await.is_ok());
        assert!(window.check("org-a").await.is_ok());
        let retry = window.check("org-a").await.unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[tokio::test]
    async fn windows_are_isolated_per_key() {
        let window = SlidingWindow::new(1, Duration::from_secs(60));
        assert!(window.check("org-a").await.is_ok());
        assert!(window.check("org-b").await.is_ok());
        assert!(window.check("org-a").await.is_err());
    }

    #[tokio::test]
    async fn hits_slide_out_of_the_window() {
        let window = SlidingWindow::new(1, Duration::from_millis(30));
        assert!(window.check("org-a").await.is_ok());
        assert!(window.check("org-a").await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(window.check("org-a").await.is_ok());
    }

    #[tokio::test]
    async fn limiter_memoizes_by_max() {
        let limiter = TierRateLimiter::new(limits());
        let first = limiter.window_for(10).await;
        let second = limiter.window_for(10).await;
        assert!(Arc::ptr_eq(&first, &second));
        let other = limiter.window_for(50).await;
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn tier_maxima() {
        let limiter = TierRateLimiter::new(limits());
        assert_eq!(limiter.limit_for(Tier::Free), 2);
        assert_eq!(limiter.limit_for(Tier::Pro), 5);
        assert_eq!(limiter.limit_for(Tier::Enterprise), 10);
    }
}

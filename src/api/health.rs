//! Liveness and readiness handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::shared::state::AppState;

pub async fn liveness() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "orderserver",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Reports db/llm/queue liveness; 200 only when everything is reachable.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.conn.get().is_ok();
    let llm_ok = !state.config.llm.api_key.is_empty();
    let queue_ok = match state.redis.get_multiplexed_async_connection().await {
        Ok(mut conn) => redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok(),
        Err(_) => false,
    };

    let healthy = db_ok && llm_ok && queue_ok;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "orderserver",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok,
            "llm": llm_ok,
            "queue": queue_ok,
        })),
    )
}

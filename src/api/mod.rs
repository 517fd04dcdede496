//! Route wiring. Handlers adapt between HTTP and the domain components;
//! contracts and error mapping live with the components themselves.

use axum::extract::{FromRequest, Request};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::security::{auth_middleware, pii_redaction_middleware, rate_limit_middleware};
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

pub mod extract;
pub mod health;
pub mod invoices;
pub mod jobs;
pub mod orders;

/// JSON body extraction that feeds the central error mapping instead of
/// axum's default rejection bodies.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|err| ApiError::Validation(format!("invalid JSON body: {err}")))?;
        let parsed = serde_json::from_value(value)
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        Ok(Self(parsed))
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::NotFound("Resource not found".into())
}

pub fn configure(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/stats", get(orders::get_stats))
        .route("/api/orders", get(orders::list_orders))
        .route(
            "/api/orders/{id}",
            get(orders::get_order)
                .patch(orders::update_status)
                .delete(orders::delete_order),
        )
        .route("/api/orders/{id}/edit", patch(orders::edit_order))
        .route("/api/orders/{id}/download", get(invoices::download_invoice))
        .route("/api/extract", post(extract::extract_single))
        .route("/api/extract-order", post(extract::extract_chat))
        .route("/api/generate-invoice", post(invoices::generate_invoice))
        .route("/api/async/extract", post(jobs::enqueue_single))
        .route("/api/async/extract-order", post(jobs::enqueue_chat))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/queue/health", get(jobs::queue_health))
        .route("/api/admin/dlq", get(jobs::list_dlq))
        .route("/api/admin/dlq/{job_id}/retry", post(jobs::retry_dlq_job))
        .route("/api/admin/dlq/retry-all", post(jobs::retry_all_dlq))
        // Last added runs first: authentication, then tier limiting, then
        // the PII interceptor around the handler's response.
        .layer(from_fn_with_state(Arc::clone(&state), pii_redaction_middleware))
        .layer(from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .layer(from_fn_with_state(Arc::clone(&state), auth_middleware));

    Router::new()
        .route("/health", get(health::liveness))
        .route("/api/health", get(health::health_check))
        .merge(protected)
        .fallback(fallback_not_found)
        .with_state(state)
}

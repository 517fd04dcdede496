use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::ValidatedJson;
use crate::llm::CancelSignal;
use crate::security::OrgContext;
use crate::shared::error::ApiError;
use crate::shared::models::{ChatMessage, ExtractionType, OrderRecord};
use crate::shared::state::AppState;
use crate::storage::mapping::new_order_from_extraction;

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtractOrderRequest {
    pub messages: Vec<ChatMessage>,
}

/// Synchronous single-message extraction: LLM call, then persistence, on
/// the request path.
pub async fn extract_single(
    org: OrgContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<ExtractRequest>,
) -> Result<Json<OrderRecord>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("message must not be empty".into()));
    }

    let extracted = state
        .llm
        .extract_single(&request.message, CancelSignal::none())
        .await?;

    let new_order = new_order_from_extraction(
        ExtractionType::SingleMessage,
        &extracted,
        json!([request.message]),
        None,
    );
    let record = state.store.add_order(org.org_id, new_order).await?;
    Ok(Json(record))
}

/// Synchronous chat-log extraction. The first sender names the customer
/// when the model does not.
pub async fn extract_chat(
    org: OrgContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<ExtractOrderRequest>,
) -> Result<Json<OrderRecord>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".into()));
    }
    if request.messages.iter().any(|m| m.text.trim().is_empty()) {
        return Err(ApiError::Validation("messages must not contain empty text".into()));
    }

    let extracted = state
        .llm
        .extract_chat(&request.messages, CancelSignal::none())
        .await?;

    let fallback_customer = request.messages.first().map(|m| m.sender.clone());
    let raw_messages = serde_json::to_value(&request.messages)
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;

    let new_order = new_order_from_extraction(
        ExtractionType::ChatLog,
        &extracted,
        raw_messages,
        fallback_customer,
    );
    let record = state.store.add_chat_order(org.org_id, new_order).await?;
    Ok(Json(record))
}

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::ValidatedJson;
use crate::security::OrgContext;
use crate::shared::error::ApiError;
use crate::shared::models::{OrderRecord, OrderStatus};
use crate::shared::state::AppState;
use crate::storage::OrderDetailsPatch;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(rename = "type")]
    pub extraction_type: Option<String>,
}

impl PageParams {
    fn clamp(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// An unparseable id is indistinguishable from an absent row.
fn parse_order_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("Order not found".into()))
}

pub async fn list_orders(
    org: OrgContext,
    Query(page): Query<PageParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let (limit, offset) = page.clamp();
    let orders = match page.extraction_type.as_deref() {
        None => state.store.get_orders(org.org_id, limit, offset).await?,
        Some("chat_log") => state.store.get_chat_orders(org.org_id, limit, offset).await?,
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "type filter only supports chat_log, got {other:?}"
            )));
        }
    };
    Ok(Json(orders))
}

pub async fn get_order(
    org: OrgContext,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<OrderRecord>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state.store.get_order(org.org_id, order_id).await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusPatch {
    pub status: String,
}

pub async fn update_status(
    org: OrgContext,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    ValidatedJson(patch): ValidatedJson<StatusPatch>,
) -> Result<Json<OrderRecord>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store
        .update_order_status(org.org_id, order_id, &patch.status)
        .await?;
    Ok(Json(order))
}

pub async fn edit_order(
    org: OrgContext,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    ValidatedJson(patch): ValidatedJson<OrderDetailsPatch>,
) -> Result<Json<OrderRecord>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store
        .update_chat_order_details(org.org_id, order_id, patch)
        .await?;
    Ok(Json(order))
}

pub async fn delete_order(
    org: OrgContext,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let deleted = state.store.delete_order(org.org_id, order_id).await?;
    if !deleted {
        return Err(ApiError::NotFound("Order not found".into()));
    }
    Ok(Json(json!({ "deleted": true })))
}

pub async fn get_stats(
    org: OrgContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let total = state.store.count_orders(org.org_id, None, None).await?;
    let pending = state
        .store
        .count_orders(org.org_id, Some(OrderStatus::Pending), None)
        .await?;
    let confirmed = state
        .store
        .count_orders(org.org_id, Some(OrderStatus::Confirmed), None)
        .await?;
    let revenue = state.store.get_total_revenue(org.org_id).await?;

    Ok(Json(json!({
        "total_orders": total,
        "pending_orders": pending,
        "confirmed_orders": confirmed,
        "total_revenue": revenue,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_to_sane_bounds() {
        let page = PageParams {
            limit: Some(10_000),
            offset: Some(-5),
            extraction_type: None,
        };
        assert_eq!(page.clamp(), (MAX_LIMIT, 0));

        let defaults = PageParams {
            limit: None,
            offset: None,
            extraction_type: None,
        };
        assert_eq!(defaults.clamp(), (DEFAULT_LIMIT, 0));
    }

    #[test]
    fn malformed_ids_read_as_absent() {
        let err = parse_order_id("not-a-uuid").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(parse_order_id(&Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn status_patch_is_strict() {
        assert!(serde_json::from_str::<StatusPatch>(r#"{"status": "confirmed"}"#).is_ok());
        assert!(
            serde_json::from_str::<StatusPatch>(r#"{"status": "confirmed", "extra": 1}"#).is_err()
        );
    }
}

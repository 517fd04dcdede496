use axum::extract::{Path, State};
use axum::response::Redirect;
use axum::Json;
use bigdecimal::BigDecimal;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::ValidatedJson;
use crate::invoice::{self, InvoiceOptions};
use crate::security::OrgContext;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateInvoiceRequest {
    pub order_id: String,
    pub tax_rate_percent: Option<BigDecimal>,
    pub is_interstate: Option<bool>,
}

/// Allocates the order's invoice sequence and attaches the computed invoice
/// in one storage transaction, then uploads the rendered document. An order
/// that already holds an invoice gets it back unchanged; sequences are
/// never re-allocated by a retry.
pub async fn generate_invoice(
    org: OrgContext,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<GenerateInvoiceRequest>,
) -> Result<Json<Value>, ApiError> {
    let order_id = Uuid::parse_str(&request.order_id)
        .map_err(|_| ApiError::NotFound("Order not found".into()))?;

    let profile = state.store.get_business_profile(org.org_id).await?;
    let defaults = &state.config.business;

    let business_name = profile
        .as_ref()
        .map(|p| p.business_name.clone())
        .unwrap_or_else(|| defaults.name.clone());
    let gst_number = profile
        .as_ref()
        .and_then(|p| p.gst_number.clone())
        .unwrap_or_else(|| defaults.gst_number.clone());
    let tax_rate_percent = request
        .tax_rate_percent
        .clone()
        .or_else(|| profile.as_ref().map(|p| p.tax_rate.clone()))
        .unwrap_or_else(|| BigDecimal::from(defaults.tax_rate_percent));
    let is_interstate = request.is_interstate.unwrap_or(false);

    let record = state
        .store
        .generate_and_attach_invoice(org.org_id, order_id, move |order, sequence| {
            invoice::generate(
                order,
                &InvoiceOptions {
                    business_name,
                    gst_number,
                    invoice_sequence: sequence,
                    tax_rate_percent,
                    is_interstate,
                },
            )
        })
        .await?;

    let attached = record
        .invoice
        .clone()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("invoice missing after attach")))?;

    // The document store is a collaborator; a failed upload must not undo a
    // committed sequence. The signed-URL path will surface the gap.
    let bytes = state.renderer.render(&attached);
    if let Err(err) = state.blob.upload_invoice(&attached.number, bytes).await {
        warn!("invoice {} upload failed: {err}", attached.number);
    }

    Ok(Json(json!({
        "order_id": record.id,
        "status": record.status,
        "invoice": attached,
        "download_url": format!("/api/orders/{}/download", record.id),
    })))
}

/// Verifies the org owns the order and an invoice exists, then redirects to
/// a short-TTL signed URL. The direct blob URL is never part of the API.
pub async fn download_invoice(
    org: OrgContext,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Redirect, ApiError> {
    let order_id =
        Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Order not found".into()))?;

    let record = state.store.get_order(org.org_id, order_id).await?;
    let attached = record
        .invoice
        .ok_or_else(|| ApiError::NotFound("Invoice not generated for this order".into()))?;

    let url = state
        .blob
        .signed_download_url(&attached.number)
        .await
        .map_err(|err| ApiError::Internal(err.context("signed url")))?;

    Ok(Redirect::temporary(&url))
}

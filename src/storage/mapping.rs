//! Row-to-domain mapping.
//!
//! Mapping is lossless for the audit columns: normalized line items win when
//! present, otherwise the items embedded in `raw_ai_response` are surfaced
//! (orders ingested before line-item normalization existed).

use bigdecimal::{BigDecimal, Zero};
use log::warn;
use serde_json::Value;
use std::str::FromStr;

use crate::llm::{ExtractedOrder, ExtractionConfidence};
use crate::shared::models::{
    Customer, CustomerSummary, ExtractionType, Invoice, OrderItemRecord, OrderItemRow,
    OrderRecord, OrderRow, OrderStatus,
};
use crate::storage::{NewExtractedOrder, NewLineItem};

/// Converts a JSON number to a decimal through its shortest printed form,
/// avoiding binary-float expansion artifacts in money columns.
pub fn decimal_from_f64(value: f64) -> BigDecimal {
    if !value.is_finite() {
        return BigDecimal::zero();
    }
    BigDecimal::from_str(&format!("{value}")).unwrap_or_else(|_| BigDecimal::zero())
}

pub fn map_order(row: OrderRow, customer: &Customer, items: Vec<OrderItemRow>) -> OrderRecord {
    let mapped_items = if items.is_empty() {
        items_from_raw(row.raw_ai_response.as_ref())
    } else {
        items
            .into_iter()
            .map(|item| OrderItemRecord {
                product_name: item.product_name,
                quantity: item.quantity,
                unit: item.unit,
                price_per_unit: item.price_per_unit,
                total_price: item.total_price,
            })
            .collect()
    };

    let invoice = row.invoice.and_then(|value| {
        serde_json::from_value::<Invoice>(value)
            .map_err(|err| warn!("stored invoice on order {} unparseable: {err}", row.id))
            .ok()
    });

    let extraction_type = ExtractionType::parse(&row.extraction_type).unwrap_or_else(|| {
        warn!("order {} has unknown extraction type {:?}", row.id, row.extraction_type);
        ExtractionType::SingleMessage
    });
    let status = OrderStatus::parse(&row.status).unwrap_or_else(|| {
        warn!("order {} has unknown status {:?}", row.id, row.status);
        OrderStatus::Pending
    });

    OrderRecord {
        id: row.id,
        organization_id: row.organization_id,
        customer: CustomerSummary {
            id: customer.id,
            name: customer.name.clone(),
            phone: customer.phone.clone(),
        },
        extraction_type,
        status,
        confidence: row.confidence,
        confidence_score: row.confidence_score,
        items: mapped_items,
        total_amount: row.total_amount,
        delivery_address: row.delivery_address,
        delivery_date: row.delivery_date,
        notes: row.notes,
        raw_ai_response: row.raw_ai_response,
        raw_messages: row.raw_messages,
        invoice,
        invoice_sequence: row.invoice_sequence,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

/// Bridges a validated extraction into a storage insert, converting every
/// money figure to decimal on the way in.
pub fn new_order_from_extraction(
    extraction_type: ExtractionType,
    extracted: &ExtractedOrder,
    raw_messages: Value,
    fallback_customer: Option<String>,
) -> NewExtractedOrder {
    let (confidence, confidence_score) = match &extracted.confidence {
        ExtractionConfidence::Level(level) => (Some(level.clone()), None),
        ExtractionConfidence::Score(score) => (None, Some(*score)),
    };

    NewExtractedOrder {
        extraction_type,
        customer_name: extracted.customer_name.clone().or(fallback_customer),
        customer_phone: None,
        items: extracted
            .items
            .iter()
            .map(|item| NewLineItem {
                product_name: item.product_name.clone(),
                quantity: decimal_from_f64(item.quantity),
                unit: item.unit.clone(),
                price_per_unit: item.price.map(decimal_from_f64),
            })
            .collect(),
        total_amount: extracted.total_amount.map(decimal_from_f64),
        delivery_address: extracted.delivery_address.clone(),
        delivery_date: extracted.delivery_date.clone(),
        notes: extracted.notes.clone(),
        confidence,
        confidence_score,
        raw_ai_response: Some(extracted.raw.clone()),
        raw_messages: Some(raw_messages),
    }
}

/// Audit-copy fallback for orders with no normalized rows.
fn items_from_raw(raw: Option<&Value>) -> Vec<OrderItemRecord> {
    let Some(items) = raw.and_then(|v| v.get("items")).and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let product_name = item.get("product_name")?.as_str()?.trim();
            if product_name.is_empty() {
                return None;
            }
            let quantity = item
                .get("quantity")
                .and_then(Value::as_f64)
                .map(decimal_from_f64)
                .unwrap_or_else(|| BigDecimal::from(1));
            let price_per_unit = item.get("price").and_then(Value::as_f64).map(decimal_from_f64);
            let total_price = price_per_unit
                .as_ref()
                .map(|price| &quantity * price)
                .unwrap_or_else(BigDecimal::zero);

            Some(OrderItemRecord {
                product_name: product_name.to_string(),
                quantity,
                unit: item.get("unit").and_then(Value::as_str).map(str::to_string),
                price_per_unit,
                total_price,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn customer() -> Customer {
        Customer {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "Rahul Sharma".into(),
            phone: Some("+919876543210".into()),
            address: None,
            created_at: Utc::now(),
        }
    }

    fn base_row() -> OrderRow {
        let now = Utc::now();
        OrderRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            extraction_type: "chat_log".into(),
            status: "pending".into(),
            confidence: Some("high".into()),
            confidence_score: None,
            total_amount: BigDecimal::from(790),
            delivery_address: Some("42 MG Road, Bangalore".into()),
            delivery_date: None,
            notes: None,
            raw_ai_response: None,
            raw_messages: None,
            invoice: None,
            invoice_sequence: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn item_row(order_id: Uuid, name: &str, qty: i64, price: i64) -> OrderItemRow {
        OrderItemRow {
            id: Uuid::new_v4(),
            order_id,
            organization_id: Uuid::new_v4(),
            product_name: name.into(),
            quantity: BigDecimal::from(qty),
            unit: Some("kg".into()),
            price_per_unit: Some(BigDecimal::from(price)),
            total_price: BigDecimal::from(qty * price),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalized_rows_win_over_raw_copy() {
        let mut row = base_row();
        row.raw_ai_response = Some(json!({
            "items": [{"product_name": "Stale Item", "quantity": 9, "price": 1}]
        }));
        let items = vec![item_row(row.id, "Basmati Rice", 5, 120)];

        let record = map_order(row, &customer(), items);
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.items[0].product_name, "Basmati Rice");
    }

    #[test]
    fn raw_copy_is_the_fallback() {
        let mut row = base_row();
        row.raw_ai_response = Some(json!({
            "items": [
                {"product_name": "Basmati Rice", "quantity": 5, "price": 120},
                {"product_name": "Toor Dal", "quantity": 2, "price": 95}
            ]
        }));

        let record = map_order(row, &customer(), Vec::new());
        assert_eq!(record.items.len(), 2);
        assert_eq!(record.items[0].total_price, BigDecimal::from(600));
        assert_eq!(record.items[1].total_price, BigDecimal::from(190));
    }

    #[test]
    fn fallback_handles_missing_fields() {
        let mut row = base_row();
        row.raw_ai_response = Some(json!({
            "items": [
                {"product_name": "Rice"},
                {"quantity": 3},
                {"product_name": ""}
            ]
        }));

        let record = map_order(row, &customer(), Vec::new());
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.items[0].quantity, BigDecimal::from(1));
        assert_eq!(record.items[0].price_per_unit, None);
    }

    #[test]
    fn stored_invoice_round_trips() {
        let mut row = base_row();
        row.invoice = Some(json!({
            "number": "INV-2026-001",
            "date": "14/03/2026",
            "customer_name": "Rahul Sharma",
            "lines": [],
            "subtotal": "660.00",
            "cgst": "59.40",
            "sgst": "59.40",
            "total": "778.80",
            "business_name": "Sharma Traders",
            "gst_number": "29ABCDE1234F1Z5"
        }));
        row.invoice_sequence = Some(1);

        let record = map_order(row, &customer(), Vec::new());
        let invoice = record.invoice.unwrap();
        assert_eq!(invoice.number, "INV-2026-001");
        assert_eq!(invoice.igst, None);
    }

    #[test]
    fn decimal_conversion_uses_shortest_form() {
        assert_eq!(decimal_from_f64(120.0), BigDecimal::from(120));
        assert_eq!(decimal_from_f64(95.5), BigDecimal::from_str("95.5").unwrap());
        assert_eq!(decimal_from_f64(f64::NAN), BigDecimal::zero());
    }
}

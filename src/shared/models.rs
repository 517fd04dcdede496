use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod schema {
    diesel::table! {
        organizations (id) {
            id -> Uuid,
            name -> Text,
            gst_number -> Nullable<Text>,
            tier -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        business_profiles (id) {
            id -> Uuid,
            organization_id -> Uuid,
            business_name -> Text,
            gst_number -> Nullable<Text>,
            tax_rate -> Numeric,
            currency -> Text,
            state_code -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        users (id) {
            id -> Text,
            email -> Text,
            name -> Nullable<Text>,
            organization_id -> Nullable<Uuid>,
            role -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        roles (id) {
            id -> Uuid,
            organization_id -> Uuid,
            name -> Text,
            permissions -> Jsonb,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        api_keys (id) {
            id -> Uuid,
            organization_id -> Uuid,
            name -> Text,
            key_hash -> Text,
            key_mask -> Text,
            is_active -> Bool,
            last_used_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        customers (id) {
            id -> Uuid,
            organization_id -> Uuid,
            name -> Text,
            phone -> Nullable<Text>,
            address -> Nullable<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        products (id) {
            id -> Uuid,
            organization_id -> Uuid,
            name -> Text,
            unit -> Nullable<Text>,
            price -> Nullable<Numeric>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        orders (id) {
            id -> Uuid,
            organization_id -> Uuid,
            customer_id -> Uuid,
            extraction_type -> Text,
            status -> Text,
            confidence -> Nullable<Text>,
            confidence_score -> Nullable<Float8>,
            total_amount -> Numeric,
            delivery_address -> Nullable<Text>,
            delivery_date -> Nullable<Text>,
            notes -> Nullable<Text>,
            raw_ai_response -> Nullable<Jsonb>,
            raw_messages -> Nullable<Jsonb>,
            invoice -> Nullable<Jsonb>,
            invoice_sequence -> Nullable<Int4>,
            deleted_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        order_items (id) {
            id -> Uuid,
            order_id -> Uuid,
            organization_id -> Uuid,
            product_name -> Text,
            quantity -> Numeric,
            unit -> Nullable<Text>,
            price_per_unit -> Nullable<Numeric>,
            total_price -> Numeric,
            created_at -> Timestamptz,
        }
    }

    diesel::allow_tables_to_appear_in_same_query!(
        organizations,
        business_profiles,
        users,
        roles,
        api_keys,
        customers,
        products,
        orders,
        order_items,
    );
}

use schema::{api_keys, customers, order_items, orders, users};

#[derive(Debug, Clone, Queryable)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub gst_number: Option<String>,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct BusinessProfile {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub business_name: String,
    pub gst_number: Option<String>,
    pub tax_rate: BigDecimal,
    pub currency: String,
    pub state_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub organization_id: Option<Uuid>,
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub permissions: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = api_keys)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_mask: String,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = customers)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct Product {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub unit: Option<String>,
    pub price: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub extraction_type: String,
    pub status: String,
    pub confidence: Option<String>,
    pub confidence_score: Option<f64>,
    pub total_amount: BigDecimal,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub raw_ai_response: Option<serde_json::Value>,
    pub raw_messages: Option<serde_json::Value>,
    pub invoice: Option<serde_json::Value>,
    pub invoice_sequence: Option<i32>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub extraction_type: String,
    pub status: String,
    pub confidence: Option<String>,
    pub confidence_score: Option<f64>,
    pub total_amount: BigDecimal,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub raw_ai_response: Option<serde_json::Value>,
    pub raw_messages: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = order_items)]
pub struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub organization_id: Uuid,
    pub product_name: String,
    pub quantity: BigDecimal,
    pub unit: Option<String>,
    pub price_per_unit: Option<BigDecimal>,
    pub total_price: BigDecimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Fulfilled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Fulfilled => "fulfilled",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "fulfilled" => Some(Self::Fulfilled),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    SingleMessage,
    ChatLog,
}

impl ExtractionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleMessage => "single_message",
            Self::ChatLog => "chat_log",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single_message" => Some(Self::SingleMessage),
            "chat_log" => Some(Self::ChatLog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

/// One message of a chat log as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRecord {
    pub product_name: String,
    pub quantity: BigDecimal,
    pub unit: Option<String>,
    pub price_per_unit: Option<BigDecimal>,
    pub total_price: BigDecimal,
}

/// Immutable invoice snapshot, embedded in the order row once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub number: String,
    pub date: String,
    pub customer_name: String,
    pub lines: Vec<InvoiceLine>,
    pub subtotal: BigDecimal,
    pub cgst: BigDecimal,
    pub sgst: BigDecimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub igst: Option<BigDecimal>,
    pub total: BigDecimal,
    pub business_name: String,
    pub gst_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: BigDecimal,
    pub price: BigDecimal,
    pub amount: BigDecimal,
}

/// Fully mapped order as served by the API and delivered to webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer: CustomerSummary,
    pub extraction_type: ExtractionType,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    pub items: Vec<OrderItemRecord>,
    pub total_amount: BigDecimal,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub raw_ai_response: Option<serde_json::Value>,
    pub raw_messages: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
    pub invoice_sequence: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Fulfilled,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("shipped"), None);
    }

    #[test]
    fn extraction_type_serde_uses_discriminator() {
        let json = serde_json::to_string(&ExtractionType::SingleMessage).unwrap();
        assert_eq!(json, "\"single_message\"");
        let parsed: ExtractionType = serde_json::from_str("\"chat_log\"").unwrap();
        assert_eq!(parsed, ExtractionType::ChatLog);
    }

    #[test]
    fn tier_parse_rejects_unknown() {
        assert_eq!(Tier::parse("pro"), Some(Tier::Pro));
        assert_eq!(Tier::parse("platinum"), None);
    }
}

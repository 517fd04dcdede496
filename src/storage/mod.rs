//! Tenant-scoped persistence.
//!
//! The only channel through which business data is read or written. Every
//! method takes the organization id first and folds
//! `organization_id = $org AND deleted_at IS NULL` into its predicates;
//! updates that follow foreign keys re-assert the organization on the write
//! so a forged id cannot cross tenants. A row that exists under another
//! organization is indistinguishable from an absent one.

use bigdecimal::{rounding::RoundingMode, BigDecimal, Zero};
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::shared::error::ApiError;
use crate::shared::models::schema::{customers, order_items, orders, organizations};
use crate::shared::models::{
    schema, BusinessProfile, Customer, ExtractionType, Invoice, NewOrder, OrderItemRow,
    OrderRecord, OrderRow, OrderStatus,
};
use crate::shared::state::DbPool;

pub mod mapping;

pub use mapping::decimal_from_f64;
use mapping::map_order;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Validation(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Internal(err) => write!(f, "storage: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => Self::Conflict(info.message().to_string()),
            other => Self::Internal(anyhow::Error::new(other).context("database query")),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Internal(err) => ApiError::Internal(err),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLineItem {
    pub product_name: String,
    pub quantity: BigDecimal,
    pub unit: Option<String>,
    pub price_per_unit: Option<BigDecimal>,
}

#[derive(Debug, Clone)]
pub struct NewExtractedOrder {
    pub extraction_type: ExtractionType,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub items: Vec<NewLineItem>,
    pub total_amount: Option<BigDecimal>,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub confidence: Option<String>,
    pub confidence_score: Option<f64>,
    pub raw_ai_response: Option<Value>,
    pub raw_messages: Option<Value>,
}

/// Strict allow-list patch for the edit endpoint; unknown fields are
/// rejected at deserialization time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderDetailsPatch {
    pub customer_name: Option<String>,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub items: Option<Vec<NewLineItem>>,
}

fn line_total(quantity: &BigDecimal, price: Option<&BigDecimal>) -> BigDecimal {
    let price = price.cloned().unwrap_or_else(BigDecimal::zero);
    (quantity * price).with_scale_round(2, RoundingMode::HalfUp)
}

#[derive(Clone)]
pub struct OrderStore {
    pool: DbPool,
}

impl OrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Internal(anyhow::Error::new(e).context("pool checkout")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(anyhow::Error::new(e).context("blocking task")))?
    }

    pub async fn get_orders(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        self.list_orders(org_id, limit, offset, None).await
    }

    pub async fn get_chat_orders(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        self.list_orders(org_id, limit, offset, Some(ExtractionType::ChatLog))
            .await
    }

    async fn list_orders(
        &self,
        org_id: Uuid,
        limit: i64,
        offset: i64,
        extraction_type: Option<ExtractionType>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        self.run(move |conn| {
            let mut query = orders::table
                .filter(orders::organization_id.eq(org_id))
                .filter(orders::deleted_at.is_null())
                .into_boxed();
            if let Some(kind) = extraction_type {
                query = query.filter(orders::extraction_type.eq(kind.as_str()));
            }
            let rows: Vec<OrderRow> = query
                .order(orders::created_at.desc())
                .limit(limit)
                .offset(offset)
                .load(conn)?;
            map_rows(conn, rows)
        })
        .await
    }

    pub async fn get_order(&self, org_id: Uuid, order_id: Uuid) -> Result<OrderRecord, StoreError> {
        self.run(move |conn| {
            let row = load_scoped_order(conn, org_id, order_id)?;
            map_single(conn, row)
        })
        .await
    }

    /// Single-message ingestion: always creates a fresh customer row.
    pub async fn add_order(
        &self,
        org_id: Uuid,
        input: NewExtractedOrder,
    ) -> Result<OrderRecord, StoreError> {
        self.run(move |conn| {
            conn.transaction(|conn| insert_order(conn, org_id, input, false))
        })
        .await
    }

    /// Chat ingestion: reuses the org's customer row by name when one exists.
    pub async fn add_chat_order(
        &self,
        org_id: Uuid,
        input: NewExtractedOrder,
    ) -> Result<OrderRecord, StoreError> {
        self.run(move |conn| {
            conn.transaction(|conn| insert_order(conn, org_id, input, true))
        })
        .await
    }

    pub async fn update_order_status(
        &self,
        org_id: Uuid,
        order_id: Uuid,
        status: &str,
    ) -> Result<OrderRecord, StoreError> {
        let status = OrderStatus::parse(status).ok_or_else(|| {
            StoreError::Validation(format!(
                "status must be one of pending, confirmed, fulfilled, cancelled; got {status:?}"
            ))
        })?;

        self.run(move |conn| {
            let updated = diesel::update(
                orders::table
                    .filter(orders::id.eq(order_id))
                    .filter(orders::organization_id.eq(org_id))
                    .filter(orders::deleted_at.is_null()),
            )
            .set((
                orders::status.eq(status.as_str()),
                orders::updated_at.eq(Utc::now()),
            ))
            .get_result::<OrderRow>(conn)
            .optional()?;

            let row = updated.ok_or_else(|| StoreError::NotFound("Order not found".into()))?;
            map_single(conn, row)
        })
        .await
    }

    /// Partial update under the strict allow-list. An `items` change replaces
    /// every line in one transaction; there is no per-row diffing.
    pub async fn update_chat_order_details(
        &self,
        org_id: Uuid,
        order_id: Uuid,
        patch: OrderDetailsPatch,
    ) -> Result<OrderRecord, StoreError> {
        self.run(move |conn| {
            conn.transaction(|conn| {
                let row = load_scoped_order(conn, org_id, order_id)?;

                if let Some(name) = &patch.customer_name {
                    diesel::update(
                        customers::table
                            .filter(customers::id.eq(row.customer_id))
                            .filter(customers::organization_id.eq(org_id)),
                    )
                    .set(customers::name.eq(name))
                    .execute(conn)?;
                }

                let mut total_amount = row.total_amount.clone();
                if let Some(items) = &patch.items {
                    diesel::delete(
                        order_items::table
                            .filter(order_items::order_id.eq(order_id))
                            .filter(order_items::organization_id.eq(org_id)),
                    )
                    .execute(conn)?;
                    let rows = build_item_rows(org_id, order_id, items);
                    diesel::insert_into(order_items::table)
                        .values(&rows)
                        .execute(conn)?;
                    total_amount = rows
                        .iter()
                        .fold(BigDecimal::zero(), |acc, item| acc + &item.total_price)
                        .with_scale_round(2, RoundingMode::HalfUp);
                }

                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::organization_id.eq(org_id))
                        .filter(orders::deleted_at.is_null()),
                )
                .set((
                    orders::delivery_address
                        .eq(patch.delivery_address.as_ref().or(row.delivery_address.as_ref())),
                    orders::delivery_date
                        .eq(patch.delivery_date.as_ref().or(row.delivery_date.as_ref())),
                    orders::notes.eq(patch.notes.as_ref().or(row.notes.as_ref())),
                    orders::total_amount.eq(&total_amount),
                    orders::updated_at.eq(Utc::now()),
                ))
                .get_result::<OrderRow>(conn)?;

                map_single(conn, updated)
            })
        })
        .await
    }

    /// Soft delete. Returns whether a row was matched.
    pub async fn delete_order(&self, org_id: Uuid, order_id: Uuid) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let affected = diesel::update(
                orders::table
                    .filter(orders::id.eq(order_id))
                    .filter(orders::organization_id.eq(org_id))
                    .filter(orders::deleted_at.is_null()),
            )
            .set(orders::deleted_at.eq(Some(Utc::now())))
            .execute(conn)?;
            Ok(affected > 0)
        })
        .await
    }

    /// Attaches an already-computed invoice (idempotent retries that hold a
    /// sequence). The predicate re-asserts the organization.
    pub async fn attach_invoice(
        &self,
        org_id: Uuid,
        order_id: Uuid,
        invoice: Invoice,
        sequence: i32,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            let payload = serde_json::to_value(&invoice)
                .map_err(|e| StoreError::Internal(anyhow::Error::new(e)))?;
            let affected = diesel::update(
                orders::table
                    .filter(orders::id.eq(order_id))
                    .filter(orders::organization_id.eq(org_id))
                    .filter(orders::deleted_at.is_null()),
            )
            .set((
                orders::invoice.eq(Some(payload)),
                orders::invoice_sequence.eq(Some(sequence)),
                orders::status.eq(OrderStatus::Confirmed.as_str()),
                orders::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
            if affected == 0 {
                return Err(StoreError::NotFound("Order not found".into()));
            }
            Ok(())
        })
        .await
    }

    /// Allocates the next per-org invoice sequence and attaches the invoice
    /// the generator produces, in one transaction.
    ///
    /// The organization row is locked `FOR UPDATE` to serialize allocation
    /// within the tenant; other tenants proceed in parallel. Soft-deleted
    /// orders keep their sequence, so the max scan ignores `deleted_at`.
    /// An order that already carries an invoice is returned unchanged.
    pub async fn generate_and_attach_invoice<F>(
        &self,
        org_id: Uuid,
        order_id: Uuid,
        generator: F,
    ) -> Result<OrderRecord, StoreError>
    where
        F: FnOnce(&OrderRecord, i32) -> anyhow::Result<Invoice> + Send + 'static,
    {
        self.run(move |conn| {
            conn.transaction(|conn| {
                organizations::table
                    .filter(organizations::id.eq(org_id))
                    .select(organizations::id)
                    .for_update()
                    .first::<Uuid>(conn)
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound("Organization not found".into()))?;

                let row = load_scoped_order(conn, org_id, order_id)?;
                let record = map_single(conn, row)?;

                if record.invoice.is_some() {
                    return Ok(record);
                }

                let max_sequence: Option<i32> = orders::table
                    .filter(orders::organization_id.eq(org_id))
                    .select(diesel::dsl::max(orders::invoice_sequence))
                    .first(conn)?;
                let next_sequence = max_sequence.unwrap_or(0) + 1;

                let invoice = generator(&record, next_sequence)
                    .map_err(|e| StoreError::Internal(e.context("invoice generator")))?;
                let payload = serde_json::to_value(&invoice)
                    .map_err(|e| StoreError::Internal(anyhow::Error::new(e)))?;

                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::organization_id.eq(org_id)),
                )
                .set((
                    orders::invoice.eq(Some(payload)),
                    orders::invoice_sequence.eq(Some(next_sequence)),
                    orders::status.eq(OrderStatus::Confirmed.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .get_result::<OrderRow>(conn)?;

                map_single(conn, updated)
            })
        })
        .await
    }

    pub async fn count_orders(
        &self,
        org_id: Uuid,
        status: Option<OrderStatus>,
        extraction_type: Option<ExtractionType>,
    ) -> Result<i64, StoreError> {
        self.run(move |conn| {
            let mut query = orders::table
                .filter(orders::organization_id.eq(org_id))
                .filter(orders::deleted_at.is_null())
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(orders::status.eq(status.as_str()));
            }
            if let Some(kind) = extraction_type {
                query = query.filter(orders::extraction_type.eq(kind.as_str()));
            }
            Ok(query.count().get_result(conn)?)
        })
        .await
    }

    /// Pre-tax revenue across the org's visible orders.
    pub async fn get_total_revenue(&self, org_id: Uuid) -> Result<BigDecimal, StoreError> {
        self.run(move |conn| {
            let sum: Option<BigDecimal> = orders::table
                .filter(orders::organization_id.eq(org_id))
                .filter(orders::deleted_at.is_null())
                .select(diesel::dsl::sum(orders::total_amount))
                .first(conn)?;
            Ok(sum.unwrap_or_else(BigDecimal::zero))
        })
        .await
    }

    pub async fn get_business_profile(
        &self,
        org_id: Uuid,
    ) -> Result<Option<BusinessProfile>, StoreError> {
        self.run(move |conn| {
            use schema::business_profiles::dsl::*;
            Ok(business_profiles
                .filter(organization_id.eq(org_id))
                .first::<BusinessProfile>(conn)
                .optional()?)
        })
        .await
    }
}

fn load_scoped_order(
    conn: &mut PgConnection,
    org_id: Uuid,
    order_id: Uuid,
) -> Result<OrderRow, StoreError> {
    orders::table
        .filter(orders::id.eq(order_id))
        .filter(orders::organization_id.eq(org_id))
        .filter(orders::deleted_at.is_null())
        .first::<OrderRow>(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound("Order not found".into()))
}

fn load_customer(conn: &mut PgConnection, customer_id: Uuid) -> Result<Customer, StoreError> {
    customers::table
        .filter(customers::id.eq(customer_id))
        .first::<Customer>(conn)
        .optional()?
        .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("order customer row missing")))
}

fn map_single(conn: &mut PgConnection, row: OrderRow) -> Result<OrderRecord, StoreError> {
    let customer = load_customer(conn, row.customer_id)?;
    let items: Vec<OrderItemRow> = order_items::table
        .filter(order_items::order_id.eq(row.id))
        .order(order_items::created_at.asc())
        .load(conn)?;
    Ok(map_order(row, &customer, items))
}

fn map_rows(conn: &mut PgConnection, rows: Vec<OrderRow>) -> Result<Vec<OrderRecord>, StoreError> {
    let order_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let customer_ids: Vec<Uuid> = rows.iter().map(|r| r.customer_id).collect();

    let customer_map: HashMap<Uuid, Customer> = customers::table
        .filter(customers::id.eq_any(&customer_ids))
        .load::<Customer>(conn)?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();

    let mut items_map: HashMap<Uuid, Vec<OrderItemRow>> = HashMap::new();
    for item in order_items::table
        .filter(order_items::order_id.eq_any(&order_ids))
        .order(order_items::created_at.asc())
        .load::<OrderItemRow>(conn)?
    {
        items_map.entry(item.order_id).or_default().push(item);
    }

    rows.into_iter()
        .map(|row| {
            let customer = customer_map
                .get(&row.customer_id)
                .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("order customer row missing")))?;
            let items = items_map.remove(&row.id).unwrap_or_default();
            Ok(map_order(row, customer, items))
        })
        .collect()
}

fn build_item_rows(org_id: Uuid, order_id: Uuid, items: &[NewLineItem]) -> Vec<OrderItemRow> {
    let now = Utc::now();
    items
        .iter()
        .map(|item| OrderItemRow {
            id: Uuid::new_v4(),
            order_id,
            organization_id: org_id,
            product_name: item.product_name.clone(),
            quantity: item.quantity.clone(),
            unit: item.unit.clone(),
            price_per_unit: item.price_per_unit.clone(),
            total_price: line_total(&item.quantity, item.price_per_unit.as_ref()),
            created_at: now,
        })
        .collect()
}

fn insert_order(
    conn: &mut PgConnection,
    org_id: Uuid,
    input: NewExtractedOrder,
    reuse_customer: bool,
) -> Result<OrderRecord, StoreError> {
    let customer_name = input
        .customer_name
        .clone()
        .unwrap_or_else(|| "Unknown Customer".to_string());

    let existing = if reuse_customer {
        customers::table
            .filter(customers::organization_id.eq(org_id))
            .filter(customers::name.eq(&customer_name))
            .first::<Customer>(conn)
            .optional()?
    } else {
        None
    };

    let customer = match existing {
        Some(customer) => customer,
        None => {
            let fresh = Customer {
                id: Uuid::new_v4(),
                organization_id: org_id,
                name: customer_name,
                phone: input.customer_phone.clone(),
                address: input.delivery_address.clone(),
                created_at: Utc::now(),
            };
            diesel::insert_into(customers::table)
                .values(&fresh)
                .get_result::<Customer>(conn)?
        }
    };

    let order_id = Uuid::new_v4();
    let item_rows = build_item_rows(org_id, order_id, &input.items);
    let total_amount = input.total_amount.clone().unwrap_or_else(|| {
        item_rows
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + &item.total_price)
            .with_scale_round(2, RoundingMode::HalfUp)
    });

    let now = Utc::now();
    let row = diesel::insert_into(orders::table)
        .values(&NewOrder {
            id: order_id,
            organization_id: org_id,
            customer_id: customer.id,
            extraction_type: input.extraction_type.as_str().to_string(),
            status: OrderStatus::Pending.as_str().to_string(),
            confidence: input.confidence,
            confidence_score: input.confidence_score,
            total_amount,
            delivery_address: input.delivery_address,
            delivery_date: input.delivery_date,
            notes: input.notes,
            raw_ai_response: input.raw_ai_response,
            raw_messages: input.raw_messages,
            created_at: now,
            updated_at: now,
        })
        .get_result::<OrderRow>(conn)?;

    diesel::insert_into(order_items::table)
        .values(&item_rows)
        .execute(conn)?;

    let items = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .order(order_items::created_at.asc())
        .load::<OrderItemRow>(conn)?;

    Ok(map_order(row, &customer, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn edit_patch_rejects_unknown_fields() {
        let err = serde_json::from_str::<OrderDetailsPatch>(
            r#"{"delivery_address": "MG Road", "status": "confirmed"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn edit_patch_accepts_allow_listed_fields() {
        let patch: OrderDetailsPatch = serde_json::from_str(
            r#"{
                "customer_name": "Rahul",
                "delivery_address": "42 MG Road",
                "items": [{"product_name": "Rice", "quantity": 5, "price_per_unit": "120"}]
            }"#,
        )
        .unwrap();
        assert_eq!(patch.customer_name.as_deref(), Some("Rahul"));
        assert_eq!(patch.items.unwrap().len(), 1);
    }

    #[test]
    fn line_totals_round_half_up() {
        let qty = BigDecimal::from(3);
        let price = BigDecimal::from_str("33.335").unwrap();
        assert_eq!(
            line_total(&qty, Some(&price)),
            BigDecimal::from_str("100.01").unwrap()
        );
        assert_eq!(line_total(&qty, None), BigDecimal::zero());
    }

    #[test]
    fn item_rows_carry_org_scope() {
        let org = Uuid::new_v4();
        let order = Uuid::new_v4();
        let rows = build_item_rows(
            org,
            order,
            &[NewLineItem {
                product_name: "Rice".into(),
                quantity: BigDecimal::from(5),
                unit: Some("kg".into()),
                price_per_unit: Some(BigDecimal::from(120)),
            }],
        );
        assert_eq!(rows[0].organization_id, org);
        assert_eq!(rows[0].order_id, order);
        assert_eq!(rows[0].total_price, BigDecimal::from_str("600.00").unwrap());
    }
}

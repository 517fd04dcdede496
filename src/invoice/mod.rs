//! Invoice computation: fixed-precision line math, GST split, numbering.
//!
//! All money flows through `BigDecimal`; every output field is rounded
//! half-up to two decimal places. Floats never touch an amount.

use anyhow::{bail, Result};
use bigdecimal::{rounding::RoundingMode, BigDecimal, Zero};
use chrono::{Datelike, NaiveDate, Utc};

use crate::shared::models::{Invoice, InvoiceLine, OrderRecord};

#[derive(Debug, Clone)]
pub struct InvoiceOptions {
    pub business_name: String,
    pub gst_number: String,
    pub invoice_sequence: i32,
    pub tax_rate_percent: BigDecimal,
    pub is_interstate: bool,
}

fn round2(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(2, RoundingMode::HalfUp)
}

/// Builds the invoice number: `INV-<year>-<seq>` with the sequence
/// zero-padded to three digits, never truncated.
pub fn invoice_number(year: i32, sequence: i32) -> String {
    format!("INV-{year}-{sequence:03}")
}

pub fn generate(order: &OrderRecord, options: &InvoiceOptions) -> Result<Invoice> {
    generate_on(order, options, Utc::now().date_naive())
}

pub fn generate_on(order: &OrderRecord, options: &InvoiceOptions, date: NaiveDate) -> Result<Invoice> {
    if options.invoice_sequence < 1 {
        bail!("invoice sequence must be a positive integer");
    }

    let hundred = BigDecimal::from(100);
    let mut lines = Vec::with_capacity(order.items.len());
    let mut subtotal = BigDecimal::zero();

    for item in &order.items {
        // A line with no extracted price contributes zero, never an invented amount.
        let price = item.price_per_unit.clone().unwrap_or_else(BigDecimal::zero);
        let amount = round2(&(&item.quantity * &price));
        subtotal += &amount;
        lines.push(InvoiceLine {
            description: item.product_name.clone(),
            quantity: item.quantity.clone(),
            price,
            amount,
        });
    }
    let subtotal = round2(&subtotal);

    let (cgst, sgst, igst) = if options.is_interstate {
        let igst = round2(&(&subtotal * &options.tax_rate_percent / &hundred));
        (BigDecimal::zero(), BigDecimal::zero(), Some(igst))
    } else {
        let half = round2(&(&subtotal * &options.tax_rate_percent / BigDecimal::from(2) / &hundred));
        (half.clone(), half, None)
    };

    let total = round2(&(&subtotal + &cgst + &sgst + igst.clone().unwrap_or_else(BigDecimal::zero)));

    Ok(Invoice {
        number: invoice_number(date.year(), options.invoice_sequence),
        date: date.format("%d/%m/%Y").to_string(),
        customer_name: order.customer.name.clone(),
        lines,
        subtotal,
        cgst,
        sgst,
        igst,
        total,
        business_name: options.business_name.clone(),
        gst_number: options.gst_number.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{
        CustomerSummary, ExtractionType, OrderItemRecord, OrderStatus,
    };
    use std::str::FromStr;
    use uuid::Uuid;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn order_with_items(items: Vec<(i64, Option<&str>)>) -> OrderRecord {
        let now = Utc::now();
        OrderRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer: CustomerSummary {
                id: Uuid::new_v4(),
                name: "Rahul Sharma".into(),
                phone: None,
            },
            extraction_type: ExtractionType::ChatLog,
            status: OrderStatus::Pending,
            confidence: Some("high".into()),
            confidence_score: None,
            items: items
                .into_iter()
                .enumerate()
                .map(|(i, (qty, price))| OrderItemRecord {
                    product_name: format!("Item {i}"),
                    quantity: BigDecimal::from(qty),
                    unit: None,
                    price_per_unit: price.map(dec),
                    total_price: BigDecimal::zero(),
                })
                .collect(),
            total_amount: BigDecimal::zero(),
            delivery_address: None,
            delivery_date: None,
            notes: None,
            raw_ai_response: None,
            raw_messages: None,
            invoice: None,
            invoice_sequence: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn options(sequence: i32, interstate: bool) -> InvoiceOptions {
        InvoiceOptions {
            business_name: "Sharma Traders".into(),
            gst_number: "29ABCDE1234F1Z5".into(),
            invoice_sequence: sequence,
            tax_rate_percent: BigDecimal::from(18),
            is_interstate: interstate,
        }
    }

    #[test]
    fn intra_state_split() {
        let order = order_with_items(vec![(2, Some("150")), (3, Some("120"))]);
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let invoice = generate_on(&order, &options(42, false), date).unwrap();

        assert_eq!(invoice.number, "INV-2026-042");
        assert_eq!(invoice.date, "14/03/2026");
        assert_eq!(invoice.subtotal, dec("660.00"));
        assert_eq!(invoice.cgst, dec("59.40"));
        assert_eq!(invoice.sgst, dec("59.40"));
        assert_eq!(invoice.igst, None);
        assert_eq!(invoice.total, dec("778.80"));
    }

    #[test]
    fn inter_state_split() {
        let order = order_with_items(vec![(2, Some("150")), (3, Some("120"))]);
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let invoice = generate_on(&order, &options(42, true), date).unwrap();

        assert_eq!(invoice.cgst, BigDecimal::zero());
        assert_eq!(invoice.sgst, BigDecimal::zero());
        assert_eq!(invoice.igst, Some(dec("118.80")));
        assert_eq!(invoice.total, dec("778.80"));
    }

    #[test]
    fn null_price_counts_as_zero() {
        let order = order_with_items(vec![(5, None), (2, Some("95"))]);
        let invoice = generate(&order, &options(1, false)).unwrap();
        assert_eq!(invoice.subtotal, dec("190.00"));
        assert_eq!(invoice.lines[0].amount, dec("0.00"));
    }

    #[test]
    fn half_up_rounding_per_field() {
        // 1 × 33.33 at 5%: full tax 1.6665, halves 0.83325 → 0.83 each.
        let order = order_with_items(vec![(1, Some("33.33"))]);
        let mut opts = options(1, false);
        opts.tax_rate_percent = BigDecimal::from(5);
        let invoice = generate(&order, &opts).unwrap();
        assert_eq!(invoice.cgst, dec("0.83"));
        assert_eq!(invoice.sgst, dec("0.83"));
        assert_eq!(invoice.total, dec("34.99"));
    }

    #[test]
    fn split_halves_stay_within_one_paisa_of_full_tax() {
        for (qty, price) in [(1i64, "99.99"), (3, "11.11"), (7, "4.45"), (13, "0.07")] {
            let order = order_with_items(vec![(qty, Some(price))]);
            let invoice = generate(&order, &options(1, false)).unwrap();
            let full = round2(&(&invoice.subtotal * BigDecimal::from(18) / BigDecimal::from(100)));
            let combined = &invoice.cgst + &invoice.sgst;
            let delta = (combined - full).abs();
            assert!(delta <= dec("0.01"), "delta {delta} for {qty}x{price}");
        }
    }

    #[test]
    fn sequence_padding_never_truncates() {
        assert_eq!(invoice_number(2026, 7), "INV-2026-007");
        assert_eq!(invoice_number(2026, 42), "INV-2026-042");
        assert_eq!(invoice_number(2026, 1234), "INV-2026-1234");
    }

    #[test]
    fn rejects_non_positive_sequence() {
        let order = order_with_items(vec![(1, Some("10"))]);
        assert!(generate(&order, &options(0, false)).is_err());
        assert!(generate(&order, &options(-3, false)).is_err());
    }
}

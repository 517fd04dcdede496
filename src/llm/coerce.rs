//! Coercion of the tool payload into a validated extraction.
//!
//! The model output is never trusted as-is: quantities fall back to 1,
//! prices are never invented, confidence values are clamped or normalized.

use serde_json::Value;

use super::{ExtractedItem, ExtractedOrder, ExtractionConfidence};

const CONFIDENCE_LEVELS: [&str; 3] = ["high", "medium", "low"];

pub fn coerce_single(input: &Value) -> ExtractedOrder {
    let confidence = match input.get("confidence").and_then(Value::as_f64) {
        Some(score) => score.clamp(0.0, 1.0),
        None => 0.5,
    };
    coerce_common(input, ExtractionConfidence::Score(confidence))
}

pub fn coerce_chat(input: &Value) -> ExtractedOrder {
    let level = input
        .get("confidence")
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .filter(|level| CONFIDENCE_LEVELS.contains(&level.as_str()))
        .unwrap_or_else(|| "medium".to_string());
    coerce_common(input, ExtractionConfidence::Level(level))
}

fn coerce_common(input: &Value, confidence: ExtractionConfidence) -> ExtractedOrder {
    let items = input
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(coerce_item).collect())
        .unwrap_or_default();

    ExtractedOrder {
        customer_name: non_empty_string(input.get("customer_name")),
        items,
        delivery_address: non_empty_string(input.get("delivery_address")),
        delivery_date: non_empty_string(input.get("delivery_date")),
        notes: non_empty_string(input.get("notes")),
        total_amount: input.get("total_amount").and_then(Value::as_f64),
        confidence,
        raw: input.clone(),
    }
}

fn coerce_item(item: &Value) -> Option<ExtractedItem> {
    let product_name = non_empty_string(item.get("product_name"))?;

    let quantity = match item.get("quantity").and_then(Value::as_f64) {
        Some(q) if q.is_finite() && q > 0.0 => q,
        _ => 1.0,
    };

    let price = item
        .get("price")
        .and_then(Value::as_f64)
        .filter(|p| p.is_finite() && *p >= 0.0);

    Some(ExtractedItem {
        product_name,
        quantity,
        unit: non_empty_string(item.get("unit")),
        price,
    })
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_defaults_to_one() {
        let input = json!({
            "items": [
                {"product_name": "Rice"},
                {"product_name": "Dal", "quantity": -4},
                {"product_name": "Atta", "quantity": "two"},
            ],
            "confidence": 0.9
        });
        let order = coerce_single(&input);
        assert_eq!(order.items.len(), 3);
        assert!(order.items.iter().all(|i| i.quantity == 1.0));
    }

    #[test]
    fn price_is_never_invented() {
        let input = json!({
            "items": [
                {"product_name": "Rice", "quantity": 5},
                {"product_name": "Dal", "quantity": 2, "price": 95.0},
            ],
            "confidence": 0.9
        });
        let order = coerce_single(&input);
        assert_eq!(order.items[0].price, None);
        assert_eq!(order.items[1].price, Some(95.0));
    }

    #[test]
    fn numeric_confidence_is_clamped() {
        let over = coerce_single(&json!({"items": [], "confidence": 3.2}));
        assert_eq!(over.confidence, ExtractionConfidence::Score(1.0));

        let under = coerce_single(&json!({"items": [], "confidence": -0.4}));
        assert_eq!(under.confidence, ExtractionConfidence::Score(0.0));

        let missing = coerce_single(&json!({"items": []}));
        assert_eq!(missing.confidence, ExtractionConfidence::Score(0.5));
    }

    #[test]
    fn unknown_level_falls_back_to_medium() {
        let order = coerce_chat(&json!({"items": [], "confidence": "certain"}));
        assert_eq!(order.confidence, ExtractionConfidence::Level("medium".into()));

        let order = coerce_chat(&json!({"items": [], "confidence": "HIGH"}));
        assert_eq!(order.confidence, ExtractionConfidence::Level("high".into()));
    }

    #[test]
    fn items_without_name_are_dropped() {
        let input = json!({
            "items": [{"quantity": 2}, {"product_name": "", "quantity": 1}, {"product_name": "Dal"}],
            "confidence": "high"
        });
        let order = coerce_chat(&input);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].product_name, "Dal");
    }

    #[test]
    fn raw_payload_is_preserved_verbatim() {
        let input = json!({"items": [], "confidence": "high", "extra_field": {"a": 1}});
        let order = coerce_chat(&input);
        assert_eq!(order.raw, input);
    }
}

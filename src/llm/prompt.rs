//! System prompts, tool schemas and context-window discipline.

use serde_json::{json, Value};

use crate::shared::models::ChatMessage;

pub const EXTRACTION_TOOL_NAME: &str = "record_order";

/// Character budget for a chat transcript. Older messages beyond the budget
/// are dropped from the prompt but kept in the order's raw_messages audit copy.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 12_000;

pub const SINGLE_MESSAGE_SYSTEM_PROMPT: &str = "\
You extract structured order data from a single customer message sent to a \
small business. Messages are informal and often code-mixed (Hindi, Hinglish, \
regional languages, English). Identify the ordered items with quantities, \
units and any stated prices, plus delivery details if present. Do not invent \
prices the customer never stated. Report a confidence score between 0 and 1 \
for the extraction as a whole. Always respond through the record_order tool.";

pub const CHAT_SYSTEM_PROMPT: &str = "\
You extract structured order data from a chat conversation between a customer \
and a small business. Messages are informal and often code-mixed (Hindi, \
Hinglish, regional languages, English). Later messages can correct earlier \
ones; extract the final intended order. Identify the customer's name from the \
senders, the ordered items with quantities, units and stated prices, and \
delivery details if present. Do not invent prices that were never stated. \
Report confidence as high, medium or low. Always respond through the \
record_order tool.";

fn item_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "product_name": { "type": "string" },
            "quantity": { "type": "number" },
            "unit": { "type": "string" },
            "price": { "type": "number", "description": "Per-unit price if stated, omit otherwise" }
        },
        "required": ["product_name"]
    })
}

pub fn single_message_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": { "type": "array", "items": item_schema() },
            "customer_name": { "type": "string" },
            "delivery_address": { "type": "string" },
            "delivery_date": { "type": "string" },
            "notes": { "type": "string" },
            "total_amount": { "type": "number" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": ["items", "confidence"]
    })
}

pub fn chat_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": { "type": "array", "items": item_schema() },
            "customer_name": { "type": "string" },
            "delivery_address": { "type": "string" },
            "delivery_date": { "type": "string" },
            "notes": { "type": "string" },
            "total_amount": { "type": "number" },
            "confidence": { "type": "string", "enum": ["high", "medium", "low"] }
        },
        "required": ["items", "confidence"]
    })
}

/// Sliding-window pruning: walk newest to oldest, keep messages until the
/// character budget would be exceeded, and return the kept slice in
/// chronological order.
pub fn prune_messages(messages: &[ChatMessage], max_chars: usize) -> Vec<&ChatMessage> {
    let mut kept = Vec::new();
    let mut used = 0usize;

    for message in messages.iter().rev() {
        let cost = message.sender.chars().count() + message.text.chars().count() + 3;
        if used + cost > max_chars {
            break;
        }
        used += cost;
        kept.push(message);
    }

    kept.reverse();
    kept
}

pub fn render_transcript(messages: &[&ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.sender);
        out.push_str(": ");
        out.push_str(&message.text);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sender: &str, text: &str) -> ChatMessage {
        ChatMessage {
            sender: sender.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn pruning_keeps_newest_first() {
        let messages: Vec<ChatMessage> = (0..10)
            .map(|i| msg("Rahul", &format!("message number {i} padded out to length")))
            .collect();
        let per_message = messages[0].sender.chars().count()
            + messages[0].text.chars().count()
            + 3;

        let kept = prune_messages(&messages, per_message * 3);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].text.contains("number 7"));
        assert!(kept[2].text.contains("number 9"));
    }

    #[test]
    fn pruning_no_op_under_budget() {
        let messages = vec![msg("A", "short"), msg("B", "also short")];
        let kept = prune_messages(&messages, DEFAULT_MAX_PROMPT_CHARS);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn pruning_drops_everything_when_budget_tiny() {
        let messages = vec![msg("Rahul", "5 kilo basmati rice chahiye")];
        assert!(prune_messages(&messages, 4).is_empty());
    }

    #[test]
    fn transcript_rendering() {
        let messages = vec![msg("Rahul", "5 kg rice"), msg("Rahul", "2 kg dal")];
        let refs: Vec<&ChatMessage> = messages.iter().collect();
        assert_eq!(render_transcript(&refs), "Rahul: 5 kg rice\nRahul: 2 kg dal\n");
    }

    #[test]
    fn schemas_require_items_and_confidence() {
        for schema in [single_message_tool_schema(), chat_tool_schema()] {
            let required = schema["required"].as_array().unwrap();
            assert!(required.iter().any(|v| v == "items"));
            assert!(required.iter().any(|v| v == "confidence"));
        }
    }
}

//! Outgoing-response PII redaction.
//!
//! JSON response bodies are walked depth-first before transmission. String
//! values under sensitive keys are masked outright; remaining strings are
//! scanned for data patterns (each with its own replacement token) and for
//! phone numbers, which are only replaced when they validate against a
//! fixed region table. Callers holding `view_pii` bypass the walk; any
//! failure during permission resolution redacts.

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        Request, StatusCode,
    },
    middleware::Next,
    response::Response,
};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::warn;

use super::auth::AuthContext;
use super::permissions::{has_permission, Permission};
use crate::shared::state::AppState;

pub const REDACTED: &str = "[REDACTED]";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Field names whose string values are masked outright. Compared after
/// normalization (lowercased, separators stripped), so `customerName`,
/// `customer_name` and `customer-name` all match.
const SENSITIVE_KEYS: &[&str] = &[
    "customername",
    "phone",
    "phonenumber",
    "mobile",
    "email",
    "emailaddress",
    "address",
    "deliveryaddress",
    "gstnumber",
    "gstin",
    "aadhaar",
    "aadhaarnumber",
    "pan",
    "pannumber",
    "cvv",
    "password",
    "secret",
    "token",
    "apikey",
    "accesstoken",
    "authorization",
];

fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_KEYS.contains(&normalized.as_str())
}

/// Pattern table, applied in order. GST runs before PAN (a GSTIN embeds a
/// PAN) and cards before Aadhaar (a 16-digit card embeds a 12-digit run).
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            "[EMAIL REDACTED]",
        ),
        (
            Regex::new(r"\b\d{2}[A-Z]{5}\d{4}[A-Z][0-9A-Z]Z[0-9A-Z]\b").unwrap(),
            "[GST REDACTED]",
        ),
        (
            Regex::new(r"\b[A-Z]{5}\d{4}[A-Z]\b").unwrap(),
            "[PAN REDACTED]",
        ),
        (
            Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").unwrap(),
            "[CARD REDACTED]",
        ),
        (
            Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
            "[AADHAAR REDACTED]",
        ),
        (
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            "[SSN REDACTED]",
        ),
        (
            Regex::new(r"\b[A-CEGHJ-PR-TW-Z]{2}\s?\d{2}\s?\d{2}\s?\d{2}\s?[A-D]\b").unwrap(),
            "[NI REDACTED]",
        ),
        (
            Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b")
                .unwrap(),
            "[IP REDACTED]",
        ),
    ]
});

static PHONE_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?[\d\s\-()]{7,20}").unwrap());

/// Semantic phone validation over the supported regions. A candidate is only
/// redacted when some region's numbering plan accepts it.
fn is_valid_phone(candidate: &str) -> bool {
    let digits: String = candidate.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return false;
    }

    if candidate.trim_start().starts_with('+') {
        // Longer country codes first so "+91..." is never read as "+9 1...".
        let rules: [(&str, fn(&str) -> bool); 8] = [
            ("91", india_national),
            ("44", uk_from_cc),
            ("61", australia_from_cc),
            ("49", germany_from_cc),
            ("33", france_from_cc),
            ("81", japan_from_cc),
            ("65", singapore_national),
            ("1", north_america_national),
        ];
        return rules.iter().any(|(cc, rule)| {
            digits
                .strip_prefix(cc)
                .map(|national| rule(national))
                .unwrap_or(false)
        });
    }

    india_national(&digits)
        || north_america_national(&digits)
        || uk_national(&digits)
        || australia_national(&digits)
        || germany_national(&digits)
        || france_national(&digits)
        || japan_national(&digits)
        || singapore_national(&digits)
}

fn nth(digits: &str, index: usize) -> u8 {
    digits.as_bytes().get(index).map(|b| b - b'0').unwrap_or(255)
}

fn india_national(d: &str) -> bool {
    d.len() == 10 && (6..=9).contains(&nth(d, 0))
}

fn north_america_national(d: &str) -> bool {
    d.len() == 10 && (2..=9).contains(&nth(d, 0)) && (2..=9).contains(&nth(d, 3))
}

fn uk_national(d: &str) -> bool {
    (d.len() == 10 || d.len() == 11) && nth(d, 0) == 0 && matches!(nth(d, 1), 1 | 2 | 3 | 7 | 8)
}

fn uk_from_cc(d: &str) -> bool {
    d.len() == 10 && matches!(nth(d, 0), 1 | 2 | 3 | 7 | 8)
}

fn australia_national(d: &str) -> bool {
    d.len() == 10 && nth(d, 0) == 0 && matches!(nth(d, 1), 2 | 3 | 4 | 7 | 8)
}

fn australia_from_cc(d: &str) -> bool {
    d.len() == 9 && matches!(nth(d, 0), 2 | 3 | 4 | 7 | 8)
}

fn germany_national(d: &str) -> bool {
    (10..=12).contains(&d.len()) && nth(d, 0) == 0 && nth(d, 1) != 0
}

fn germany_from_cc(d: &str) -> bool {
    (9..=11).contains(&d.len()) && nth(d, 0) != 0
}

fn france_national(d: &str) -> bool {
    d.len() == 10 && nth(d, 0) == 0 && (1..=9).contains(&nth(d, 1))
}

fn france_from_cc(d: &str) -> bool {
    d.len() == 9 && (1..=9).contains(&nth(d, 0))
}

fn japan_national(d: &str) -> bool {
    (d.len() == 10 || d.len() == 11) && nth(d, 0) == 0 && nth(d, 1) != 0
}

fn japan_from_cc(d: &str) -> bool {
    (9..=10).contains(&d.len()) && nth(d, 0) != 0
}

fn singapore_national(d: &str) -> bool {
    d.len() == 8 && matches!(nth(d, 0), 6 | 8 | 9)
}

/// Value-based scan of one string: data patterns first, then phone numbers.
pub fn scrub_string(input: &str) -> String {
    let mut out = input.to_string();
    for (pattern, replacement) in PATTERNS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out = PHONE_CANDIDATE
        .replace_all(&out, |caps: &regex::Captures| {
            let candidate = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if is_valid_phone(candidate) {
                "[PHONE REDACTED]".to_string()
            } else {
                candidate.to_string()
            }
        })
        .into_owned();
    out
}

/// Depth-first redaction of an outgoing JSON document. The walk never
/// mutates the input; arrays are mapped, non-string primitives pass through.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let redacted = if val.is_string() && is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(val)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}

pub async fn pii_redaction_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let auth = request.extensions().get::<AuthContext>().cloned();
    let response = next.run(request).await;
    apply_redaction(&state, auth.as_ref(), response).await
}

async fn apply_redaction(
    state: &AppState,
    auth: Option<&AuthContext>,
    response: Response,
) -> Response {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return response;
    }

    // The bypass requires a resolved user with view_pii; api-key callers
    // carry no user and are always redacted.
    if let Some(ctx) = auth {
        if let (Some(user_id), Some(org_id)) = (ctx.user_id.as_deref(), ctx.org_id) {
            if has_permission(&state.conn, user_id, org_id, Permission::ViewPii).await {
                return response;
            }
        }
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("failed to buffer response for redaction: {err}");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default();
        }
    };

    let output = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => serde_json::to_vec(&redact_value(&value)).unwrap_or_else(|_| bytes.to_vec()),
        Err(_) => bytes.to_vec(),
    };

    parts.headers.remove(CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_are_masked_regardless_of_casing() {
        let input = json!({
            "customer_name": "Rahul Sharma",
            "customerName": "Rahul Sharma",
            "phone": "+91 98765 43210",
            "gst_number": "29ABCDE1234F1Z5",
            "total": 790
        });
        let output = redact_value(&input);
        assert_eq!(output["customer_name"], REDACTED);
        assert_eq!(output["customerName"], REDACTED);
        assert_eq!(output["phone"], REDACTED);
        assert_eq!(output["gst_number"], REDACTED);
        assert_eq!(output["total"], 790);
    }

    #[test]
    fn walk_covers_arrays_and_nesting() {
        let input = json!({
            "orders": [
                {"customer": {"email": "a@b.com", "note": "call me at +919876543210"}},
                {"customer": {"email": "c@d.com"}}
            ]
        });
        let output = redact_value(&input);
        assert_eq!(output["orders"][0]["customer"]["email"], REDACTED);
        assert_eq!(output["orders"][1]["customer"]["email"], REDACTED);
        assert_eq!(
            output["orders"][0]["customer"]["note"],
            "call me at [PHONE REDACTED]"
        );
    }

    #[test]
    fn original_value_is_not_mutated() {
        let input = json!({"email": "a@b.com"});
        let snapshot = input.clone();
        let _ = redact_value(&input);
        assert_eq!(input, snapshot);
    }

    #[test]
    fn primitives_and_null_pass_through() {
        let input = json!({"count": 5, "ok": true, "missing": null});
        assert_eq!(redact_value(&input), input);
    }

    #[test]
    fn pattern_tokens_are_type_specific() {
        assert_eq!(
            scrub_string("reach me at rahul@example.com"),
            "reach me at [EMAIL REDACTED]"
        );
        assert_eq!(scrub_string("pan ABCDE1234F"), "pan [PAN REDACTED]");
        assert_eq!(
            scrub_string("gstin 29ABCDE1234F1Z5"),
            "gstin [GST REDACTED]"
        );
        assert_eq!(
            scrub_string("card 4111 1111 1111 1111"),
            "card [CARD REDACTED]"
        );
        assert_eq!(
            scrub_string("aadhaar 1234 5678 9012"),
            "aadhaar [AADHAAR REDACTED]"
        );
        assert_eq!(scrub_string("ssn 123-45-6789"), "ssn [SSN REDACTED]");
        assert_eq!(scrub_string("server 10.0.0.3"), "server [IP REDACTED]");
    }

    #[test]
    fn gst_wins_over_embedded_pan() {
        let output = scrub_string("29ABCDE1234F1Z5");
        assert_eq!(output, "[GST REDACTED]");
    }

    #[test]
    fn phones_need_a_region_to_accept_them() {
        assert!(is_valid_phone("+91 98765 43210"));
        assert!(is_valid_phone("9876543210"));
        assert!(is_valid_phone("(212) 555-0198"));
        assert!(is_valid_phone("+44 7911 123456"));
        assert!(is_valid_phone("+65 9123 4567"));

        assert!(!is_valid_phone("12345"));
        assert!(!is_valid_phone("0000000000"));
        assert!(!is_valid_phone("1111111"));
    }

    #[test]
    fn invalid_digit_runs_stay_untouched() {
        assert_eq!(scrub_string("order 42 for 5 kilo"), "order 42 for 5 kilo");
        assert_eq!(scrub_string("invoice 2026 03"), "invoice 2026 03");
    }
}

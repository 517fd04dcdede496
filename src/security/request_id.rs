//! Correlation ID propagation.
//!
//! Every request carries a correlation ID: taken from `X-Correlation-Id`
//! when the caller supplies a valid one, freshly minted otherwise. The ID
//! lives in request extensions as a value (never a thread-local), is echoed
//! on the response, and wraps the request in a tracing span so every log
//! line emitted underneath carries it. Handlers copy it into job payloads;
//! workers re-open a span with the same ID.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Debug, Clone)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub async fn correlation_middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_correlation_id(v))
        .map(CorrelationId::from_value)
        .unwrap_or_default();

    request.extensions_mut().insert(correlation.clone());

    let span = info_span!("request", correlation_id = %correlation);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(correlation.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
    response
}

fn is_valid_correlation_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 128 {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Correlation ID for the current request, or the `no-context` marker when
/// called outside one.
pub fn correlation_or_default(extension: Option<&CorrelationId>) -> String {
    extension
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| "no-context".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn echo_handler(Extension(correlation): Extension<CorrelationId>) -> String {
        correlation.into_inner()
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo_handler))
            .layer(middleware::from_fn(correlation_middleware))
    }

    #[tokio::test]
    async fn incoming_header_is_propagated() {
        let request = Request::builder()
            .uri("/")
            .header(CORRELATION_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            "abc-123"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc-123");
    }

    #[tokio::test]
    async fn missing_header_mints_a_uuid() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();

        let header = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header).is_ok());
    }

    #[tokio::test]
    async fn invalid_header_is_replaced() {
        let request = Request::builder()
            .uri("/")
            .header(CORRELATION_ID_HEADER, "has spaces<script>")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        let header = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header).is_ok());
    }

    #[test]
    fn validation_rules() {
        assert!(is_valid_correlation_id("abc-123_x.y"));
        assert!(!is_valid_correlation_id(""));
        assert!(!is_valid_correlation_id("with space"));
        assert!(!is_valid_correlation_id(&"a".repeat(200)));
    }

    #[test]
    fn default_marker_outside_requests() {
        assert_eq!(correlation_or_default(None), "no-context");
        let id = CorrelationId::from_value("xyz");
        assert_eq!(correlation_or_default(Some(&id)), "xyz");
    }
}

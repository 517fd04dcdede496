use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;

/// Every failure a handler can surface. Handlers return `Result<_, ApiError>`
/// and let the error bubble here; this is the only place a kind is mapped to
/// an HTTP status and a response body.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    ValidationDetailed(String, Vec<String>),
    Unauthenticated(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    RateLimited { retry_after_secs: u64 },
    UpstreamBadRequest(String),
    UpstreamUnavailable(String),
    ExtractionMalformed(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ValidationDetailed(..) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamBadRequest(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExtractionMalformed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. 4xx errors carry the actionable detail; 5xx
    /// errors get a generic line and the detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::ValidationDetailed(msg, _) => msg.clone(),
            Self::Unauthenticated(msg) => msg.clone(),
            Self::Forbidden(msg) => msg.clone(),
            Self::NotFound(msg) => msg.clone(),
            Self::Conflict(msg) => msg.clone(),
            Self::RateLimited { .. } => "Too many requests".to_string(),
            Self::UpstreamBadRequest(_) => "Upstream service rejected the request".to_string(),
            Self::UpstreamUnavailable(_) => "Upstream service unavailable".to_string(),
            Self::ExtractionMalformed(_) => "Extraction failed".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::ValidationDetailed(msg, errors) => {
                write!(f, "validation: {msg} ({})", errors.join("; "))
            }
            Self::Unauthenticated(msg) => write!(f, "unauthenticated: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            Self::UpstreamBadRequest(msg) => write!(f, "upstream bad request: {msg}"),
            Self::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::ExtractionMalformed(msg) => write!(f, "extraction malformed: {msg}"),
            Self::Internal(err) => write!(f, "internal: {err}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!("{self}");
        }

        let mut body = json!({
            "status": status.as_u16(),
            "message": self.public_message(),
        });
        if let Self::ValidationDetailed(_, errors) = &self {
            body["errors"] = json!(errors);
        }
        // Development builds surface the underlying failure; release builds
        // keep it in the logs.
        #[cfg(debug_assertions)]
        if status.is_server_error() {
            body["detail"] = json!(self.to_string());
        }

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(err: r2d2::Error) -> Self {
        Self::Internal(anyhow::Error::new(err).context("database pool"))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::Error::new(err).context("blocking task"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(ApiError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::UpstreamBadRequest("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::UpstreamUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::ExtractionMalformed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn server_errors_hide_detail() {
        let err = ApiError::Internal(anyhow::anyhow!("pool exhausted at 10.0.0.3"));
        assert_eq!(err.public_message(), "Internal server error");

        let err = ApiError::NotFound("Order not found".into());
        assert_eq!(err.public_message(), "Order not found");
    }
}

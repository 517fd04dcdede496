pub mod api_keys;
pub mod auth;
pub mod jwks;
pub mod permissions;
pub mod pii;
pub mod rate_limiter;
pub mod request_id;

pub use auth::{auth_middleware, AuthContext, OrgContext};
pub use jwks::JwksCache;
pub use pii::pii_redaction_middleware;
pub use rate_limiter::{rate_limit_middleware, TierRateLimiter};
pub use request_id::{correlation_middleware, CorrelationId, CORRELATION_ID_HEADER};

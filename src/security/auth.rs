//! Dual-path authentication.
//!
//! Requests authenticate either with an organization API key (configured
//! header, SHA-256 lookup) or a bearer token verified against the identity
//! provider. The key path wins when both are present. Bearer users are
//! provisioned just-in-time on first sight.

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, Request},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use diesel::prelude::*;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::api_keys::hash_api_key;
use crate::shared::error::ApiError;
use crate::shared::models::{schema, ApiKeyRow, User};
use crate::shared::state::{AppState, DbPool};

/// Identity resolved for the request; inserted into request extensions by
/// the auth middleware.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub org_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub api_key_id: Option<Uuid>,
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let header_name = state.config.auth.api_key_header.clone();

    if let Some(value) = request.headers().get(&header_name) {
        let raw = value
            .to_str()
            .map_err(|_| ApiError::Unauthenticated("Invalid API key".into()))?;
        let key = authenticate_api_key(&state.conn, raw).await?;
        debug!(org_id = %key.organization_id, "authenticated via api key");
        request.extensions_mut().insert(AuthContext {
            org_id: Some(key.organization_id),
            user_id: None,
            api_key_id: Some(key.id),
        });
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthenticated("Missing credentials".into()))?
        .to_string();

    let claims = state
        .jwks
        .verify(&token)
        .await
        .map_err(|err| ApiError::Unauthenticated(format!("Invalid token: {err}")))?;

    let user = provision_user(&state.conn, claims.sub, claims.email, claims.name).await?;
    debug!(user_id = %user.id, "authenticated via bearer token");
    request.extensions_mut().insert(AuthContext {
        org_id: user.organization_id,
        user_id: Some(user.id),
        api_key_id: None,
    });
    Ok(next.run(request).await)
}

/// Hashes the presented secret and looks up an active key, touching
/// `last_used_at` on the way through.
async fn authenticate_api_key(pool: &DbPool, raw: &str) -> Result<ApiKeyRow, ApiError> {
    let hash = hash_api_key(raw);
    let pool = pool.clone();

    let row = tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRow>, anyhow::Error> {
        use schema::api_keys::dsl::*;
        let mut conn = pool.get()?;
        let row = diesel::update(api_keys.filter(key_hash.eq(&hash)).filter(is_active.eq(true)))
            .set(last_used_at.eq(Some(Utc::now())))
            .get_result::<ApiKeyRow>(&mut conn)
            .optional()?;
        Ok(row)
    })
    .await??;

    row.ok_or_else(|| ApiError::Unauthenticated("Invalid API key".into()))
}

/// JIT provisioning: mirror the identity provider's subject into the users
/// table on first sight, reuse the row afterwards.
async fn provision_user(
    pool: &DbPool,
    sub: String,
    email: String,
    display_name: Option<String>,
) -> Result<User, ApiError> {
    let pool = pool.clone();

    let user = tokio::task::spawn_blocking(move || -> Result<User, anyhow::Error> {
        use schema::users::dsl::{id, users};
        let mut conn = pool.get()?;

        if let Some(existing) = users
            .filter(id.eq(&sub))
            .first::<User>(&mut conn)
            .optional()?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let fresh = User {
            id: sub,
            email,
            name: display_name,
            organization_id: None,
            role: None,
            created_at: now,
            updated_at: now,
        };
        let inserted = diesel::insert_into(users)
            .values(&fresh)
            .get_result::<User>(&mut conn)?;
        Ok(inserted)
    })
    .await??;

    Ok(user)
}

/// Extractor for endpoints that need tenant context. Rejects with 403 when
/// the authenticated identity carries no organization.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub org_id: Uuid,
    pub user_id: Option<String>,
}

impl<S> FromRequestParts<S> for OrgContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthenticated("Missing credentials".into()))?;

        let org_id = auth
            .org_id
            .ok_or_else(|| ApiError::Forbidden("Organization context required".into()))?;

        Ok(Self {
            org_id,
            user_id: auth.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn org_context_requires_auth() {
        let request = axum::http::Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        let err = OrgContext::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn org_context_requires_org() {
        let request = axum::http::Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        parts.extensions.insert(AuthContext {
            org_id: None,
            user_id: Some("user-1".into()),
            api_key_id: None,
        });
        let err = OrgContext::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn org_context_resolves() {
        let org = Uuid::new_v4();
        let request = axum::http::Request::builder().body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        parts.extensions.insert(AuthContext {
            org_id: Some(org),
            user_id: None,
            api_key_id: Some(Uuid::new_v4()),
        });
        let ctx = OrgContext::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ctx.org_id, org);
        assert_eq!(ctx.user_id, None);
    }
}

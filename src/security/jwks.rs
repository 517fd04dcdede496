//! Bearer-token verification against the identity provider's JWKS.
//!
//! Keys are fetched lazily on first use and cached; an unknown `kid`
//! triggers one refresh before the token is rejected.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::shared::config::AuthConfig;

#[derive(Debug, Clone)]
pub struct IdentityClaims {
    pub sub: String,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

pub struct JwksCache {
    jwks_url: String,
    audience: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwksCache {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            jwks_url: config.jwks_url.clone(),
            audience: config.audience.clone(),
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    async fn refresh(&self) -> Result<()> {
        debug!("fetching JWKS from {}", self.jwks_url);
        let document: JwksDocument = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .context("jwks fetch failed")?
            .error_for_status()
            .context("jwks endpoint returned error")?
            .json()
            .await
            .context("jwks body is not valid json")?;

        let mut keys = self.keys.write().await;
        keys.clear();
        for jwk in document.keys {
            if jwk.kty != "RSA" || jwk.kid.is_empty() {
                continue;
            }
            if let Ok(key) = DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                keys.insert(jwk.kid, key);
            }
        }
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        self.refresh().await?;

        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| anyhow!("no JWKS key with kid {kid:?}"))
    }

    pub async fn verify(&self, token: &str) -> Result<IdentityClaims> {
        let header = decode_header(token).context("token header unparseable")?;
        let kid = header.kid.ok_or_else(|| anyhow!("token has no kid"))?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);

        let data =
            decode::<TokenClaims>(token, &key, &validation).context("token verification failed")?;

        Ok(IdentityClaims {
            email: data
                .claims
                .email
                .unwrap_or_else(|| format!("{}@unknown.local", data.claims.sub)),
            sub: data.claims.sub,
            name: data.claims.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> JwksCache {
        JwksCache::new(&AuthConfig {
            audience: "orderserver".into(),
            jwks_url: "http://127.0.0.1:1/jwks.json".into(),
            api_key_header: "x-api-key".into(),
        })
    }

    #[tokio::test]
    async fn garbage_token_is_rejected_before_any_fetch() {
        let err = cache().verify("not-a-jwt").await.unwrap_err();
        assert!(err.to_string().contains("header"));
    }

    #[tokio::test]
    async fn token_without_kid_is_rejected() {
        // HS256 token with no kid in the header.
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({"sub": "u1", "exp": 4102444800u64}),
            &jsonwebtoken::EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let err = cache().verify(&token).await.unwrap_err();
        assert!(err.to_string().contains("kid"));
    }
}

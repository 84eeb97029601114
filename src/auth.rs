//! API key authentication.
//!
//! Keys arrive as `Authorization: Bearer <key>` or `X-API-Key: <key>`,
//! are hashed (sha-256) and looked up through a short-TTL cache in front
//! of the durable store. The raw key never leaves this module.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::GatewayError;
use crate::models::ApiKey;
use crate::store::GatewayStore;

const KEY_CACHE_CAPACITY: u64 = 10_000;

/// Hex sha-256 of a raw key; the only form ever stored or compared.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short public fingerprint kept alongside the hash for supportability.
pub fn key_prefix(raw: &str) -> String {
    raw.chars().take(10).collect()
}

pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

pub struct Authenticator {
    store: Arc<dyn GatewayStore>,
    cache: moka::future::Cache<String, Option<Arc<ApiKey>>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn GatewayStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: moka::future::Cache::builder()
                .max_capacity(KEY_CACHE_CAPACITY)
                .time_to_live(cache_ttl)
                .build(),
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Arc<ApiKey>, GatewayError> {
        let token = extract_token(headers)
            .ok_or_else(|| GatewayError::Unauthorized("missing api key".into()))?;
        let hash = hash_key(&token);

        let store = Arc::clone(&self.store);
        let looked_up = self
            .cache
            .try_get_with(hash.clone(), async move {
                store
                    .key_by_hash(&hash)
                    .await
                    .map(|found| found.map(Arc::new))
            })
            .await
            .map_err(|err| GatewayError::StoreUnavailable(err.to_string()))?;

        let key = looked_up.ok_or_else(|| {
            debug!("api key not found");
            GatewayError::Unauthorized("invalid api key".into())
        })?;

        if !key.is_usable(Utc::now()) {
            return Err(GatewayError::Unauthorized(
                "api key is revoked, disabled or expired".into(),
            ));
        }
        Ok(key)
    }

    /// Drop a cached entry, e.g. after a budget reset touched the key.
    pub fn invalidate(&self, hash: &str) {
        let cache = self.cache.clone();
        let hash = hash.to_string();
        tokio::spawn(async move { cache.invalidate(&hash).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::key::KeyKind;
    use crate::store::MemoryGatewayStore;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn seeded() -> (Arc<MemoryGatewayStore>, Authenticator, String) {
        let raw = "sg-test-key-123456";
        let store = Arc::new(MemoryGatewayStore::new());
        store.upsert_key(ApiKey {
            id: Uuid::new_v4(),
            hash: hash_key(raw),
            prefix: key_prefix(raw),
            kind: KeyKind::Api,
            user_id: None,
            team_id: None,
            enabled: true,
            allowed_models: HashSet::new(),
            blocked_models: HashSet::new(),
            tpm: 0,
            rpm: 0,
            max_parallel: 0,
            max_budget: None,
            budget_period: None,
            expires_at: None,
            current_spend: 0.0,
            usage_count: 0,
            last_used_at: None,
            budget_reset_at: None,
            revoked_at: None,
        });
        let auth = Authenticator::new(
            store.clone() as Arc<dyn GatewayStore>,
            Duration::from_secs(60),
        );
        (store, auth, raw.to_string())
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn bearer_token_authenticates() {
        let (_, auth, raw) = seeded();
        let key = auth.authenticate(&bearer(&raw)).await.unwrap();
        assert_eq!(key.prefix, "sg-test-ke");
    }

    #[tokio::test]
    async fn x_api_key_header_authenticates() {
        let (_, auth, raw) = seeded();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", raw.parse().unwrap());
        assert!(auth.authenticate(&headers).await.is_ok());
    }

    #[tokio::test]
    async fn missing_and_unknown_tokens_are_unauthorized() {
        let (_, auth, _) = seeded();
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(GatewayError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.authenticate(&bearer("sg-wrong")).await,
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn revoked_key_is_rejected() {
        let (store, _, raw) = seeded();
        let mut key = store.key_by_hash(&hash_key(&raw)).await.unwrap().unwrap();
        key.revoked_at = Some(Utc::now());
        store.upsert_key(key);

        let auth = Authenticator::new(store as Arc<dyn GatewayStore>, Duration::from_secs(60));
        assert!(matches!(
            auth.authenticate(&bearer(&raw)).await,
            Err(GatewayError::Unauthorized(_))
        ));
    }
}

//! Authentication module

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use hookline_common::config::ApiKeyConfig;
use hookline_common::types::UserId;
use hookline_core::{BulkImporter, CampaignManager, DeliveryWorker};
use hookline_storage::repository::CampaignStore;
use hookline_storage::DatabasePool;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub campaigns: Arc<CampaignManager>,
    pub store: Arc<dyn CampaignStore>,
    pub worker: Arc<DeliveryWorker>,
    pub importer: Arc<BulkImporter>,
    pub api_keys: Vec<ApiKeyConfig>,
    /// Present when running against PostgreSQL
    pub db_pool: Option<DatabasePool>,
}

/// Authenticated context extracted from API key
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The user this API key acts as
    pub user_id: UserId,
    /// Key label for audit logging
    pub key_name: String,
}

/// Extract API key from request
pub fn extract_api_key(req: &Request) -> Option<&str> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(key) = auth_str.strip_prefix("Bearer ") {
                return Some(key.trim());
            }
        }
    }

    if let Some(key) = req.headers().get("x-api-key") {
        if let Ok(key_str) = key.to_str() {
            return Some(key_str);
        }
    }

    None
}

/// Hash an API key for comparison
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Find the configured key matching `api_key`
fn validate_api_key<'a>(keys: &'a [ApiKeyConfig], api_key: &str) -> Option<&'a ApiKeyConfig> {
    let hash = hash_api_key(api_key);
    keys.iter()
        .find(|k| k.key_hash.eq_ignore_ascii_case(&hash))
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing API key in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    let key = validate_api_key(&state.api_keys, api_key).ok_or_else(|| {
        warn!("Unknown API key in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    debug!("API key '{}' authenticated for user {}", key.name, key.user_id);

    let auth_context = AuthContext {
        user_id: key.user_id,
        key_name: key.name.clone(),
    };
    request.extensions_mut().insert(auth_context);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_validate_api_key() {
        let user_id = Uuid::new_v4();
        let keys = vec![ApiKeyConfig {
            name: "ops".to_string(),
            key_hash: hash_api_key("hl_live_key").to_uppercase(),
            user_id,
        }];

        let key = validate_api_key(&keys, "hl_live_key").unwrap();
        assert_eq!(key.user_id, user_id);
        assert!(validate_api_key(&keys, "hl_other_key").is_none());
        assert!(validate_api_key(&[], "hl_live_key").is_none());
    }

    #[test]
    fn test_hash_api_key() {
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

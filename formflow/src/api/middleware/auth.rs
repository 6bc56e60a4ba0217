//! Admin API authentication.
//!
//! Mutating endpoints are driven by a dashboard, so every request must be
//! authenticated (known API key), fresh (timestamp within the replay window)
//! and unique (single-use nonce bound into a SHA-256 signature). A replayed
//! capture fails on the nonce even when it is still fresh.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::config::ApiConfig;

const HEADER_API_KEY: &str = "x-api-key";
const HEADER_TIMESTAMP: &str = "x-auth-timestamp";
const HEADER_NONCE: &str = "x-auth-nonce";
const HEADER_SIGNATURE: &str = "x-auth-signature";

/// Prune the nonce cache once it grows past this many entries.
const NONCE_PRUNE_THRESHOLD: usize = 4096;

/// Authentication state shared across requests.
#[derive(Clone)]
pub struct AdminAuth {
    api_keys: Arc<Vec<String>>,
    replay_window_secs: i64,
    seen_nonces: Arc<DashMap<String, i64>>,
}

impl AdminAuth {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            api_keys: Arc::new(config.api_keys.clone()),
            replay_window_secs: config.replay_window_secs,
            seen_nonces: Arc::new(DashMap::new()),
        }
    }

    fn is_known_key(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }

    /// Record a nonce; false if it was already used.
    fn record_nonce(&self, nonce: &str, now: i64) -> bool {
        if self.seen_nonces.len() > NONCE_PRUNE_THRESHOLD {
            let horizon = now - 2 * self.replay_window_secs;
            self.seen_nonces.retain(|_, seen_at| *seen_at > horizon);
        }
        self.seen_nonces
            .insert(nonce.to_string(), now)
            .is_none()
    }

    fn verify(&self, request: &Request, now: i64) -> Result<(), ApiError> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ApiError::unauthorized(format!("missing {name} header")))
        };

        let api_key = header(HEADER_API_KEY)?;
        if !self.is_known_key(api_key) {
            tracing::warn!("rejected request with unknown API key");
            return Err(ApiError::unauthorized("unknown API key"));
        }

        let timestamp: i64 = header(HEADER_TIMESTAMP)?
            .parse()
            .map_err(|_| ApiError::unauthorized("malformed timestamp"))?;
        if (now - timestamp).abs() > self.replay_window_secs {
            return Err(ApiError::unauthorized("request timestamp outside window"));
        }

        // Signatures are computed over the full request path. Nested routers
        // see a stripped URI, so prefer the original one when present.
        let path = request
            .extensions()
            .get::<axum::extract::OriginalUri>()
            .map(|uri| uri.0.path().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        let nonce = header(HEADER_NONCE)?;
        let signature = header(HEADER_SIGNATURE)?;
        let expected = sign(api_key, timestamp, nonce, request.method().as_str(), &path);
        if signature != expected {
            tracing::warn!("rejected request with bad signature");
            return Err(ApiError::unauthorized("bad request signature"));
        }

        if !self.record_nonce(nonce, now) {
            tracing::warn!("rejected replayed request nonce");
            return Err(ApiError::unauthorized("nonce already used"));
        }

        Ok(())
    }
}

/// Compute the request signature a caller must present.
pub fn sign(api_key: &str, timestamp: i64, nonce: &str, method: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{api_key}:{timestamp}:{nonce}:{method}:{path}"));
    hex::encode(hasher.finalize())
}

/// Middleware guarding the admin routes.
///
/// With no API keys configured the guard is a pass-through (local
/// development), matching how the API key check behaves elsewhere.
pub async fn require_signed(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if auth.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }

    auth.verify(&request, chrono::Utc::now().timestamp())?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with_key(key: &str) -> AdminAuth {
        AdminAuth::new(&ApiConfig {
            bind_addr: String::new(),
            api_keys: vec![key.to_string()],
            replay_window_secs: 300,
        })
    }

    fn signed_request(key: &str, timestamp: i64, nonce: &str) -> Request {
        let signature = sign(key, timestamp, nonce, "POST", "/api/engine/force-process");
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/engine/force-process")
            .header(HEADER_API_KEY, key)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_NONCE, nonce)
            .header(HEADER_SIGNATURE, signature)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[test]
    fn test_valid_request_accepted_once() {
        let auth = auth_with_key("k1");
        let now = chrono::Utc::now().timestamp();
        let request = signed_request("k1", now, "nonce-1");

        assert!(auth.verify(&request, now).is_ok());
        // Same nonce again: replay.
        let replay = signed_request("k1", now, "nonce-1");
        assert!(auth.verify(&replay, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let auth = auth_with_key("k1");
        let now = chrono::Utc::now().timestamp();
        let request = signed_request("k1", now - 600, "nonce-2");
        assert!(auth.verify(&request, now).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let auth = auth_with_key("k1");
        let now = chrono::Utc::now().timestamp();
        let request = signed_request("other", now, "nonce-3");
        assert!(auth.verify(&request, now).is_err());
    }

    #[test]
    fn test_tampered_path_rejected() {
        let auth = auth_with_key("k1");
        let now = chrono::Utc::now().timestamp();
        let signature = sign("k1", now, "nonce-4", "POST", "/some/other/path");
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/engine/force-process")
            .header(HEADER_API_KEY, "k1")
            .header(HEADER_TIMESTAMP, now.to_string())
            .header(HEADER_NONCE, "nonce-4")
            .header(HEADER_SIGNATURE, signature)
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(auth.verify(&request, now).is_err());
    }
}

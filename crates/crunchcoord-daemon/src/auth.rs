// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! API-key gating for the reporting surface.
//!
//! Three tiers: public prefixes never require a key, admin prefixes always
//! do, and everything else only when read auth is switched on. With no key
//! configured the whole surface is open.

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub read_auth: bool,
    pub public_prefixes: Vec<String>,
    pub admin_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Public,
    Admin,
    Read,
}

impl AuthConfig {
    /// Mutations under an admin prefix are admin; reads under the same
    /// prefix (checkpoint listings, emission payloads) stay read-tier.
    fn tier(&self, path: &str, method: &Method) -> Tier {
        if self.public_prefixes.iter().any(|p| path.starts_with(p)) {
            return Tier::Public;
        }
        let is_read_method = matches!(*method, Method::GET | Method::HEAD);
        if !is_read_method && self.admin_prefixes.iter().any(|p| path.starts_with(p)) {
            return Tier::Admin;
        }
        Tier::Read
    }

    /// Decide whether a request may pass given the key it presented.
    pub fn authorize(&self, path: &str, method: &Method, provided_key: Option<&str>) -> bool {
        let Some(api_key) = &self.api_key else {
            return true;
        };
        match self.tier(path, method) {
            Tier::Public => true,
            Tier::Admin => provided_key == Some(api_key.as_str()),
            Tier::Read => !self.read_auth || provided_key == Some(api_key.as_str()),
        }
    }
}

/// Key can arrive as `X-API-Key`, `Authorization: Bearer` or an `api_key`
/// query parameter.
fn extract_key(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("x-api-key") {
        if let Ok(key) = value.to_str() {
            return Some(key.to_string());
        }
    }
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(raw) = value.to_str() {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=").map(|key| key.to_string())
        })
    })
}

pub async fn api_key_middleware(
    State(auth): State<AuthConfig>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let provided = extract_key(&request);
    if auth.authorize(&path, &method, provided.as_deref()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {"code": "unauthorized", "message": "API key required"}
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: Option<&str>, read_auth: bool) -> AuthConfig {
        AuthConfig {
            api_key: api_key.map(str::to_string),
            read_auth,
            public_prefixes: vec!["/healthz".to_string(), "/reports/leaderboard".to_string()],
            admin_prefixes: vec!["/reports/backfill".to_string(), "/reports/checkpoints/".to_string()],
        }
    }

    #[test]
    fn open_when_no_key_configured() {
        let auth = config(None, true);
        assert!(auth.authorize("/reports/backfill", &Method::POST, None));
        assert!(auth.authorize("/reports/snapshots", &Method::GET, None));
    }

    #[test]
    fn admin_mutations_always_require_the_key() {
        let auth = config(Some("secret"), false);
        assert!(!auth.authorize("/reports/backfill", &Method::POST, None));
        assert!(!auth.authorize(
            "/reports/checkpoints/CKP_1/confirm",
            &Method::POST,
            Some("wrong")
        ));
        assert!(auth.authorize(
            "/reports/checkpoints/CKP_1/confirm",
            &Method::POST,
            Some("secret")
        ));
        assert!(auth.authorize(
            "/reports/checkpoints/CKP_1/status",
            &Method::PATCH,
            Some("secret")
        ));
    }

    #[test]
    fn reads_under_admin_prefixes_are_read_tier() {
        let auth = config(Some("secret"), false);
        // Emission payloads are read-only and stay open when read auth is
        // off, even though mutations on the same prefix are gated.
        assert!(auth.authorize("/reports/checkpoints/CKP_1/emission", &Method::GET, None));

        let gated = config(Some("secret"), true);
        assert!(!gated.authorize("/reports/checkpoints/CKP_1/emission", &Method::GET, None));
    }

    #[test]
    fn public_prefixes_stay_open() {
        let auth = config(Some("secret"), true);
        assert!(auth.authorize("/healthz", &Method::GET, None));
        assert!(auth.authorize("/reports/leaderboard", &Method::GET, None));
    }

    #[test]
    fn read_auth_gates_everything_else() {
        let open_reads = config(Some("secret"), false);
        assert!(open_reads.authorize("/reports/snapshots", &Method::GET, None));

        let gated_reads = config(Some("secret"), true);
        assert!(!gated_reads.authorize("/reports/snapshots", &Method::GET, None));
        assert!(gated_reads.authorize("/reports/snapshots", &Method::GET, Some("secret")));
    }
}

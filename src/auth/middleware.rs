//! Authentication middleware.
//!
//! Every route outside the public set requires a verified bearer in the
//! `x-hoot-token` header. The middleware attaches the derived tenant to the
//! request, enforces the origin allow-list and the per-tenant rate limit,
//! and appends one audit entry per authenticated request.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::rate_limit::{RouteFamily, TenantRateLimiter};
use super::token::TokenService;
use crate::audit::{AuditEntry, Outcome};
use crate::Error;

/// Header carrying the gateway bearer token.
pub const TOKEN_HEADER: &str = "x-hoot-token";

/// Routes reachable without a bearer: liveness, token issuance, public keys,
/// and the OAuth redirect target (the authorization server cannot send our
/// header).
const PUBLIC_PATHS: &[&str] = &[
    "/health",
    "/auth/token",
    "/.well-known/jwks.json",
    "/oauth/callback",
];

/// Tenant id extracted from a verified token, available as a request
/// extension to every handler behind the middleware.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

/// State consumed by [`auth_middleware`].
pub struct AuthState {
    /// Token verification service
    pub tokens: Arc<TokenService>,
    /// Per-tenant limiter
    pub limiter: Arc<TenantRateLimiter>,
    /// Exact-match origin allow-list
    pub allowed_origins: Vec<String>,
}

fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

/// Authentication middleware.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Origin allow-list applies to every route, public included.
    if let Some(origin) = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
    {
        if !auth.allowed_origins.iter().any(|o| o == origin) {
            warn!(origin = %origin, path = %path, "Origin rejected");
            return Error::OriginRejected(origin.to_string()).into_response();
        }
    }

    if is_public(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let token = match request.headers().get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => {
            return Error::TokenMissing.into_response();
        }
    };

    let tenant = match auth.tokens.verify(&token) {
        Ok(tenant) => tenant,
        Err(e) => {
            debug!(path = %path, error = %e, "Token verification failed");
            return e.into_response();
        }
    };

    if let Err(retry_after) = auth.limiter.check(&tenant, RouteFamily::from_path(&path)) {
        AuditEntry::request(&tenant, Outcome::Denied).emit();
        return Error::RateLimited { retry_after }.into_response();
    }

    request.extensions_mut().insert(Tenant(tenant.clone()));
    let response = next.run(request).await;

    let outcome = if response.status().is_success() {
        Outcome::Ok
    } else if response.status().is_client_error() {
        Outcome::Denied
    } else {
        Outcome::Error
    };
    AuditEntry::request(&tenant, outcome).emit();

    response
}

//! Shared helpers for integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use reqwest::Client;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use hoot_gateway::auth::middleware::AuthState;
use hoot_gateway::auth::{TenantRateLimiter, TokenService};
use hoot_gateway::cache::OriginCache;
use hoot_gateway::config::Config;
use hoot_gateway::filter::ToolFilter;
use hoot_gateway::gateway::{create_router, AppState};
use hoot_gateway::mcp::ClientManager;
use hoot_gateway::oauth::OAuthProvider;
use hoot_gateway::store::TenantStore;

/// Build a full router over a temp store with the given configuration.
/// The temp dir must stay alive for the duration of the test.
pub fn test_router_with(config: &Config) -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();

    let tokens = Arc::new(TokenService::from_config(&config.auth).unwrap());
    let store = Arc::new(TenantStore::new(dir.path().to_path_buf()).unwrap());
    let origins = Arc::new(OriginCache::new());
    let provider = Arc::new(
        OAuthProvider::new(
            Arc::clone(&store),
            Arc::clone(&origins),
            config.oauth.clone(),
            config.timeouts.oauth,
        )
        .unwrap(),
    );
    let http = Client::new();
    let manager = Arc::new(ClientManager::new(
        http.clone(),
        Arc::clone(&store),
        Arc::clone(&provider),
        config.timeouts.clone(),
    ));

    let state = Arc::new(AppState {
        tokens: Arc::clone(&tokens),
        manager,
        provider,
        filter: Arc::new(ToolFilter::new(&config.filter)),
        origins,
        store,
        http,
        timeouts: config.timeouts.clone(),
        allowed_origins: config.auth.allowed_origins.clone(),
        inflight: Arc::new(tokio::sync::Semaphore::new(100)),
    });

    let auth = Arc::new(AuthState {
        tokens,
        limiter: Arc::new(TenantRateLimiter::new(&config.limits)),
        allowed_origins: config.auth.allowed_origins.clone(),
    });

    (dir, create_router(state, auth))
}

/// Default-configured test router.
pub fn test_router() -> (TempDir, Router) {
    test_router_with(&Config::default())
}

/// One-shot a JSON request through the router.
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("x-hoot-token", token);
    }

    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    router.clone().oneshot(request).await.unwrap()
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Issue a gateway token for a fresh tenant; returns (tenant, token).
pub async fn issue_token(router: &Router) -> (String, String) {
    let tenant = uuid::Uuid::new_v4().to_string();
    let response = send(
        router,
        "POST",
        "/auth/token",
        None,
        Some(serde_json::json!({ "userId": tenant })),
    )
    .await;
    assert_eq!(response.status(), 200);

    let body = body_json(response).await;
    let token = body["token"].as_str().unwrap().to_string();
    (tenant, token)
}

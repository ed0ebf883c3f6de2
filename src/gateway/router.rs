//! HTTP router and handlers.
//!
//! Each handler is a short composition: auth (middleware) → validate →
//! delegate → map to HTTP. Error bodies are uniform
//! `{error, message, details?}`; an upstream that merely needs OAuth is not
//! an error — the client must act on the returned `authorizationUrl`.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderValue, Method},
    middleware,
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::audit::{AuditEntry, Outcome};
use crate::auth::middleware::{auth_middleware, AuthState, Tenant};
use crate::auth::TokenService;
use crate::cache::{resolve_favicon, OriginCache};
use crate::config::TimeoutConfig;
use crate::filter::{FilterOptions, ServerTools, ToolFilter};
use crate::filter::index::ChatMessage;
use crate::mcp::{auto_detect, ClientManager, ConnectRequest, Managed, TransportKind, UpstreamAuth};
use crate::oauth::{decode_state, OAuthProvider};
use crate::oauth::metadata::base_url;
use crate::store::{InvalidateScope, TenantStore};
use crate::{Error, Result};

/// Shared application state.
pub struct AppState {
    /// Token issuer/verifier
    pub tokens: Arc<TokenService>,
    /// MCP session manager
    pub manager: Arc<ClientManager>,
    /// OAuth client provider
    pub provider: Arc<OAuthProvider>,
    /// Tool filter index
    pub filter: Arc<ToolFilter>,
    /// Favicon / metadata cache
    pub origins: Arc<OriginCache>,
    /// Tenant store
    pub store: Arc<TenantStore>,
    /// Shared upstream HTTP client (probe, favicon)
    pub http: Client,
    /// Upstream deadlines
    pub timeouts: TimeoutConfig,
    /// Allowed frontend origins; the first is the default redirect target
    pub allowed_origins: Vec<String>,
    /// In-flight request tracker for graceful drain
    pub inflight: Arc<tokio::sync::Semaphore>,
}

/// Create the router with auth, CORS, and observability layers.
pub fn create_router(state: Arc<AppState>, auth: Arc<AuthState>) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/auth/token", post(issue_token))
        .route("/mcp/auto-detect", post(mcp_auto_detect))
        .route("/mcp/discover-oauth", post(mcp_discover_oauth))
        .route("/mcp/connect", post(mcp_connect))
        .route("/mcp/disconnect", post(mcp_disconnect))
        .route("/mcp/tools/{server_id}", get(mcp_tools))
        .route("/mcp/execute", post(mcp_execute))
        .route("/mcp/status/{server_id}", get(mcp_status))
        .route("/mcp/connections", get(mcp_connections))
        .route("/mcp/server-info/{server_id}", get(mcp_server_info))
        .route("/mcp/oauth-metadata/{server_id}", get(mcp_oauth_metadata))
        .route("/mcp/clear-oauth-tokens", post(mcp_clear_oauth_tokens))
        .route("/mcp/favicon", get(mcp_favicon))
        .route("/mcp/tool-filter/initialize", post(filter_initialize))
        .route("/mcp/tool-filter/filter", post(filter_filter))
        .route("/mcp/tool-filter/clear-cache", post(filter_clear_cache))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/oauth/callback", get(oauth_callback).post(oauth_callback))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_inflight,
        ))
        .layer(cors)
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-hoot-token"),
        ])
}

/// Parse a JSON body into a request type with a uniform validation error.
fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::Validation(e.to_string()))
}

/// Each in-flight request holds one drain permit; shutdown waits for all
/// permits to come back before closing upstream sessions.
async fn track_inflight(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let _permit = state.inflight.acquire().await;
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Liveness & tokens
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeConnections": state.manager.active_connections(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(rename = "userId")]
    user_id: String,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: TokenBody = parse(body)?;
    let issued = state.tokens.issue(&body.user_id)?;
    AuditEntry {
        event: "token.issued",
        tenant: body.user_id,
        server_id: None,
        tool_name: None,
        outcome: Outcome::Ok,
    }
    .emit();

    Ok(Json(json!({
        "success": true,
        "token": issued.token,
        "tokenType": issued.token_type,
    })))
}

async fn jwks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.tokens.public_jwks())
}

// ---------------------------------------------------------------------------
// MCP connections
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AutoDetectBody {
    url: String,
}

async fn mcp_auto_detect(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: AutoDetectBody = parse(body)?;
    let result = auto_detect(
        &state.http,
        &state.provider,
        &tenant,
        &body.url,
        state.timeouts.initialize,
    )
    .await?;

    let mut response = serde_json::to_value(&result)?;
    response["success"] = json!(true);
    Ok(Json(response))
}

#[derive(Deserialize)]
struct DiscoverOAuthBody {
    url: String,
    #[serde(default)]
    #[allow(dead_code)]
    transport: Option<TransportKind>,
}

async fn mcp_discover_oauth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: DiscoverOAuthBody = parse(body)?;
    let requires_oauth = state.provider.discover(&body.url, None).await.is_ok();
    Ok(Json(json!({
        "success": true,
        "requiresOAuth": requires_oauth,
    })))
}

#[derive(Deserialize)]
struct ConnectBody {
    #[serde(rename = "serverId")]
    server_id: String,
    #[serde(rename = "serverName", default)]
    server_name: Option<String>,
    url: String,
    transport: TransportKind,
    auth: UpstreamAuth,
    #[serde(rename = "authorizationCode", default)]
    authorization_code: Option<String>,
}

async fn mcp_connect(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: ConnectBody = parse(body)?;

    let return_state = json!({
        "tenant": tenant,
        "serverId": body.server_id,
        "url": body.url,
        "redirect": state.allowed_origins.first(),
    });

    let outcome = state
        .manager
        .connect(ConnectRequest {
            tenant: &tenant,
            server_id: &body.server_id,
            server_name: body.server_name.as_deref(),
            url: &body.url,
            transport: body.transport,
            auth: body.auth,
            authorization_code: body.authorization_code.as_deref(),
            return_state,
        })
        .await?;

    match outcome {
        Managed::Ready(info) => Ok(Json(json!({
            "success": true,
            "serverInfo": info,
        }))),
        Managed::NeedsAuth { authorization_url } => Ok(Json(json!({
            "success": false,
            "needsAuth": true,
            "authorizationUrl": authorization_url,
        }))),
    }
}

#[derive(Deserialize)]
struct ServerIdBody {
    #[serde(rename = "serverId")]
    server_id: String,
}

async fn mcp_disconnect(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: ServerIdBody = parse(body)?;
    state.manager.disconnect(&tenant, &body.server_id).await;
    Ok(Json(json!({ "success": true })))
}

async fn mcp_tools(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>> {
    match state.manager.list_tools(&tenant, &server_id).await? {
        Managed::Ready(tools) => Ok(Json(json!({ "tools": tools }))),
        Managed::NeedsAuth { authorization_url } => Ok(Json(json!({
            "success": false,
            "needsAuth": true,
            "authorizationUrl": authorization_url,
        }))),
    }
}

#[derive(Deserialize)]
struct ExecuteBody {
    #[serde(rename = "serverId")]
    server_id: String,
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

async fn mcp_execute(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: ExecuteBody = parse(body)?;
    match state
        .manager
        .execute(&tenant, &body.server_id, &body.tool_name, body.arguments)
        .await?
    {
        Managed::Ready(result) => Ok(Json(json!({ "result": result }))),
        Managed::NeedsAuth { authorization_url } => Ok(Json(json!({
            "success": false,
            "needsAuth": true,
            "authorizationUrl": authorization_url,
        }))),
    }
}

async fn mcp_status(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(server_id): Path<String>,
) -> Json<Value> {
    Json(json!({
        "connected": state.manager.is_connected(&tenant, &server_id),
    }))
}

async fn mcp_connections(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
) -> Json<Value> {
    Json(json!({ "connections": state.manager.connections(&tenant) }))
}

async fn mcp_server_info(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>> {
    let info = state.manager.server_info(&tenant, &server_id)?;
    Ok(Json(json!({ "serverInfo": info })))
}

async fn mcp_oauth_metadata(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>> {
    let record = state
        .manager
        .server_record(&tenant, &server_id)?
        .ok_or_else(|| Error::NotFound(format!("unknown server {server_id}")))?;

    let origin = base_url(&record.url)?;
    let metadata = state
        .origins
        .get_metadata(&origin)
        .ok_or_else(|| Error::NotFound(format!("no OAuth metadata for {server_id}")))?;

    Ok(Json(json!({ "metadata": metadata })))
}

async fn mcp_clear_oauth_tokens(
    State(state): State<Arc<AppState>>,
    Extension(Tenant(tenant)): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: ServerIdBody = parse(body)?;
    state
        .provider
        .invalidate(&tenant, &body.server_id, InvalidateScope::All)
        .await?;
    state.manager.disconnect(&tenant, &body.server_id).await;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct FaviconQuery {
    url: String,
}

async fn mcp_favicon(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FaviconQuery>,
) -> Result<Json<Value>> {
    let origin = base_url(&query.url)?;
    let favicon = resolve_favicon(&state.origins, &state.http, &origin).await;
    Ok(Json(json!({ "faviconUrl": favicon })))
}

// ---------------------------------------------------------------------------
// Tool filter
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FilterInitBody {
    servers: Vec<ServerTools>,
}

async fn filter_initialize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: FilterInitBody = parse(body)?;
    let count = state.filter.initialize(body.servers).await?;
    debug!(tools = count, "Tool filter initialized");
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct FilterBody {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    options: FilterOptions,
    #[serde(default)]
    pins: Vec<String>,
}

async fn filter_filter(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let body: FilterBody = parse(body)?;
    let output = state
        .filter
        .filter(&body.messages, &body.options, &body.pins)
        .await?;

    Ok(Json(json!({
        "success": true,
        "tools": output.tools,
        "metrics": output.metrics,
    })))
}

async fn filter_clear_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.filter.clear();
    Json(json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// OAuth callback
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth redirect target. Decodes the return state, opportunistically
/// completes the code exchange, and sends the browser back where it came
/// from with the code attached (so the client can also complete via
/// `/mcp/connect`).
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse> {
    let default_redirect = state
        .allowed_origins
        .first()
        .cloned()
        .unwrap_or_else(|| "/".to_string());

    if let Some(error) = query.error {
        warn!(error = %error, "Authorization server returned an error");
        let location = format!("{default_redirect}?oauthError={error}");
        return Ok(Redirect::temporary(&location));
    }

    let code = query
        .code
        .ok_or_else(|| Error::Validation("missing code".to_string()))?;
    let raw_state = query
        .state
        .ok_or_else(|| Error::Validation("missing state".to_string()))?;

    let decoded = decode_state(&raw_state)?;
    let redirect = decoded.return_state["redirect"]
        .as_str()
        .filter(|r| state.allowed_origins.iter().any(|o| o.as_str() == *r))
        .unwrap_or(&default_redirect)
        .to_string();

    // When the return state identifies the flow, finish the exchange here;
    // the browser still receives the code for the connect-driven path.
    let tenant = decoded.return_state["tenant"].as_str();
    let server_id = decoded.return_state["serverId"].as_str();
    let url = decoded.return_state["url"].as_str();
    if let (Some(tenant), Some(server_id), Some(url)) = (tenant, server_id, url) {
        match state
            .provider
            .exchange_code(tenant, server_id, url, None, &code)
            .await
        {
            Ok(_) => debug!(server = %server_id, "Completed exchange on callback"),
            Err(e) => warn!(server = %server_id, error = %e, "Callback exchange failed"),
        }
    }

    let mut location = url::Url::parse(&redirect)
        .map_err(|_| Error::Validation("invalid redirect target".to_string()))?;
    location
        .query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", &raw_state);
    if let Some(server_id) = server_id {
        location.query_pairs_mut().append_pair("serverId", server_id);
    }

    Ok(Redirect::temporary(location.as_str()))
}

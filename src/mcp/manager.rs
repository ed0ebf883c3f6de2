//! MCP connection manager.
//!
//! Opens client sessions on behalf of tenants, caches them per
//! `(tenant, serverId)` when the deployment allows it, and reopens from the
//! last-known configuration when it does not. Correctness never depends on a
//! cached session; only latency does.
//!
//! An upstream `Unauthorized` is never surfaced as an error from `connect`:
//! the caller gets an authorization URL instead. Mid-session, a single
//! refresh-and-retry is attempted before giving up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::McpSession;
use super::protocol::{ServerInfo, Tool, TransportKind, UpstreamAuth};
use crate::audit::{AuditEntry, Outcome};
use crate::config::TimeoutConfig;
use crate::oauth::{AuthorizeRequest, OAuthProvider};
use crate::store::{ServerRecord, TenantStore};
use crate::{Error, Result};

/// Result of a managed operation that may require user authorization.
#[derive(Debug)]
pub enum Managed<T> {
    /// The operation completed
    Ready(T),
    /// The upstream requires OAuth and no valid tokens exist
    NeedsAuth {
        /// URL the browser must visit to authorize
        authorization_url: String,
    },
}

/// Inputs for [`ClientManager::connect`].
pub struct ConnectRequest<'a> {
    /// Tenant id
    pub tenant: &'a str,
    /// Client-chosen stable server id
    pub server_id: &'a str,
    /// Display name override
    pub server_name: Option<&'a str>,
    /// MCP endpoint URL
    pub url: &'a str,
    /// Transport kind
    pub transport: TransportKind,
    /// Upstream auth configuration
    pub auth: UpstreamAuth,
    /// Authorization code when completing an OAuth flow
    pub authorization_code: Option<&'a str>,
    /// Opaque state re-attached to the browser redirect after the callback
    pub return_state: Value,
}

type Key = (String, String);

/// Session manager shared by the façade handlers.
pub struct ClientManager {
    http: Client,
    store: Arc<TenantStore>,
    provider: Arc<OAuthProvider>,
    sessions: DashMap<Key, Arc<McpSession>>,
    timeouts: TimeoutConfig,
}

impl ClientManager {
    /// Create a manager over a shared upstream HTTP client.
    #[must_use]
    pub fn new(
        http: Client,
        store: Arc<TenantStore>,
        provider: Arc<OAuthProvider>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            http,
            store,
            provider,
            sessions: DashMap::new(),
            timeouts,
        }
    }

    fn key(tenant: &str, server_id: &str) -> Key {
        (tenant.to_string(), server_id.to_string())
    }

    /// Assemble upstream request headers for an auth configuration.
    async fn build_headers(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        auth: &UpstreamAuth,
    ) -> Result<HashMap<String, String>> {
        let mut headers = auth.static_headers();

        match auth {
            UpstreamAuth::Oauth { custom_metadata, .. } => {
                if let Some(access) = self
                    .provider
                    .bearer(tenant, server_id, url, custom_metadata.as_ref())
                    .await?
                {
                    headers.insert("Authorization".to_string(), format!("Bearer {access}"));
                }
            }
            UpstreamAuth::ClientCredentials {
                client_id,
                client_secret,
                scopes,
            } => {
                let access = match self.provider.bearer(tenant, server_id, url, None).await? {
                    Some(access) => access,
                    None => {
                        // First use: exchange the credentials directly.
                        self.provider
                            .client_credentials(
                                tenant,
                                server_id,
                                url,
                                None,
                                client_id,
                                client_secret,
                                scopes,
                            )
                            .await?
                            .access_token
                    }
                };
                headers.insert("Authorization".to_string(), format!("Bearer {access}"));
            }
            _ => {}
        }

        Ok(headers)
    }

    /// Open a session, retrying once with jittered backoff on transient
    /// transport failures.
    async fn open_session(
        &self,
        url: &str,
        kind: TransportKind,
        headers: HashMap<String, String>,
    ) -> Result<McpSession> {
        let open = || {
            let headers = headers.clone();
            async move {
                McpSession::open(
                    self.http.clone(),
                    url,
                    kind,
                    headers,
                    self.timeouts.initialize,
                )
                .await
            }
        };

        open.retry(
            ExponentialBuilder::default()
                .with_max_times(1)
                .with_jitter(),
        )
        .when(|e| matches!(e, Error::Transport(_)))
        .await
    }

    /// Build an authorization URL for an upstream that rejected us.
    async fn authorization_url(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        auth: &UpstreamAuth,
        return_state: Value,
    ) -> Result<String> {
        let (scopes, custom) = match auth {
            UpstreamAuth::Oauth {
                scopes,
                custom_metadata,
            } => (scopes.clone(), custom_metadata.clone()),
            _ => (Vec::new(), None),
        };

        self.provider
            .authorization_url(AuthorizeRequest {
                tenant,
                server_id,
                url,
                scopes: &scopes,
                custom_metadata: custom.as_ref(),
                return_state,
            })
            .await
    }

    /// Connect per the request, persisting the configuration for later
    /// transparent reopens.
    pub async fn connect(&self, request: ConnectRequest<'_>) -> Result<Managed<ServerInfo>> {
        let ConnectRequest {
            tenant,
            server_id,
            server_name,
            url,
            transport,
            auth,
            authorization_code,
            return_state,
        } = request;

        let headers = self.build_headers(tenant, server_id, url, &auth).await?;

        let outcome = match self.open_session(url, transport, headers).await {
            Ok(session) => Ok(session),
            Err(Error::Unauthorized { .. }) if authorization_code.is_some() => {
                // The caller is completing OAuth: exchange, then retry once.
                let custom = match &auth {
                    UpstreamAuth::Oauth { custom_metadata, .. } => custom_metadata.as_ref(),
                    _ => None,
                };
                self.provider
                    .exchange_code(
                        tenant,
                        server_id,
                        url,
                        custom,
                        authorization_code.unwrap_or_default(),
                    )
                    .await?;

                let headers = self.build_headers(tenant, server_id, url, &auth).await?;
                self.open_session(url, transport, headers).await
            }
            Err(e) => Err(e),
        };

        let session = match outcome {
            Ok(session) => session,
            Err(Error::Unauthorized { .. }) if matches!(auth, UpstreamAuth::ClientCredentials { .. }) => {
                // No user redirect exists for this grant; surface upstream.
                return Err(Error::Upstream {
                    status: 401,
                    body: "client credentials rejected".to_string(),
                });
            }
            Err(Error::Unauthorized { .. }) => {
                let authorization_url = self
                    .authorization_url(tenant, server_id, url, &auth, return_state)
                    .await?;
                return Ok(Managed::NeedsAuth { authorization_url });
            }
            Err(e) => return Err(e),
        };

        let record = ServerRecord {
            url: url.to_string(),
            transport: transport.to_string(),
            name: Some(
                server_name
                    .map_or_else(|| session.server_info.name.clone(), ToString::to_string),
            ),
            version: Some(session.server_info.version.clone()),
            auth: serde_json::to_value(&auth)?,
        };
        self.store.put_server(tenant, server_id, &record)?;

        let info = session.server_info.clone();
        self.sessions
            .insert(Self::key(tenant, server_id), Arc::new(session));

        info!(tenant = %tenant, server = %server_id, name = %info.name, "Connected to upstream");
        AuditEntry::server("server.connected", tenant, server_id, Outcome::Ok).emit();

        Ok(Managed::Ready(info))
    }

    /// Cached session, or a fresh one opened from the last-known
    /// configuration.
    async fn session(&self, tenant: &str, server_id: &str) -> Result<Managed<Arc<McpSession>>> {
        if let Some(session) = self.sessions.get(&Self::key(tenant, server_id)) {
            return Ok(Managed::Ready(session.clone()));
        }
        self.reopen(tenant, server_id).await
    }

    /// Open a session from the stored record, replacing any cached one.
    async fn reopen(&self, tenant: &str, server_id: &str) -> Result<Managed<Arc<McpSession>>> {
        let record = self
            .store
            .get_server(tenant, server_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown server {server_id}")))?;

        let auth: UpstreamAuth = serde_json::from_value(record.auth.clone())
            .map_err(|e| Error::Internal(format!("stored auth config unreadable: {e}")))?;
        let kind = transport_kind(&record.transport)?;

        let headers = self
            .build_headers(tenant, server_id, &record.url, &auth)
            .await?;

        match self.open_session(&record.url, kind, headers).await {
            Ok(session) => {
                let session = Arc::new(session);
                self.sessions
                    .insert(Self::key(tenant, server_id), session.clone());
                Ok(Managed::Ready(session))
            }
            Err(Error::Unauthorized { .. }) => {
                let authorization_url = self
                    .authorization_url(
                        tenant,
                        server_id,
                        &record.url,
                        &auth,
                        serde_json::json!({ "serverId": server_id }),
                    )
                    .await?;
                Ok(Managed::NeedsAuth { authorization_url })
            }
            Err(e) => Err(e),
        }
    }

    /// Authorization URL built from the stored record, for surfacing a
    /// second `Unauthorized` as a needs-authorization result.
    async fn needs_auth_from_record(&self, tenant: &str, server_id: &str) -> Result<String> {
        let record = self
            .store
            .get_server(tenant, server_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown server {server_id}")))?;
        let auth: UpstreamAuth = serde_json::from_value(record.auth.clone())
            .map_err(|e| Error::Internal(format!("stored auth config unreadable: {e}")))?;

        self.authorization_url(
            tenant,
            server_id,
            &record.url,
            &auth,
            serde_json::json!({ "serverId": server_id }),
        )
        .await
    }

    /// Single refresh-and-retry after a mid-session `Unauthorized`.
    ///
    /// Returns the reopened session, or the authorization URL when the
    /// refresh was rejected.
    async fn recover_unauthorized(
        &self,
        tenant: &str,
        server_id: &str,
    ) -> Result<Managed<Arc<McpSession>>> {
        self.sessions.remove(&Self::key(tenant, server_id));

        let record = self
            .store
            .get_server(tenant, server_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown server {server_id}")))?;
        let auth: UpstreamAuth = serde_json::from_value(record.auth.clone())
            .map_err(|e| Error::Internal(format!("stored auth config unreadable: {e}")))?;

        if auth.uses_oauth() {
            let custom = match &auth {
                UpstreamAuth::Oauth { custom_metadata, .. } => custom_metadata.as_ref(),
                _ => None,
            };
            let observed = self
                .store
                .get_tokens(tenant, server_id)?
                .map(|t| t.access_token)
                .unwrap_or_default();

            let refreshed = self
                .provider
                .refresh(tenant, server_id, &record.url, custom, &observed)
                .await?;

            if refreshed.is_none() {
                debug!(tenant = %tenant, server = %server_id, "Refresh impossible, requesting authorization");
            }
        }

        // Reopen either way; with no usable tokens this produces the
        // authorization URL.
        self.reopen(tenant, server_id).await
    }

    /// List tools on an upstream server.
    pub async fn list_tools(&self, tenant: &str, server_id: &str) -> Result<Managed<Vec<Tool>>> {
        let session = match self.session(tenant, server_id).await? {
            Managed::Ready(session) => session,
            Managed::NeedsAuth { authorization_url } => {
                return Ok(Managed::NeedsAuth { authorization_url });
            }
        };

        match session.list_tools().await {
            Ok(tools) => Ok(Managed::Ready(tools)),
            Err(Error::Unauthorized { .. }) => {
                match self.recover_unauthorized(tenant, server_id).await? {
                    // A second rejection after the refresh-or-reopen attempt
                    // means the upstream wants a fresh authorization, not a
                    // gateway error.
                    Managed::Ready(session) => match session.list_tools().await {
                        Ok(tools) => Ok(Managed::Ready(tools)),
                        Err(Error::Unauthorized { .. }) => {
                            self.sessions.remove(&Self::key(tenant, server_id));
                            let authorization_url =
                                self.needs_auth_from_record(tenant, server_id).await?;
                            Ok(Managed::NeedsAuth { authorization_url })
                        }
                        Err(e) => Err(e),
                    },
                    Managed::NeedsAuth { authorization_url } => {
                        Ok(Managed::NeedsAuth { authorization_url })
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a tool, forwarding the result verbatim.
    pub async fn execute(
        &self,
        tenant: &str,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Managed<Value>> {
        let deadline = self
            .timeouts
            .execute
            .saturating_sub(Duration::from_millis(500));

        let session = match self.session(tenant, server_id).await? {
            Managed::Ready(session) => session,
            Managed::NeedsAuth { authorization_url } => {
                return Ok(Managed::NeedsAuth { authorization_url });
            }
        };

        let outcome = match session.call_tool(tool_name, arguments.clone(), deadline).await {
            Ok(result) => Ok(Managed::Ready(result)),
            Err(Error::Unauthorized { .. }) => {
                match self.recover_unauthorized(tenant, server_id).await? {
                    // Same contract as listing: a second rejection surfaces
                    // an authorization URL, never an upstream error.
                    Managed::Ready(session) => {
                        match session.call_tool(tool_name, arguments, deadline).await {
                            Ok(result) => Ok(Managed::Ready(result)),
                            Err(Error::Unauthorized { .. }) => {
                                self.sessions.remove(&Self::key(tenant, server_id));
                                let authorization_url =
                                    self.needs_auth_from_record(tenant, server_id).await?;
                                Ok(Managed::NeedsAuth { authorization_url })
                            }
                            Err(e) => Err(e),
                        }
                    }
                    Managed::NeedsAuth { authorization_url } => {
                        Ok(Managed::NeedsAuth { authorization_url })
                    }
                }
            }
            Err(e) => Err(e),
        };

        let audit_outcome = match &outcome {
            Ok(Managed::Ready(_)) => Outcome::Ok,
            Ok(Managed::NeedsAuth { .. }) => Outcome::Denied,
            Err(_) => Outcome::Error,
        };
        AuditEntry::tool(tenant, server_id, tool_name, audit_outcome).emit();

        outcome
    }

    /// Close and drop the session. A no-op when none is cached.
    pub async fn disconnect(&self, tenant: &str, server_id: &str) {
        if let Some((_, session)) = self.sessions.remove(&Self::key(tenant, server_id)) {
            if let Err(e) = session.close().await {
                warn!(tenant = %tenant, server = %server_id, error = %e, "Session close failed");
            }
        }
    }

    /// Whether a live session exists.
    #[must_use]
    pub fn is_connected(&self, tenant: &str, server_id: &str) -> bool {
        self.sessions.contains_key(&Self::key(tenant, server_id))
    }

    /// Server ids with a live session for this tenant.
    #[must_use]
    pub fn connections(&self, tenant: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Total live sessions across tenants (liveness reporting).
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.sessions.len()
    }

    /// Last-known server identity, preferring the live session.
    pub fn server_info(&self, tenant: &str, server_id: &str) -> Result<ServerInfo> {
        if let Some(session) = self.sessions.get(&Self::key(tenant, server_id)) {
            return Ok(session.server_info.clone());
        }

        let record = self
            .store
            .get_server(tenant, server_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown server {server_id}")))?;

        Ok(ServerInfo {
            name: record.name.unwrap_or_else(|| server_id.to_string()),
            version: record.version.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Stored record for a server, when any.
    pub fn server_record(&self, tenant: &str, server_id: &str) -> Result<Option<ServerRecord>> {
        self.store.get_server(tenant, server_id)
    }
}

fn transport_kind(value: &str) -> Result<TransportKind> {
    match value {
        "http" | "streamable-http" => Ok(TransportKind::Http),
        "sse" => Ok(TransportKind::Sse),
        other => Err(Error::Internal(format!("unknown stored transport {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OriginCache;
    use crate::config::OAuthConfig;

    fn manager() -> (tempfile::TempDir, ClientManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TenantStore::new(dir.path().to_path_buf()).unwrap());
        let provider = Arc::new(
            OAuthProvider::new(
                store.clone(),
                Arc::new(OriginCache::new()),
                OAuthConfig::default(),
                Duration::from_secs(15),
            )
            .unwrap(),
        );
        let manager = ClientManager::new(
            Client::new(),
            store,
            provider,
            TimeoutConfig::default(),
        );
        (dir, manager)
    }

    #[test]
    fn transport_kind_parses_stored_values() {
        assert_eq!(transport_kind("http").unwrap(), TransportKind::Http);
        assert_eq!(
            transport_kind("streamable-http").unwrap(),
            TransportKind::Http
        );
        assert_eq!(transport_kind("sse").unwrap(), TransportKind::Sse);
        assert!(transport_kind("carrier-pigeon").is_err());
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (_dir, manager) = manager();
        let err = manager.list_tools("t1", "nope").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn connections_are_tenant_scoped() {
        let (_dir, manager) = manager();
        assert!(manager.connections("t1").is_empty());
        assert!(!manager.is_connected("t1", "srv"));
        assert_eq!(manager.active_connections(), 0);
    }

    #[tokio::test]
    async fn server_info_falls_back_to_record() {
        let (_dir, manager) = manager();
        manager
            .store
            .put_server(
                "t1",
                "srv",
                &ServerRecord {
                    url: "https://mcp.example.com/mcp".to_string(),
                    transport: "http".to_string(),
                    name: Some("Example".to_string()),
                    version: Some("2.0".to_string()),
                    auth: serde_json::json!({"kind": "none"}),
                },
            )
            .unwrap();

        let info = manager.server_info("t1", "srv").unwrap();
        assert_eq!(info.name, "Example");
        assert_eq!(info.version, "2.0");

        // Another tenant cannot see it
        assert!(manager.server_info("t2", "srv").is_err());
    }

    #[tokio::test]
    async fn disconnect_without_session_is_noop() {
        let (_dir, manager) = manager();
        manager.disconnect("t1", "srv").await;
        assert!(!manager.is_connected("t1", "srv"));
    }

    /// Upstream that completes the initialize handshake but rejects every
    /// tool request with 401, and serves authorization-server metadata so
    /// an authorization URL can be built.
    async fn spawn_rejecting_upstream() -> String {
        use axum::routing::{get, post};

        let app = axum::Router::new()
            .route(
                "/mcp",
                post(|axum::Json(frame): axum::Json<Value>| async move {
                    match frame["method"].as_str() {
                        Some("initialize") => (
                            axum::http::StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "jsonrpc": "2.0",
                                "id": frame["id"],
                                "result": {
                                    "protocolVersion": "2025-03-26",
                                    "serverInfo": { "name": "Mock", "version": "1.0.0" }
                                }
                            })),
                        ),
                        Some("tools/list" | "tools/call") => (
                            axum::http::StatusCode::UNAUTHORIZED,
                            axum::Json(serde_json::json!({})),
                        ),
                        _ => (
                            axum::http::StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "jsonrpc": "2.0", "id": null, "result": {}
                            })),
                        ),
                    }
                }),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "issuer": "http://mock.local",
                        "authorization_endpoint": "http://mock.local/authorize",
                        "token_endpoint": "http://mock.local/token",
                        "code_challenge_methods_supported": ["S256"]
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn connect_to_mock(manager: &ClientManager, url: &str) {
        let outcome = manager
            .connect(ConnectRequest {
                tenant: "t1",
                server_id: "mock",
                server_name: None,
                url,
                transport: TransportKind::Http,
                auth: serde_json::from_value(serde_json::json!({"kind": "none"})).unwrap(),
                authorization_code: None,
                return_state: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, Managed::Ready(_)));
    }

    #[tokio::test]
    async fn second_unauthorized_on_list_surfaces_needs_auth() {
        let (_dir, manager) = manager();
        let base = spawn_rejecting_upstream().await;
        let url = format!("{base}/mcp");
        connect_to_mock(&manager, &url).await;

        // First tools/list gets 401, recovery reopens the session, the
        // retried call gets 401 again. That must become a needs-auth
        // result, never an error.
        match manager.list_tools("t1", "mock").await.unwrap() {
            Managed::NeedsAuth { authorization_url } => {
                assert!(authorization_url.contains("code_challenge"));
                assert!(authorization_url.contains("state="));
            }
            Managed::Ready(_) => panic!("upstream rejects tool listing, Ready is impossible"),
        }

        // The unusable session was dropped
        assert!(!manager.is_connected("t1", "mock"));
    }

    #[tokio::test]
    async fn second_unauthorized_on_execute_surfaces_needs_auth() {
        let (_dir, manager) = manager();
        let base = spawn_rejecting_upstream().await;
        let url = format!("{base}/mcp");
        connect_to_mock(&manager, &url).await;

        match manager
            .execute("t1", "mock", "search", serde_json::json!({}))
            .await
            .unwrap()
        {
            Managed::NeedsAuth { authorization_url } => {
                assert!(authorization_url.starts_with("http://mock.local/authorize"));
            }
            Managed::Ready(_) => panic!("upstream rejects execution, Ready is impossible"),
        }
    }
}

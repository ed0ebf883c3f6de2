//! Per-tenant OAuth 2.1 client provider.
//!
//! One provider instance serves every `(tenant, serverId)` pair; all state
//! lives in the tenant store, so a request-scoped deployment works without
//! any in-process session. State-mutating transitions (register, exchange,
//! refresh, invalidate) are serialized per key; refreshes are coalesced by
//! re-reading the store after the lock is acquired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::RngExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::metadata::{self, AuthorizationServerMetadata, ProtectedResourceMetadata};
use super::state::encode_state;
use crate::audit::{AuditEntry, Outcome};
use crate::cache::OriginCache;
use crate::config::OAuthConfig;
use crate::store::{InvalidateScope, OAuthClientInfo, OAuthTokens, TenantStore};
use crate::{Error, Result};

/// Inputs for building an authorization redirect.
pub struct AuthorizeRequest<'a> {
    /// Tenant id
    pub tenant: &'a str,
    /// Upstream server id
    pub server_id: &'a str,
    /// MCP endpoint URL
    pub url: &'a str,
    /// Requested scopes
    pub scopes: &'a [String],
    /// Explicit metadata bypassing discovery
    pub custom_metadata: Option<&'a AuthorizationServerMetadata>,
    /// Opaque state re-attached to the browser redirect after the callback
    pub return_state: Value,
}

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Client registration response
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    registration_access_token: Option<String>,
}

type Key = (String, String);

/// OAuth client provider shared by the MCP manager and the façade.
pub struct OAuthProvider {
    http: Client,
    store: Arc<TenantStore>,
    origins: Arc<OriginCache>,
    config: OAuthConfig,
    /// Per-(tenant, serverId) transition locks
    locks: DashMap<Key, Arc<Mutex<()>>>,
    /// Redirect loop guard
    last_redirect: DashMap<Key, Instant>,
}

impl OAuthProvider {
    /// Create a provider with the given OAuth endpoint deadline.
    pub fn new(
        store: Arc<TenantStore>,
        origins: Arc<OriginCache>,
        config: OAuthConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("OAuth HTTP client: {e}")))?;

        Ok(Self {
            http,
            store,
            origins,
            config,
            locks: DashMap::new(),
            last_redirect: DashMap::new(),
        })
    }

    fn lock_for(&self, tenant: &str, server_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((tenant.to_string(), server_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- discovery -----------------------------------------------------------

    /// Resolve authorization-server metadata for an MCP endpoint.
    ///
    /// A `custom` override bypasses discovery entirely. Otherwise the origin
    /// cache is consulted, then RFC 9728 protected-resource metadata, then a
    /// probing POST's `WWW-Authenticate` hints.
    pub async fn discover(
        &self,
        url: &str,
        custom: Option<&AuthorizationServerMetadata>,
    ) -> Result<AuthorizationServerMetadata> {
        let origin = metadata::base_url(url)?;

        if let Some(meta) = custom {
            self.origins.put_metadata(&origin, meta.clone());
            return Ok(meta.clone());
        }

        if let Some(cached) = self.origins.get_metadata(&origin) {
            return Ok(cached);
        }

        let auth_base = match ProtectedResourceMetadata::discover(&self.http, &origin).await {
            Ok(resource) => resource
                .authorization_server()
                .map_or_else(|| origin.clone(), ToString::to_string),
            Err(e) => {
                debug!(url = %url, error = %e, "No protected resource metadata, probing endpoint");
                self.probe_auth_base(url).await.unwrap_or_else(|| origin.clone())
            }
        };

        let meta = AuthorizationServerMetadata::discover(&self.http, &auth_base).await?;
        self.origins.put_metadata(&origin, meta.clone());
        Ok(meta)
    }

    /// Probe the MCP endpoint for `WWW-Authenticate` discovery hints.
    async fn probe_auth_base(&self, url: &str) -> Option<String> {
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0", "id": 0, "method": "initialize",
                "params": {"protocolVersion": crate::mcp::protocol::PROTOCOL_VERSION,
                           "capabilities": {}, "clientInfo": {"name": "hoot", "version": "0"}}
            }))
            .send()
            .await
            .ok()?;

        let challenge = response
            .headers()
            .get("www-authenticate")?
            .to_str()
            .ok()?
            .to_string();
        let hints = metadata::parse_www_authenticate(&challenge);

        if let Some(resource_url) = hints.resource_metadata {
            let resource: ProtectedResourceMetadata =
                self.http.get(&resource_url).send().await.ok()?.json().await.ok()?;
            return resource.authorization_server().map(ToString::to_string);
        }
        hints.authorization_uri
    }

    // -- registration --------------------------------------------------------

    /// Return the client registration, performing dynamic registration on
    /// first use. Registered as a public client; servers without a
    /// registration endpoint get a generated client id.
    async fn ensure_client(
        &self,
        tenant: &str,
        server_id: &str,
        meta: &AuthorizationServerMetadata,
    ) -> Result<OAuthClientInfo> {
        if let Some(info) = self.store.get_client_info(tenant, server_id)? {
            return Ok(info);
        }

        let info = match &meta.registration_endpoint {
            Some(endpoint) => match self.register_client(endpoint).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(error = %e, "Dynamic registration failed, using generated client id");
                    generated_client(&self.config.callback_url)
                }
            },
            None => generated_client(&self.config.callback_url),
        };

        self.store.put_client_info(tenant, server_id, &info)?;
        Ok(info)
    }

    async fn register_client(&self, endpoint: &str) -> Result<OAuthClientInfo> {
        let body = serde_json::json!({
            "client_name": self.config.client_name,
            "redirect_uris": [self.config.callback_url],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none"
        });

        let response = self.http.post(endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let registered: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid registration response: {e}")))?;

        info!(client_id = %registered.client_id, "Registered OAuth client");
        Ok(OAuthClientInfo {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            redirect_uris: vec![self.config.callback_url.clone()],
            registration_access_token: registered.registration_access_token,
            issued_at: unix_now(),
        })
    }

    // -- authorization -------------------------------------------------------

    /// Build an authorization URL, storing a fresh PKCE verifier.
    ///
    /// Refuses with `RateLimited` if a redirect for the same
    /// `(tenant, serverId)` was initiated inside the debounce window.
    pub async fn authorization_url(&self, request: AuthorizeRequest<'_>) -> Result<String> {
        self.check_loop_guard(request.tenant, request.server_id)?;

        let meta = self.discover(request.url, request.custom_metadata).await?;
        if !meta.supports_pkce() {
            // S256 is sent regardless; servers that predate RFC 8414
            // advertisement usually accept it.
            debug!(issuer = %meta.issuer, "Server does not advertise S256 support");
        }
        let client = self
            .ensure_client(request.tenant, request.server_id, &meta)
            .await?;

        let (verifier, challenge) = generate_pkce();
        self.store
            .put_verifier(request.tenant, request.server_id, &verifier)?;

        let state = encode_state(request.return_state);

        let mut auth_url = Url::parse(&meta.authorization_endpoint)
            .map_err(|e| Error::Transport(format!("Invalid authorization endpoint: {e}")))?;
        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &client.client_id);
            params.append_pair("redirect_uri", &self.config.callback_url);
            params.append_pair("state", &state);
            params.append_pair("code_challenge", &challenge);
            params.append_pair("code_challenge_method", "S256");
            if !request.scopes.is_empty() {
                params.append_pair("scope", &request.scopes.join(" "));
            }
        }

        self.last_redirect.insert(
            (request.tenant.to_string(), request.server_id.to_string()),
            Instant::now(),
        );
        AuditEntry::server("oauth.redirect", request.tenant, request.server_id, Outcome::Ok).emit();

        Ok(auth_url.to_string())
    }

    fn check_loop_guard(&self, tenant: &str, server_id: &str) -> Result<()> {
        let key = (tenant.to_string(), server_id.to_string());
        if let Some(last) = self.last_redirect.get(&key) {
            let elapsed = last.elapsed();
            if elapsed < self.config.redirect_debounce {
                let remaining = self.config.redirect_debounce - elapsed;
                return Err(Error::RateLimited {
                    retry_after: remaining.as_secs().max(1),
                });
            }
        }
        Ok(())
    }

    // -- code exchange -------------------------------------------------------

    /// Exchange an authorization code for tokens.
    ///
    /// The PKCE verifier is consumed atomically; a failed exchange restores
    /// it (with its original creation instant) so the store never holds a
    /// half-completed flow.
    pub async fn exchange_code(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        custom: Option<&AuthorizationServerMetadata>,
        code: &str,
    ) -> Result<OAuthTokens> {
        let lock = self.lock_for(tenant, server_id);
        let _guard = lock.lock().await;

        let meta = self.discover(url, custom).await?;
        let client = self
            .store
            .get_client_info(tenant, server_id)?
            .ok_or(Error::VerifierMissing)?;

        let verifier = self.store.take_verifier(tenant, server_id)?;

        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.config.callback_url.as_str());
        params.insert("client_id", client.client_id.as_str());
        params.insert("code_verifier", verifier.verifier.as_str());
        if let Some(secret) = client.client_secret.as_deref() {
            params.insert("client_secret", secret);
        }

        match self.post_token_form(&meta.token_endpoint, &params).await {
            Ok(tokens) => {
                self.store.put_tokens(tenant, server_id, &tokens)?;
                AuditEntry::server("oauth.exchanged", tenant, server_id, Outcome::Ok).emit();
                Ok(tokens)
            }
            Err(e) => {
                // Roll back so the browser can retry the same flow.
                self.store.restore_verifier(tenant, server_id, &verifier)?;
                AuditEntry::server("oauth.exchanged", tenant, server_id, Outcome::Error).emit();
                Err(e)
            }
        }
    }

    // -- refresh -------------------------------------------------------------

    /// Valid bearer for an upstream call, refreshing an expired access token
    /// when a refresh token is available. `None` means authorization is
    /// needed.
    pub async fn bearer(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        custom: Option<&AuthorizationServerMetadata>,
    ) -> Result<Option<String>> {
        let Some(tokens) = self.store.get_tokens(tenant, server_id)? else {
            return Ok(None);
        };

        if !tokens.is_expired() {
            return Ok(Some(tokens.access_token));
        }

        let refreshed = self
            .refresh(tenant, server_id, url, custom, &tokens.access_token)
            .await?;
        Ok(refreshed.map(|t| t.access_token))
    }

    /// Refresh after the upstream rejected `observed_access`.
    ///
    /// Coalesced: when another caller already replaced the tokens, the stored
    /// ones are returned without touching the token endpoint. Returns `None`
    /// when refresh is impossible or rejected; stored tokens are invalidated
    /// in that case so the next operation surfaces a fresh authorization URL.
    pub async fn refresh(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        custom: Option<&AuthorizationServerMetadata>,
        observed_access: &str,
    ) -> Result<Option<OAuthTokens>> {
        let lock = self.lock_for(tenant, server_id);
        let _guard = lock.lock().await;

        let Some(current) = self.store.get_tokens(tenant, server_id)? else {
            return Ok(None);
        };

        // Another caller finished a refresh while we waited on the lock.
        if current.access_token != observed_access {
            return Ok(Some(current));
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            self.store
                .invalidate(tenant, server_id, InvalidateScope::Tokens)?;
            return Ok(None);
        };

        let meta = self.discover(url, custom).await?;
        let client = self
            .store
            .get_client_info(tenant, server_id)?
            .ok_or_else(|| Error::Internal("refresh without client registration".to_string()))?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token.as_str());
        params.insert("client_id", client.client_id.as_str());
        if let Some(secret) = client.client_secret.as_deref() {
            params.insert("client_secret", secret);
        }

        match self.post_token_form(&meta.token_endpoint, &params).await {
            Ok(mut tokens) => {
                // Servers may omit the refresh token on rotation; keep ours.
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                self.store.put_tokens(tenant, server_id, &tokens)?;
                AuditEntry::server("oauth.refreshed", tenant, server_id, Outcome::Ok).emit();
                Ok(Some(tokens))
            }
            Err(e) => {
                warn!(tenant = %tenant, server = %server_id, error = %e, "Token refresh rejected");
                self.store
                    .invalidate(tenant, server_id, InvalidateScope::Tokens)?;
                AuditEntry::server("oauth.refreshed", tenant, server_id, Outcome::Error).emit();
                Ok(None)
            }
        }
    }

    // -- client credentials --------------------------------------------------

    /// Machine-to-machine variant: exchange client credentials directly.
    pub async fn client_credentials(
        &self,
        tenant: &str,
        server_id: &str,
        url: &str,
        custom: Option<&AuthorizationServerMetadata>,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> Result<OAuthTokens> {
        let lock = self.lock_for(tenant, server_id);
        let _guard = lock.lock().await;

        let meta = self.discover(url, custom).await?;

        let scope = scopes.join(" ");
        let mut params = HashMap::new();
        params.insert("grant_type", "client_credentials");
        params.insert("client_id", client_id);
        params.insert("client_secret", client_secret);
        if !scope.is_empty() {
            params.insert("scope", scope.as_str());
        }

        let tokens = self.post_token_form(&meta.token_endpoint, &params).await?;
        self.store.put_tokens(tenant, server_id, &tokens)?;
        self.store.put_client_info(
            tenant,
            server_id,
            &OAuthClientInfo {
                client_id: client_id.to_string(),
                client_secret: Some(client_secret.to_string()),
                redirect_uris: vec![],
                registration_access_token: None,
                issued_at: unix_now(),
            },
        )?;
        Ok(tokens)
    }

    // -- invalidation --------------------------------------------------------

    /// Remove stored artifacts per scope, serialized with other transitions.
    pub async fn invalidate(
        &self,
        tenant: &str,
        server_id: &str,
        scope: InvalidateScope,
    ) -> Result<()> {
        let lock = self.lock_for(tenant, server_id);
        let _guard = lock.lock().await;
        self.store.invalidate(tenant, server_id, scope)?;
        AuditEntry::server("oauth.invalidated", tenant, server_id, Outcome::Ok).emit();
        Ok(())
    }

    // -- helpers -------------------------------------------------------------

    async fn post_token_form(
        &self,
        endpoint: &str,
        params: &HashMap<&str, &str>,
    ) -> Result<OAuthTokens> {
        let response = self.http.post(endpoint).form(params).send().await?;
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid token response: {e}")))?;

        Ok(OAuthTokens::from_response(
            token.access_token,
            token.token_type,
            token.refresh_token,
            token.expires_in,
            token.scope,
        ))
    }
}

async fn upstream_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(200);
    Error::Upstream { status, body }
}

/// Public-client fallback when the server offers no registration endpoint.
fn generated_client(callback_url: &str) -> OAuthClientInfo {
    let id_bytes: [u8; 16] = rand::rng().random();
    OAuthClientInfo {
        client_id: URL_SAFE_NO_PAD.encode(id_bytes),
        client_secret: None,
        redirect_uris: vec![callback_url.to_string()],
        registration_access_token: None,
        issued_at: unix_now(),
    }
}

/// Generate a PKCE code verifier and S256 challenge.
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! OAuth metadata discovery.
//!
//! Implements RFC 8414 (Authorization Server Metadata) and RFC 9728
//! (Protected Resource Metadata), with `WWW-Authenticate` hint parsing as a
//! fallback for servers that skip the well-known documents.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Token revocation endpoint (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    /// Logo advertised by the server, used for favicon resolution
    #[serde(default)]
    pub logo_uri: Option<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array.
/// Some implementations incorrectly return `"read write"` instead of `["read", "write"]`.
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl AuthorizationServerMetadata {
    /// Discover authorization server metadata from a base URL.
    pub async fn discover(client: &Client, base_url: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            base_url.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering authorization server metadata");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Upstream {
                status: response.status().as_u16(),
                body: "authorization server metadata discovery failed".to_string(),
            });
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid authorization server metadata: {e}")))?;

        debug!(issuer = %metadata.issuer, "Discovered authorization server");
        Ok(metadata)
    }

    /// Check if PKCE S256 is supported.
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .contains(&"S256".to_string())
    }
}

impl ProtectedResourceMetadata {
    /// Discover protected resource metadata from a base URL.
    pub async fn discover(client: &Client, base_url: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/oauth-protected-resource",
            base_url.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering protected resource metadata");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Upstream {
                status: response.status().as_u16(),
                body: "protected resource metadata discovery failed".to_string(),
            });
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid protected resource metadata: {e}")))?;

        Ok(metadata)
    }

    /// First advertised authorization server, if any.
    #[must_use]
    pub fn authorization_server(&self) -> Option<&str> {
        self.authorization_servers.first().map(String::as_str)
    }
}

static WWW_AUTH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

/// Hints extracted from a `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WwwAuthenticateHints {
    /// `resource_metadata` parameter (RFC 9728 §5.1)
    pub resource_metadata: Option<String>,
    /// `as_uri` / `authorization_uri` parameter
    pub authorization_uri: Option<String>,
}

/// Parse discovery hints out of a `WWW-Authenticate` header value.
#[must_use]
pub fn parse_www_authenticate(value: &str) -> WwwAuthenticateHints {
    let mut hints = WwwAuthenticateHints::default();
    for capture in WWW_AUTH_PARAM.captures_iter(value) {
        match &capture[1] {
            "resource_metadata" => hints.resource_metadata = Some(capture[2].to_string()),
            "as_uri" | "authorization_uri" => {
                hints.authorization_uri = Some(capture[2].to_string());
            }
            _ => {}
        }
    }
    hints
}

/// Extract the base URL (scheme + host + port) from a full URL.
pub fn base_url(url: &str) -> Result<String> {
    let parsed =
        Url::parse(url).map_err(|e| Error::Validation(format!("Invalid URL {url:?}: {e}")))?;

    let mut base = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or("localhost")
    );

    if let Some(port) = parsed.port() {
        use std::fmt::Write;
        let _ = write!(base, ":{port}");
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_scopes_array() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": ["read", "write"]}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn deserialize_scopes_string() {
        let json = r#"{"resource": "http://localhost", "scopes_supported": "read write"}"#;
        let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn base_url_extraction() {
        assert_eq!(
            base_url("http://localhost:8080/api/v1").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(
            base_url("https://example.com/path").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn base_url_rejects_garbage() {
        assert!(base_url("not a url").is_err());
    }

    #[test]
    fn www_authenticate_hints() {
        let hints = parse_www_authenticate(
            r#"Bearer realm="mcp", resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource""#,
        );
        assert_eq!(
            hints.resource_metadata.as_deref(),
            Some("https://mcp.example.com/.well-known/oauth-protected-resource")
        );
        assert!(hints.authorization_uri.is_none());
    }

    #[test]
    fn www_authenticate_without_hints() {
        let hints = parse_www_authenticate("Bearer realm=\"api\"");
        assert_eq!(hints, WwwAuthenticateHints::default());
    }

    #[test]
    fn pkce_support_detection() {
        let meta = AuthorizationServerMetadata {
            issuer: "https://as.example.com".to_string(),
            authorization_endpoint: "https://as.example.com/authorize".to_string(),
            token_endpoint: "https://as.example.com/token".to_string(),
            registration_endpoint: None,
            revocation_endpoint: None,
            grant_types_supported: vec![],
            scopes_supported: vec![],
            code_challenge_methods_supported: vec!["S256".to_string()],
            logo_uri: None,
        };
        assert!(meta.supports_pkce());
    }
}

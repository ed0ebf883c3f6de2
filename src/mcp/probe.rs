//! Auto-detection probe for unknown MCP server URLs.
//!
//! Classifies a URL by transport and auth scheme without requiring the user
//! to know either. Streamable HTTP is attempted before SSE (lower
//! first-byte latency on most upstreams). The probe never caches; the
//! façade may.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::client::McpSession;
use super::protocol::{ServerInfo, TransportKind};
use crate::oauth::{AuthorizeRequest, OAuthProvider};
use crate::{Error, Result};

/// Classification of a probed URL.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeResult {
    /// Chosen transport
    pub transport: TransportKind,
    /// Server identity (from the handshake, or synthesized from the host)
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    /// The server requires OAuth
    #[serde(rename = "requiresOAuth")]
    pub requires_oauth: bool,
    /// Authorization URL, when OAuth is required
    #[serde(rename = "authUrl", skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// The server advertises the client-credentials grant
    #[serde(rename = "requiresClientCredentials")]
    pub requires_client_credentials: bool,
    /// The server rejected us without OAuth hints; a static header is needed
    #[serde(rename = "requiresHeaderAuth")]
    pub requires_header_auth: bool,
}

/// Probe a URL per the classification algorithm.
pub async fn auto_detect(
    http: &Client,
    provider: &OAuthProvider,
    tenant: &str,
    url: &str,
    deadline: Duration,
) -> Result<ProbeResult> {
    // HTTP before SSE; remember the most informative failure.
    let mut unauthorized: Option<(TransportKind, Error)> = None;

    for kind in [TransportKind::Http, TransportKind::Sse] {
        match McpSession::open(http.clone(), url, kind, HashMap::new(), deadline).await {
            Ok(session) => {
                debug!(url = %url, transport = %kind, "Probe handshake succeeded");
                let requires_client_credentials = session
                    .auth_methods
                    .iter()
                    .any(|m| m == "client_credentials");
                return Ok(ProbeResult {
                    transport: kind,
                    server_info: session.server_info.clone(),
                    requires_oauth: false,
                    auth_url: None,
                    requires_client_credentials,
                    requires_header_auth: false,
                });
            }
            Err(e @ Error::Unauthorized { .. }) => {
                unauthorized.get_or_insert((kind, e));
            }
            Err(e) => {
                debug!(url = %url, transport = %kind, error = %e, "Probe attempt failed");
            }
        }
    }

    let Some((transport, _)) = unauthorized else {
        return Err(Error::Transport(format!(
            "no MCP transport responded at {url}"
        )));
    };

    // The handshake was blocked before the server could identify itself.
    let server_info = synthesize_server_info(url);

    // OAuth-capable upstream? Discovery decides; a bare 401/403 without
    // discoverable metadata means header auth.
    match provider.discover(url, None).await {
        Ok(_) => {
            let auth_url = provider
                .authorization_url(AuthorizeRequest {
                    tenant,
                    server_id: &probe_server_id(url),
                    url,
                    scopes: &[],
                    custom_metadata: None,
                    return_state: json!({ "url": url }),
                })
                .await?;

            Ok(ProbeResult {
                transport,
                server_info,
                requires_oauth: true,
                auth_url: Some(auth_url),
                requires_client_credentials: false,
                requires_header_auth: false,
            })
        }
        Err(e) => {
            debug!(url = %url, error = %e, "No OAuth metadata, classifying as header auth");
            Ok(ProbeResult {
                transport,
                server_info,
                requires_oauth: false,
                auth_url: None,
                requires_client_credentials: false,
                requires_header_auth: true,
            })
        }
    }
}

/// Stable synthetic server id for probe-initiated OAuth artifacts.
fn probe_server_id(url: &str) -> String {
    format!("probe:{url}")
}

/// Synthesize a display name from the URL host: second-to-last label,
/// capitalized, paired with a fixed version.
pub(crate) fn synthesize_server_info(url: &str) -> ServerInfo {
    let name = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .and_then(|host| {
            let labels: Vec<&str> = host.split('.').collect();
            match labels.len() {
                0 => None,
                1 => Some((*labels.first().expect("non-empty")).to_string()),
                n => Some(labels[n - 2].to_string()),
            }
        })
        .map_or_else(|| "Unknown".to_string(), |label| capitalize(&label));

    ServerInfo {
        name,
        version: "1.0.0".to_string(),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Display name synthesis
    // =========================================================================

    #[test]
    fn second_to_last_label_is_used() {
        let info = synthesize_server_info("https://mcp.notion.com/mcp");
        assert_eq!(info.name, "Notion");
        assert_eq!(info.version, "1.0.0");
    }

    #[test]
    fn two_label_host() {
        let info = synthesize_server_info("https://example.com/mcp");
        assert_eq!(info.name, "Example");
    }

    #[test]
    fn single_label_host() {
        let info = synthesize_server_info("http://localhost:8080/mcp");
        assert_eq!(info.name, "Localhost");
    }

    #[test]
    fn deep_subdomains_still_pick_registrable_label() {
        let info = synthesize_server_info("https://api.eu.acme.io/mcp");
        assert_eq!(info.name, "Acme");
    }

    #[test]
    fn unparseable_url_falls_back() {
        let info = synthesize_server_info("not a url");
        assert_eq!(info.name, "Unknown");
        assert_eq!(info.version, "1.0.0");
    }

    #[test]
    fn capitalize_handles_empty() {
        assert_eq!(capitalize(""), "");
        assert_eq!(capitalize("notion"), "Notion");
    }

    #[test]
    fn probe_server_ids_are_stable() {
        assert_eq!(
            probe_server_id("https://mcp.example.com/mcp"),
            probe_server_id("https://mcp.example.com/mcp")
        );
    }
}

//! MCP protocol types: JSON-RPC frames and the client-side subset of the
//! MCP data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::oauth::AuthorizationServerMetadata;

/// MCP protocol version spoken by the gateway
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Result (on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID (string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID
    Number(i64),
}

/// Tool definition as supplied by the upstream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON Schema
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Server identity from the `initialize` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Display name
    pub name: String,
    /// Version string
    pub version: String,
}

/// `initialize` result subset the gateway cares about
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// Negotiated protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server identity
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    /// Advertised auth methods (non-standard extension some servers emit)
    #[serde(rename = "authMethods", default)]
    pub auth_methods: Vec<String>,
}

/// Transport used to reach an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Streamable HTTP (MCP 2025-03-26)
    #[serde(alias = "streamable-http")]
    Http,
    /// Legacy SSE
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Upstream authentication configuration, a tagged variant per auth scheme.
/// Unknown tags are rejected at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamAuth {
    /// No authentication
    None,
    /// Static headers merged into every request
    Header {
        /// Header name/value pairs
        headers: HashMap<String, String>,
    },
    /// OAuth 2.1 authorization-code + PKCE
    Oauth {
        /// Requested scopes
        #[serde(default)]
        scopes: Vec<String>,
        /// Bypass discovery with explicit authorization-server metadata
        #[serde(default, rename = "customMetadata")]
        custom_metadata: Option<AuthorizationServerMetadata>,
    },
    /// OAuth 2.1 client-credentials grant
    ClientCredentials {
        /// Client id
        client_id: String,
        /// Client secret
        client_secret: String,
        /// Requested scopes
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// Static headers plus an explicit bearer
    Custom {
        /// Header name/value pairs
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Bearer token
        #[serde(default)]
        bearer: Option<String>,
    },
}

impl UpstreamAuth {
    /// Whether this scheme is driven by the OAuth provider.
    #[must_use]
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Self::Oauth { .. } | Self::ClientCredentials { .. })
    }

    /// Static headers carried by this scheme.
    #[must_use]
    pub fn static_headers(&self) -> HashMap<String, String> {
        match self {
            Self::Header { headers } => headers.clone(),
            Self::Custom { headers, bearer } => {
                let mut merged = headers.clone();
                if let Some(bearer) = bearer {
                    merged.insert("Authorization".to_string(), format!("Bearer {bearer}"));
                }
                merged
            }
            _ => HashMap::new(),
        }
    }
}

impl JsonRpcRequest {
    /// Build a request frame.
    #[must_use]
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transport_kind_accepts_long_form() {
        let kind: TransportKind = serde_json::from_value(json!("streamable-http")).unwrap();
        assert_eq!(kind, TransportKind::Http);
        let kind: TransportKind = serde_json::from_value(json!("http")).unwrap();
        assert_eq!(kind, TransportKind::Http);
        let kind: TransportKind = serde_json::from_value(json!("sse")).unwrap();
        assert_eq!(kind, TransportKind::Sse);
    }

    #[test]
    fn transport_kind_serializes_short_form() {
        assert_eq!(serde_json::to_value(TransportKind::Http).unwrap(), json!("http"));
    }

    #[test]
    fn auth_variants_round_trip() {
        let auth: UpstreamAuth = serde_json::from_value(json!({"kind": "none"})).unwrap();
        assert!(!auth.uses_oauth());

        let auth: UpstreamAuth =
            serde_json::from_value(json!({"kind": "oauth", "scopes": ["read"]})).unwrap();
        assert!(auth.uses_oauth());

        let auth: UpstreamAuth = serde_json::from_value(json!({
            "kind": "client_credentials",
            "client_id": "cid",
            "client_secret": "cs"
        }))
        .unwrap();
        assert!(auth.uses_oauth());
    }

    #[test]
    fn unknown_auth_tag_is_rejected() {
        let result: std::result::Result<UpstreamAuth, _> =
            serde_json::from_value(json!({"kind": "kerberos"}));
        assert!(result.is_err());
    }

    #[test]
    fn header_auth_exposes_static_headers() {
        let auth: UpstreamAuth = serde_json::from_value(json!({
            "kind": "header",
            "headers": {"x-api-key": "k"}
        }))
        .unwrap();
        assert_eq!(auth.static_headers().get("x-api-key").unwrap(), "k");
    }

    #[test]
    fn custom_auth_merges_bearer() {
        let auth: UpstreamAuth = serde_json::from_value(json!({
            "kind": "custom",
            "headers": {"x-a": "1"},
            "bearer": "tok"
        }))
        .unwrap();
        let headers = auth.static_headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("x-a").unwrap(), "1");
    }

    #[test]
    fn initialize_result_parses_minimal() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": {"name": "Example", "version": "1.0.0"}
        }))
        .unwrap();
        assert_eq!(result.server_info.name, "Example");
        assert!(result.auth_methods.is_empty());
    }

    #[test]
    fn request_id_forms() {
        let s: RequestId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(s, RequestId::String("abc".to_string()));
        let n: RequestId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(n, RequestId::Number(7));
    }
}

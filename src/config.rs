//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Token issuance / verification configuration
    pub auth: AuthConfig,
    /// OAuth client configuration
    pub oauth: OAuthConfig,
    /// Tenant store configuration
    pub store: StoreConfig,
    /// Tool filter configuration
    pub filter: FilterConfig,
    /// Rate limit configuration
    pub limits: RateLimitConfig,
    /// Upstream timeout configuration
    pub timeouts: TimeoutConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// How long to wait for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3939,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Token issuance and verification configuration
///
/// When `private_key_pem` is unset the gateway falls back to opaque
/// process-lifetime session tokens; the verifier accepts either form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// RS256 private key, PEM. Supports `env:VAR` indirection.
    pub private_key_pem: Option<String>,
    /// Public JWKS document (JSON). Supports `env:VAR` indirection.
    pub jwks_json: Option<String>,
    /// Key id placed in the JWT header and matched in the JWKS
    pub kid: String,
    /// Issued token lifetime
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Browser origins allowed through CORS and the origin check
    pub allowed_origins: Vec<String>,
    /// Opaque pass-through claims for the external LLM proxy
    pub passthrough: PassthroughClaims,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            private_key_pem: None,
            jwks_json: None,
            kid: "hoot-1".to_string(),
            token_ttl: Duration::from_secs(3600),
            allowed_origins: vec!["http://localhost:5173".to_string()],
            passthrough: PassthroughClaims::default(),
        }
    }
}

impl AuthConfig {
    /// Resolve a possibly env-indirected value (`env:VAR_NAME`)
    fn resolve(value: &Option<String>) -> Option<String> {
        value.as_ref().and_then(|v| {
            v.strip_prefix("env:")
                .map_or_else(|| Some(v.clone()), |var| std::env::var(var).ok())
        })
    }

    /// Resolved private key PEM
    #[must_use]
    pub fn resolve_private_key(&self) -> Option<String> {
        Self::resolve(&self.private_key_pem)
    }

    /// Resolved JWKS JSON
    #[must_use]
    pub fn resolve_jwks(&self) -> Option<String> {
        Self::resolve(&self.jwks_json)
    }
}

/// Opaque claims stamped into every issued token for the LLM proxy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PassthroughClaims {
    /// `portkey_oid` claim value
    pub portkey_oid: Option<String>,
    /// `portkey_workspace` claim value
    pub portkey_workspace: Option<String>,
    /// `scope` claim value
    pub scope: Option<String>,
}

/// OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Public URL of the gateway's OAuth callback endpoint
    pub callback_url: String,
    /// Minimum interval between authorization redirects per (tenant, server)
    #[serde(with = "humantime_serde")]
    pub redirect_debounce: Duration,
    /// Client name sent in dynamic registration
    pub client_name: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://localhost:3939/oauth/callback".to_string(),
            redirect_debounce: Duration::from_secs(3),
            client_name: "Hoot".to_string(),
        }
    }
}

/// Tenant store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory; defaults to `~/.hoot-gateway`
    pub data_dir: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

/// Tool filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Remote embeddings endpoint (OpenAI-shaped). Unset = degraded mode.
    pub embeddings_url: Option<String>,
    /// API key for the embeddings endpoint. Supports `env:VAR` indirection.
    pub embeddings_key: Option<String>,
    /// Embedding model name
    pub embeddings_model: String,
    /// Default number of tools returned
    pub top_k: usize,
    /// Default minimum cosine score
    pub min_score: f32,
    /// Default number of most recent messages embedded as context
    pub context_messages: usize,
    /// Default cap on context size, in estimated tokens
    pub max_context_tokens: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            embeddings_url: None,
            embeddings_key: None,
            embeddings_model: "text-embedding-3-small".to_string(),
            top_k: 22,
            min_score: 0.30,
            context_messages: 3,
            max_context_tokens: 500,
        }
    }
}

impl FilterConfig {
    /// Resolved embeddings API key
    #[must_use]
    pub fn resolve_embeddings_key(&self) -> Option<String> {
        AuthConfig::resolve(&self.embeddings_key)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests allowed per window per (tenant, route-family)
    pub requests_per_window: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Upstream timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// MCP `initialize` deadline
    #[serde(with = "humantime_serde")]
    pub initialize: Duration,
    /// OAuth endpoint deadline
    #[serde(with = "humantime_serde")]
    pub oauth: Duration,
    /// Tool execution deadline (minus framing headroom)
    #[serde(with = "humantime_serde")]
    pub execute: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(10),
            oauth: Duration::from_secs(15),
            execute: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file merged with
    /// `HOOT_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // .env first so env: indirections and HOOT_ overrides see it
        dotenvy::dotenv().ok();

        let mut figment = Figment::new();

        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        } else {
            let default = Path::new("hoot-gateway.yaml");
            if default.exists() {
                figment = figment.merge(Yaml::file(default));
            }
        }

        figment
            .merge(Env::prefixed("HOOT_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolved data directory for the tenant store
    #[must_use]
    pub fn data_dir(&self) -> std::path::PathBuf {
        self.store.data_dir.as_ref().map_or_else(
            || {
                dirs::home_dir()
                    .unwrap_or_else(|| std::path::PathBuf::from("."))
                    .join(".hoot-gateway")
            },
            std::path::PathBuf::from,
        )
    }
}

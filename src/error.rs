//! Error types for the Hoot gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
///
/// One variant per protocol-level error kind; the HTTP status and the
/// `{error, message}` body shape are fixed per kind.
#[derive(Error, Debug)]
pub enum Error {
    /// No bearer token on the request
    #[error("Missing token")]
    TokenMissing,

    /// Token signature or format is bad
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// Token signature is valid but `exp` has passed
    #[error("Token expired")]
    TokenExpired,

    /// Request origin is not in the allow-list
    #[error("Origin not allowed: {0}")]
    OriginRejected(String),

    /// Rate limit window exceeded; retry after the given seconds
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the next request is admitted
        retry_after: u64,
    },

    /// Request body, shape, or UUID invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown `serverId` or missing metadata
    #[error("Not found: {0}")]
    NotFound(String),

    /// PKCE verifier was never stored or was already consumed
    #[error("PKCE verifier missing")]
    VerifierMissing,

    /// PKCE verifier is older than its TTL
    #[error("PKCE verifier expired")]
    VerifierExpired,

    /// Upstream MCP or OAuth server unreachable or malformed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream rejected the request as unauthenticated. Internal signal:
    /// the session manager converts it into a needs-authorization result
    /// before it can reach a response.
    #[error("Upstream unauthorized (HTTP {status})")]
    Unauthorized {
        /// Upstream HTTP status (401 or 403)
        status: u16,
        /// `WWW-Authenticate` challenge, when present
        www_authenticate: Option<String>,
    },

    /// Upstream returned a non-2xx during an OAuth exchange
    #[error("Upstream error: HTTP {status}: {body}")]
    Upstream {
        /// Upstream HTTP status
        status: u16,
        /// Upstream response body (truncated)
        body: String,
    },

    /// Tool filter queried before `initialize`
    #[error("Tool filter not initialized")]
    FilterNotInitialized,

    /// Configuration error (startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else; the body never carries diagnostics
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Protocol-level kind string used in error bodies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenMissing => "TokenMissing",
            Self::TokenInvalid(_) => "TokenInvalid",
            Self::TokenExpired => "TokenExpired",
            Self::OriginRejected(_) => "OriginRejected",
            Self::RateLimited { .. } => "RateLimited",
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFound",
            Self::VerifierMissing => "VerifierMissing",
            Self::VerifierExpired => "VerifierExpired",
            Self::Transport(_) => "TransportError",
            Self::Unauthorized { .. } | Self::Upstream { .. } => "UpstreamError",
            Self::FilterNotInitialized => "FilterNotInitialized",
            Self::Config(_) | Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status for this kind
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TokenMissing | Self::TokenInvalid(_) | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::OriginRejected(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) | Self::VerifierMissing | Self::VerifierExpired => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transport(_) | Self::Unauthorized { .. } | Self::Upstream { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::FilterNotInitialized => StatusCode::CONFLICT,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        // Clients auto-refresh on an expired token; the flag is the signal.
        if matches!(self, Self::TokenExpired) {
            body["expired"] = json!(true);
        }

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_statuses() {
        assert_eq!(Error::TokenMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::OriginRejected("http://evil".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::RateLimited { retry_after: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Transport("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::FilterNotInitialized.status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_kind_covers_config() {
        assert_eq!(Error::Config("missing key".into()).kind(), "Internal");
        assert_eq!(Error::Internal("x".into()).kind(), "Internal");
    }

    #[test]
    fn upstream_error_formats_status() {
        let e = Error::Upstream {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(e.to_string().contains("503"));
        assert_eq!(e.kind(), "UpstreamError");
    }
}

//! OAuth 2.1 client for upstream MCP servers.
//!
//! Implements the authorization-code flow with PKCE (RFC 7636) and dynamic
//! client registration (RFC 7591) on behalf of browser tenants:
//!
//! - Metadata discovery: RFC 9728 protected resource metadata, RFC 8414
//!   authorization server metadata, `WWW-Authenticate` hints as fallback
//! - Authorization URL construction with a CSRF + return-state parameter
//! - Code exchange, coalesced refresh, scoped invalidation
//! - Client-credentials variant for machine-to-machine upstreams

pub mod metadata;
mod provider;
mod state;

pub use metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
pub use provider::{AuthorizeRequest, OAuthProvider};
pub use state::{decode_state, encode_state, OAuthState};

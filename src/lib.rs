//! Hoot Gateway
//!
//! A multi-tenant MCP client gateway: it maintains protocol-level client
//! sessions to remote MCP servers on behalf of anonymous browser tenants
//! and exposes a REST façade for tool listing, tool execution, and OAuth
//! 2.1 authorization flows.
//!
//! # Components
//!
//! - **Auth**: RS256 gateway tokens (JWKS-verified) with tenant isolation,
//!   rate limiting, and audit
//! - **MCP**: streamable-HTTP and SSE client transports, a per-tenant
//!   session manager, and a transport/auth auto-detection probe
//! - **OAuth**: per-(tenant, server) OAuth 2.1 with dynamic registration,
//!   PKCE, coalesced refresh, and tenant-scoped persistence
//! - **Filter**: embedding-based semantic tool selection with a degraded
//!   pass-through mode

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod mcp;
pub mod oauth;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}

//! Gateway server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::Client;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{create_router, AppState};
use crate::auth::middleware::AuthState;
use crate::auth::{TenantRateLimiter, TokenService};
use crate::cache::OriginCache;
use crate::config::Config;
use crate::filter::ToolFilter;
use crate::mcp::ClientManager;
use crate::oauth::OAuthProvider;
use crate::store::TenantStore;
use crate::{Error, Result};

/// Permits in the in-flight drain semaphore.
const INFLIGHT_PERMITS: usize = 10_000;

/// The Hoot gateway server.
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Wire all components into shared state.
    ///
    /// # Errors
    ///
    /// Returns an error if keys, the store directory, or the HTTP client
    /// cannot be initialized.
    pub fn build_state(&self) -> Result<(Arc<AppState>, Arc<AuthState>)> {
        let tokens = Arc::new(TokenService::from_config(&self.config.auth)?);
        let store = Arc::new(TenantStore::new(self.config.data_dir())?);
        let origins = Arc::new(OriginCache::new());

        let provider = Arc::new(OAuthProvider::new(
            Arc::clone(&store),
            Arc::clone(&origins),
            self.config.oauth.clone(),
            self.config.timeouts.oauth,
        )?);

        let http = Client::builder()
            .timeout(self.config.timeouts.execute)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Internal(format!("Upstream HTTP client: {e}")))?;

        let manager = Arc::new(ClientManager::new(
            http.clone(),
            Arc::clone(&store),
            Arc::clone(&provider),
            self.config.timeouts.clone(),
        ));

        let filter = Arc::new(ToolFilter::new(&self.config.filter));
        let limiter = Arc::new(TenantRateLimiter::new(&self.config.limits));

        let state = Arc::new(AppState {
            tokens: Arc::clone(&tokens),
            manager,
            provider,
            filter,
            origins,
            store,
            http,
            timeouts: self.config.timeouts.clone(),
            allowed_origins: self.config.auth.allowed_origins.clone(),
            inflight: Arc::new(tokio::sync::Semaphore::new(INFLIGHT_PERMITS)),
        });

        let auth = Arc::new(AuthState {
            tokens,
            limiter,
            allowed_origins: self.config.auth.allowed_origins.clone(),
        });

        Ok((state, auth))
    }

    /// Run until a shutdown signal, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured address
    /// or an unrecoverable runtime error occurs.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (state, auth) = self.build_state()?;
        let inflight = Arc::clone(&state.inflight);
        let app = create_router(Arc::clone(&state), auth);

        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            origins = ?self.config.auth.allowed_origins,
            "Hoot gateway listening"
        );
        if self.config.filter.embeddings_url.is_none() {
            warn!("No embeddings endpoint configured, tool filter runs degraded");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Drain: every in-flight request holds one permit.
        let drain_timeout = self.config.server.shutdown_timeout;
        info!(timeout = ?drain_timeout, "Draining in-flight requests");

        #[allow(clippy::cast_possible_truncation)]
        let drain = inflight.acquire_many(INFLIGHT_PERMITS as u32);
        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(Ok(_permits)) => info!("All in-flight requests completed"),
            Ok(Err(_)) => warn!("Inflight semaphore closed unexpectedly during drain"),
            Err(_) => {
                let remaining = INFLIGHT_PERMITS.saturating_sub(inflight.available_permits());
                warn!(remaining_requests = remaining, "Drain timeout reached");
            }
        }

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

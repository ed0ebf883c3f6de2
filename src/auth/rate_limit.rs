//! Per-tenant rate limiting.
//!
//! A keyed limiter enforces the 30-requests-per-60-seconds window per
//! `(tenant, route-family)`. Excess requests receive the seconds left
//! until the next request would be admitted.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};

use crate::config::RateLimitConfig;

/// Route family a request is attributed to for limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteFamily {
    /// Token issuance
    Auth,
    /// MCP connection and tool routes
    Mcp,
    /// Tool filter routes
    Filter,
    /// OAuth callback
    OAuth,
}

impl RouteFamily {
    /// Classify a request path.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/auth") {
            Self::Auth
        } else if path.starts_with("/mcp/tool-filter") {
            Self::Filter
        } else if path.starts_with("/oauth") {
            Self::OAuth
        } else {
            Self::Mcp
        }
    }
}

type Key = (String, RouteFamily);

/// Keyed rate limiter over `(tenant, route-family)`.
pub struct TenantRateLimiter {
    enabled: bool,
    limiter: RateLimiter<Key, DashMapStateStore<Key>, DefaultClock>,
    clock: DefaultClock,
}

impl TenantRateLimiter {
    /// Create from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let requests = NonZeroU32::new(config.requests_per_window).unwrap_or(NonZeroU32::MIN);
        let period = config.window / config.requests_per_window.max(1);
        let quota = Quota::with_period(period.max(Duration::from_millis(1)))
            .unwrap_or_else(|| Quota::per_minute(requests))
            .allow_burst(requests);

        let clock = DefaultClock::default();
        let limiter = RateLimiter::new(quota, DashMapStateStore::default(), clock.clone());

        Self {
            enabled: config.enabled,
            limiter,
            clock,
        }
    }

    /// Check a request; returns seconds to wait when over the limit.
    pub fn check(&self, tenant: &str, family: RouteFamily) -> std::result::Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }

        match self.limiter.check_key(&(tenant.to_string(), family)) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(wait.as_secs().max(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32) -> TenantRateLimiter {
        TenantRateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_window: requests,
            window: Duration::from_secs(60),
        })
    }

    // =========================================================================
    // Route family classification
    // =========================================================================

    #[test]
    fn classifies_routes() {
        assert_eq!(RouteFamily::from_path("/auth/token"), RouteFamily::Auth);
        assert_eq!(
            RouteFamily::from_path("/mcp/tool-filter/filter"),
            RouteFamily::Filter
        );
        assert_eq!(RouteFamily::from_path("/oauth/callback"), RouteFamily::OAuth);
        assert_eq!(RouteFamily::from_path("/mcp/execute"), RouteFamily::Mcp);
        assert_eq!(RouteFamily::from_path("/mcp/tools/abc"), RouteFamily::Mcp);
    }

    // =========================================================================
    // Window enforcement
    // =========================================================================

    #[test]
    fn burst_of_window_size_is_admitted() {
        let limiter = limiter(30);
        for _ in 0..30 {
            assert!(limiter.check("tenant-a", RouteFamily::Mcp).is_ok());
        }
        let wait = limiter.check("tenant-a", RouteFamily::Mcp).unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn tenants_are_independent() {
        let limiter = limiter(2);
        assert!(limiter.check("a", RouteFamily::Mcp).is_ok());
        assert!(limiter.check("a", RouteFamily::Mcp).is_ok());
        assert!(limiter.check("a", RouteFamily::Mcp).is_err());
        assert!(limiter.check("b", RouteFamily::Mcp).is_ok());
    }

    #[test]
    fn families_are_independent() {
        let limiter = limiter(1);
        assert!(limiter.check("a", RouteFamily::Mcp).is_ok());
        assert!(limiter.check("a", RouteFamily::Mcp).is_err());
        assert!(limiter.check("a", RouteFamily::Filter).is_ok());
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = TenantRateLimiter::new(&RateLimitConfig {
            enabled: false,
            requests_per_window: 1,
            window: Duration::from_secs(60),
        });
        for _ in 0..100 {
            assert!(limiter.check("a", RouteFamily::Mcp).is_ok());
        }
    }
}

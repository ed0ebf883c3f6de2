//! Tenant authentication: token issuance, verification, and request middleware.

pub mod middleware;
pub mod rate_limit;
pub mod token;

pub use middleware::{auth_middleware, Tenant};
pub use rate_limit::TenantRateLimiter;
pub use token::{Claims, IssuedToken, TokenService};

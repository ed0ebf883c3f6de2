//! HTTP gateway: router, handlers, and server lifecycle.

pub mod router;
pub mod server;

pub use router::{create_router, AppState};
pub use server::Gateway;

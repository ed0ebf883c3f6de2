//! MCP client: protocol types, transports, sessions, and the per-tenant
//! connection manager.

pub mod client;
pub mod manager;
pub mod probe;
pub mod protocol;
pub mod transport;

pub use client::McpSession;
pub use manager::{ClientManager, ConnectRequest, Managed};
pub use probe::{auto_detect, ProbeResult};
pub use protocol::{ServerInfo, Tool, TransportKind, UpstreamAuth};

//! An open MCP client session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::protocol::{InitializeResult, ServerInfo, Tool, TransportKind};
use super::transport::{HttpTransport, SseTransport, Transport};
use crate::{Error, Result};

/// A session produced by a completed initialize handshake.
///
/// Sessions are request-scoped in stateless deployments and cached by the
/// manager in stateful ones; nothing here assumes reuse.
pub struct McpSession {
    transport: Arc<dyn Transport>,
    /// Negotiated server identity
    pub server_info: ServerInfo,
    /// Negotiated protocol version
    pub protocol_version: String,
    /// Auth methods advertised by the server, when any
    pub auth_methods: Vec<String>,
    /// Tool list from the most recent `tools/list`
    tools: RwLock<Option<Vec<Tool>>>,
}

impl McpSession {
    /// Open a transport of the requested kind and perform the handshake.
    ///
    /// # Errors
    ///
    /// `Error::Unauthorized` when the upstream rejects the handshake,
    /// `Error::Transport` for anything else (including the deadline).
    pub async fn open(
        http: Client,
        url: &str,
        kind: TransportKind,
        headers: HashMap<String, String>,
        deadline: Duration,
    ) -> Result<Self> {
        let deadline_error = || Error::Transport("initialize deadline exceeded".to_string());
        let (transport, response): (Arc<dyn Transport>, _) = match kind {
            TransportKind::Http => {
                let t = Arc::new(HttpTransport::new(http, url, headers));
                let response = tokio::time::timeout(deadline, t.initialize())
                    .await
                    .map_err(|_| deadline_error())??;
                (t, response)
            }
            TransportKind::Sse => {
                let t = Arc::new(SseTransport::new(http, url, headers));
                let response = tokio::time::timeout(deadline, t.initialize())
                    .await
                    .map_err(|_| deadline_error())??;
                (t, response)
            }
        };

        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| Error::Transport("Empty initialize result".to_string()))?,
        )
        .map_err(|e| Error::Transport(format!("Invalid initialize result: {e}")))?;

        debug!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP session established"
        );

        Ok(Self {
            transport,
            server_info: result.server_info,
            protocol_version: result.protocol_version,
            auth_methods: result.auth_methods,
            tools: RwLock::new(None),
        })
    }

    /// Fetch the full tool set, caching it on the session.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let response = self.transport.request("tools/list", None).await?;

        if let Some(error) = response.error {
            return Err(Error::Transport(format!(
                "tools/list failed: {} ({})",
                error.message, error.code
            )));
        }

        let tools: Vec<Tool> = response
            .result
            .and_then(|mut r| r.get_mut("tools").map(Value::take))
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Transport(format!("Invalid tools/list result: {e}")))?
            .unwrap_or_default();

        *self.tools.write() = Some(tools.clone());
        Ok(tools)
    }

    /// Execute a tool, forwarding arguments and returning the upstream
    /// result structurally unchanged. In-band tool errors come back inside
    /// the result; only JSON-RPC level failures become errors here.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });

        let response = tokio::time::timeout(deadline, self.transport.request("tools/call", Some(params)))
            .await
            .map_err(|_| Error::Transport("tool execution deadline exceeded".to_string()))??;

        if let Some(error) = response.error {
            return Err(Error::Transport(format!(
                "tools/call failed: {} ({})",
                error.message, error.code
            )));
        }

        response
            .result
            .ok_or_else(|| Error::Transport("Empty tools/call result".to_string()))
    }

    /// Tools from the last `tools/list`, if any.
    #[must_use]
    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.tools.read().clone()
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

//! MCP client transports: streamable HTTP and legacy SSE.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, PROTOCOL_VERSION};
use crate::{Error, Result};

/// An open MCP client transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the transport completed a handshake.
    fn is_connected(&self) -> bool;

    /// Close the transport, ending any upstream session.
    async fn close(&self) -> Result<()>;
}

/// Map a non-success upstream status to the right error.
async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let www_authenticate = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        return Error::Unauthorized {
            status: status.as_u16(),
            www_authenticate,
        };
    }
    Error::Transport(format!("HTTP error: {status}"))
}

/// The `clientInfo` body sent on initialize.
fn client_info_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "hoot-gateway",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

// ---------------------------------------------------------------------------
// Streamable HTTP
// ---------------------------------------------------------------------------

/// Streamable HTTP transport (MCP 2025-03-26).
pub struct HttpTransport {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    /// Session ID assigned by the server
    session_id: RwLock<Option<String>>,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpTransport {
    /// Create a transport over a shared HTTP client.
    #[must_use]
    pub fn new(client: Client, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            url: url.to_string(),
            headers,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    /// Perform the MCP initialize handshake.
    pub async fn initialize(&self) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(
            RequestId::Number(0),
            "initialize",
            Some(client_info_params()),
        );

        let response = self.send_request(&request).await?;
        if let Some(ref error) = response.error {
            return Err(Error::Transport(format!(
                "Initialize failed: {} ({})",
                error.message, error.code
            )));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.url, "HTTP transport initialized");
        Ok(response)
    }

    fn request_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().unwrap(),
        );
        headers.insert("MCP-Protocol-Version", PROTOCOL_VERSION.parse().unwrap());

        if let Some(ref session_id) = *self.session_id.read() {
            if let Ok(value) = session_id.parse() {
                headers.insert("MCP-Session-Id", value);
            }
        }

        for (key, value) in &self.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                headers.insert(k, v);
            }
        }
        headers
    }

    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.request_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if let Some(session_id) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write() = Some(id.to_string());
            }
        }

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            parse_sse_body(&text)
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        }
    }

    fn next_id(&self) -> RequestId {
        #[allow(clippy::cast_possible_wrap)]
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

/// Pull the first JSON-RPC frame out of an SSE-formatted response body.
fn parse_sse_body(text: &str) -> Result<JsonRpcResponse> {
    for line in text.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            return serde_json::from_str(data).map_err(|e| Error::Transport(e.to_string()));
        }
    }
    Err(Error::Transport("No data in SSE response".to_string()))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.send_request(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .headers(self.request_headers())
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let session_id = self.session_id.read().clone();
        if let Some(ref id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header("MCP-Session-Id", id)
                .send()
                .await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Legacy SSE
// ---------------------------------------------------------------------------

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Line-buffered reader over an SSE byte stream.
struct EventReader {
    stream: ByteStream,
    buffer: String,
}

/// One parsed SSE event.
#[derive(Debug, Default)]
struct SseEvent {
    event: String,
    data: String,
}

impl EventReader {
    fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    /// Read the next complete event (terminated by a blank line).
    async fn next_event(&mut self) -> Result<SseEvent> {
        loop {
            if let Some(boundary) = self.buffer.find("\n\n") {
                let raw = self.buffer[..boundary].to_string();
                self.buffer.drain(..boundary + 2);

                let mut event = SseEvent::default();
                for line in raw.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event.event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        if !event.data.is_empty() {
                            event.data.push('\n');
                        }
                        event.data.push_str(value.trim_start());
                    }
                }
                if event.event.is_empty() && event.data.is_empty() {
                    continue; // keep-alive
                }
                return Ok(event);
            }

            match self.stream.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                None => return Err(Error::Transport("SSE stream ended".to_string())),
            }
        }
    }
}

/// Legacy HTTP+SSE transport: a long-lived GET stream delivers responses,
/// requests are POSTed to the endpoint announced by the first event.
pub struct SseTransport {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    endpoint: RwLock<Option<String>>,
    reader: tokio::sync::Mutex<Option<EventReader>>,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl SseTransport {
    /// Create a transport over a shared HTTP client.
    #[must_use]
    pub fn new(client: Client, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            url: url.to_string(),
            headers,
            endpoint: RwLock::new(None),
            reader: tokio::sync::Mutex::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    /// Open the event stream and perform the initialize handshake.
    pub async fn initialize(&self) -> Result<JsonRpcResponse> {
        self.connect_stream().await?;

        let request = JsonRpcRequest::new(
            RequestId::Number(0),
            "initialize",
            Some(client_info_params()),
        );
        let response = self.round_trip(&request).await?;
        if let Some(ref error) = response.error {
            return Err(Error::Transport(format!(
                "Initialize failed: {} ({})",
                error.message, error.code
            )));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.url, "SSE transport initialized");
        Ok(response)
    }

    async fn connect_stream(&self) -> Result<()> {
        let mut request = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let mut reader = EventReader::new(Box::pin(response.bytes_stream()));

        // The first event announces the POST endpoint.
        let event = reader.next_event().await?;
        if event.event != "endpoint" {
            return Err(Error::Transport(format!(
                "Expected endpoint event, got {:?}",
                event.event
            )));
        }

        let base = Url::parse(&self.url)
            .map_err(|e| Error::Transport(format!("Invalid SSE URL: {e}")))?;
        let endpoint = base
            .join(event.data.trim())
            .map_err(|e| Error::Transport(format!("Invalid endpoint event: {e}")))?;

        *self.endpoint.write() = Some(endpoint.to_string());
        *self.reader.lock().await = Some(reader);
        Ok(())
    }

    /// POST a request and wait for the matching response on the stream.
    async fn round_trip(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or_else(|| Error::Transport("SSE transport not connected".to_string()))?;

        let response = self
            .client
            .post(&endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("SSE stream not open".to_string()))?;

        loop {
            let event = reader.next_event().await?;
            if event.event != "message" && !event.event.is_empty() {
                continue;
            }
            let frame: JsonRpcResponse = match serde_json::from_str(&event.data) {
                Ok(frame) => frame,
                Err(_) => continue, // notification or unrelated frame
            };
            if frame.id.as_ref() == Some(&request.id) {
                return Ok(frame);
            }
        }
    }

    fn next_id(&self) -> RequestId {
        #[allow(clippy::cast_possible_wrap)]
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.round_trip(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or_else(|| Error::Transport("SSE transport not connected".to_string()))?;

        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.reader.lock().await = None;
        *self.endpoint.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    // =========================================================================
    // SSE body parsing (streamable HTTP responses)
    // =========================================================================

    #[test]
    fn parses_sse_data_line() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let response = parse_sse_body(body).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(1)));
    }

    #[test]
    fn missing_data_line_is_transport_error() {
        assert!(parse_sse_body("event: ping\n\n").is_err());
    }

    // =========================================================================
    // Event reader
    // =========================================================================

    fn reader_from(chunks: Vec<&'static str>) -> EventReader {
        let items: Vec<reqwest::Result<bytes::Bytes>> = chunks
            .into_iter()
            .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes())))
            .collect();
        EventReader::new(Box::pin(stream::iter(items)))
    }

    #[tokio::test]
    async fn reads_endpoint_event() {
        let mut reader = reader_from(vec!["event: endpoint\ndata: /messages?session=1\n\n"]);
        let event = reader.next_event().await.unwrap();
        assert_eq!(event.event, "endpoint");
        assert_eq!(event.data, "/messages?session=1");
    }

    #[tokio::test]
    async fn reassembles_split_chunks() {
        let mut reader = reader_from(vec!["event: mess", "age\ndata: {\"a\"", ":1}\n\n"]);
        let event = reader.next_event().await.unwrap();
        assert_eq!(event.event, "message");
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[tokio::test]
    async fn skips_keepalive_blocks() {
        let mut reader = reader_from(vec!["\n\nevent: message\ndata: x\n\n"]);
        let event = reader.next_event().await.unwrap();
        assert_eq!(event.event, "message");
    }

    #[tokio::test]
    async fn stream_end_is_error() {
        let mut reader = reader_from(vec![]);
        assert!(reader.next_event().await.is_err());
    }

    #[tokio::test]
    async fn multiline_data_is_joined() {
        let mut reader = reader_from(vec!["data: line1\ndata: line2\n\n"]);
        let event = reader.next_event().await.unwrap();
        assert_eq!(event.data, "line1\nline2");
    }
}

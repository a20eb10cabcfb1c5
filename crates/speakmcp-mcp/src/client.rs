//! MCP Client implementation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::protocol::{
    methods, Incoming, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::transport::Transport;
use crate::{McpTool, ServerCapabilities, PROTOCOL_VERSION};

/// Default time to wait for a single response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP Client for connecting to MCP servers.
///
/// Requests on one client are serialized: the transport is held from send
/// until the matching response arrives. Responses carrying other ids (for
/// example late replies to a request whose caller gave up) are discarded.
pub struct McpClient {
    transport: Mutex<Box<dyn Transport>>,
    request_id: AtomicI64,
    request_timeout: Duration,
}

impl McpClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            request_id: AtomicI64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn next_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Perform the `initialize` handshake followed by `notifications/initialized`
    pub async fn initialize(&self, client_info: ClientInfo) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_info.name,
                "version": client_info.version
            }
        });

        let result = self.request(methods::INITIALIZE, Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;

        self.notify(methods::INITIALIZED).await?;

        Ok(init)
    }

    /// List available tools
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let tools: ToolsListResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        Ok(tools.tools)
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str) -> Result<(), McpError> {
        let notification = serde_json::to_value(JsonRpcNotification::new(method))
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut transport = self.transport.lock().await;
        transport
            .send(notification)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    /// Send a request and return its `result`, mapping JSON-RPC errors to [`McpError::Server`]
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id();
        let mut request = JsonRpcRequest::new(RequestId::Number(id), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        let response = self.send_request(id, request).await?;

        if let Some(error) = response.error {
            return Err(McpError::Server {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn send_request(
        &self,
        id: i64,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut transport = self.transport.lock().await;

        let request_value =
            serde_json::to_value(&request).map_err(|e| McpError::Protocol(e.to_string()))?;

        // The deadline covers the write too: HTTP transports read the reply inside `send`
        let exchange = async {
            transport
                .send(request_value)
                .await
                .map_err(|e| McpError::Transport(e.to_string()))?;
            receive_matching(&mut **transport, id).await
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| McpError::Timeout(request.method.clone()))?
    }

    /// Close the underlying transport
    pub async fn close(&self) -> Result<(), McpError> {
        let mut transport = self.transport.lock().await;
        transport
            .close()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }
}

/// Read messages until the response for `id` arrives
async fn receive_matching(
    transport: &mut dyn Transport,
    id: i64,
) -> Result<JsonRpcResponse, McpError> {
    loop {
        let value = transport
            .receive()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?
            .ok_or(McpError::ConnectionClosed)?;

        match Incoming::classify(value) {
            Some(Incoming::Response(response)) => {
                if response.id.as_ref().is_some_and(|rid| rid.matches(id)) {
                    return Ok(response);
                }
                tracing::debug!(
                    expected = id,
                    got = ?response.id,
                    "Discarding response for another request"
                );
            }
            Some(Incoming::Notification { method, .. }) => {
                tracing::trace!(method = %method, "Ignoring server notification");
            }
            None => {
                tracing::debug!("Ignoring unrecognized message");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "speakmcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Result of the `initialize` handshake
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Text rendering of every content item, in order
    pub fn texts(&self) -> Vec<String> {
        self.content.iter().map(ContentItem::to_text).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unknown,
}

impl ContentItem {
    pub fn to_text(&self) -> String {
        match self {
            ContentItem::Text { text } => text.clone(),
            ContentItem::Image { mime_type, .. } => format!("[image: {}]", mime_type),
            ContentItem::Resource { resource } => resource
                .get("text")
                .and_then(|t| t.as_str())
                .map(String::from)
                .unwrap_or_else(|| resource.to_string()),
            ContentItem::Unknown => "[unsupported content]".to_string(),
        }
    }
}

/// MCP errors
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

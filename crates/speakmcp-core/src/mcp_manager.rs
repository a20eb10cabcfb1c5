//! MCP (Model Context Protocol) Server Manager
//!
//! Manages the lifecycle of MCP servers: connecting over the configured
//! transport, discovering tools, routing tool calls, and runtime toggles.
//! Servers fail independently; one that cannot connect is logged and
//! skipped while the rest of the catalog stays usable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use speakmcp_mcp::client::DEFAULT_REQUEST_TIMEOUT;
use speakmcp_mcp::transport::StderrSink;
use speakmcp_mcp::{
    ClientInfo, McpClient, McpError, StdioTransport, StreamableHttpTransport, Transport,
    TransportKind, WebSocketTransport,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::tools::{qualify, split_qualified, ToolDescriptor, ToolResult};

/// Log lines kept per server
pub const MAX_LOG_ENTRIES: usize = 100;

/// Status of an MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum McpServerStatus {
    /// Not connected
    Stopped,
    /// Handshake in progress
    Starting,
    /// Connected and tools discovered
    Running,
    /// Failed to connect or lost the connection
    Error(String),
}

/// One captured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

type LogRing = Arc<parking_lot::Mutex<VecDeque<LogEntry>>>;

fn push_log(ring: &LogRing, message: impl Into<String>) {
    let mut logs = ring.lock();
    if logs.len() >= MAX_LOG_ENTRIES {
        logs.pop_front();
    }
    logs.push_back(LogEntry {
        timestamp: Utc::now(),
        message: message.into(),
    });
}

/// Summary information about an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerInfo {
    pub name: String,
    /// Resolved transport, `None` when the config is unusable
    pub transport: Option<TransportKind>,
    pub status: McpServerStatus,
    pub tool_count: usize,
    /// Enabled in persisted configuration
    pub enabled: bool,
    /// Enabled in the runtime overlay
    pub runtime_enabled: bool,
}

/// Opens transports for server configs
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        name: &str,
        config: &McpServerConfig,
        stderr: StderrSink,
    ) -> Result<Box<dyn Transport>>;
}

/// Builds the real stdio / websocket / streamable HTTP transports
pub struct DefaultConnector;

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn open(
        &self,
        name: &str,
        config: &McpServerConfig,
        stderr: StderrSink,
    ) -> Result<Box<dyn Transport>> {
        let kind = config.transport_kind()?;
        debug!(server = name, transport = %kind, "Opening transport");

        let missing = |what: &str| Error::Config(format!("MCP server '{}' has no {}", name, what));

        let transport: Box<dyn Transport> = match kind {
            TransportKind::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| missing("command"))?;
                Box::new(
                    StdioTransport::spawn(
                        command,
                        &config.args,
                        &config.env,
                        config.cwd.as_ref(),
                        Some(stderr),
                    )
                    .await?,
                )
            }
            TransportKind::Websocket => {
                let url = config.url.as_deref().ok_or_else(|| missing("url"))?;
                let timeout = config.request_timeout().unwrap_or(DEFAULT_REQUEST_TIMEOUT);
                Box::new(WebSocketTransport::connect(url, &config.headers, timeout).await?)
            }
            TransportKind::StreamableHttp => {
                let url = config.url.as_deref().ok_or_else(|| missing("url"))?;
                Box::new(StreamableHttpTransport::new(url, config.headers.clone()))
            }
        };
        Ok(transport)
    }
}

struct ServerEntry {
    config: McpServerConfig,
    client: Option<Arc<McpClient>>,
    status: McpServerStatus,
    tools: Vec<ToolDescriptor>,
    runtime_enabled: bool,
    logs: LogRing,
}

impl ServerEntry {
    fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            client: None,
            status: McpServerStatus::Stopped,
            tools: Vec::new(),
            runtime_enabled: true,
            logs: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
        }
    }
}

/// Manager for MCP servers
pub struct McpServerManager {
    servers: RwLock<HashMap<String, ServerEntry>>,
    disabled_tools: parking_lot::RwLock<HashSet<String>>,
    connector: Arc<dyn TransportConnector>,
    client_info: ClientInfo,
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(DefaultConnector))
    }

    pub fn with_connector(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            disabled_tools: parking_lot::RwLock::new(HashSet::new()),
            connector,
            client_info: ClientInfo::default(),
        }
    }

    /// Register a server without connecting it
    pub async fn add_server(&self, name: &str, config: McpServerConfig) {
        let mut servers = self.servers.write().await;
        match servers.get_mut(name) {
            Some(entry) => entry.config = config,
            None => {
                servers.insert(name.to_string(), ServerEntry::new(config));
            }
        }
    }

    /// Disconnect and forget a server
    pub async fn remove_server(&self, name: &str) -> bool {
        self.disconnect(name).await;
        self.servers.write().await.remove(name).is_some()
    }

    /// Connect every server that is enabled in both config and runtime overlay.
    ///
    /// Failures are logged and reported per server; they never stop the others.
    pub async fn initialize(
        &self,
        configs: &HashMap<String, McpServerConfig>,
    ) -> Vec<(String, Result<usize>)> {
        let mut to_connect = Vec::new();
        {
            let mut servers = self.servers.write().await;
            for (name, config) in configs {
                let entry = servers
                    .entry(name.clone())
                    .or_insert_with(|| ServerEntry::new(config.clone()));
                entry.config = config.clone();
                if config.disabled || !entry.runtime_enabled {
                    debug!(server = %name, "Skipping disabled MCP server");
                    continue;
                }
                to_connect.push((name.clone(), config.clone()));
            }
        }

        let results = futures::future::join_all(
            to_connect
                .into_iter()
                .map(|(name, config)| async move {
                    let result = self.connect(&name, config).await;
                    if let Err(e) = &result {
                        warn!(server = %name, "MCP server failed to start: {}", e);
                    }
                    (name, result)
                }),
        )
        .await;

        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(connected = ok, failed = results.len() - ok, "MCP servers initialized");
        results
    }

    /// Connect one server, replacing any existing connection. Returns the tool count.
    pub async fn connect(&self, name: &str, config: McpServerConfig) -> Result<usize> {
        self.disconnect(name).await;

        let logs = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .entry(name.to_string())
                .or_insert_with(|| ServerEntry::new(config.clone()));
            entry.config = config.clone();
            entry.status = McpServerStatus::Starting;
            entry.logs.clone()
        };

        push_log(&logs, format!("Connecting ({})", transport_label(&config)));

        match self.open_and_discover(name, &config, logs.clone()).await {
            Ok((client, tools)) => {
                let count = tools.len();
                let mut servers = self.servers.write().await;
                let Some(entry) = servers.get_mut(name) else {
                    // Removed while connecting
                    let _ = client.close().await;
                    return Err(Error::ServerNotFound(name.to_string()));
                };
                entry.client = Some(client);
                entry.tools = tools;
                entry.status = McpServerStatus::Running;
                push_log(&logs, format!("Connected with {} tools", count));
                info!(server = name, tools = count, "MCP server connected");
                Ok(count)
            }
            Err(e) => {
                push_log(&logs, format!("Connection failed: {}", e));
                if let Some(entry) = self.servers.write().await.get_mut(name) {
                    entry.status = McpServerStatus::Error(e.to_string());
                    entry.client = None;
                    entry.tools.clear();
                }
                Err(e)
            }
        }
    }

    async fn open_and_discover(
        &self,
        name: &str,
        config: &McpServerConfig,
        logs: LogRing,
    ) -> Result<(Arc<McpClient>, Vec<ToolDescriptor>)> {
        let sink_logs = logs.clone();
        let server_name = name.to_string();
        let stderr: StderrSink = Arc::new(move |line: &str| {
            debug!(server = %server_name, "stderr: {}", line);
            push_log(&sink_logs, line.to_string());
        });

        let transport = self.connector.open(name, config, stderr).await?;
        let mut client = McpClient::new(transport);
        if let Some(timeout) = config.request_timeout() {
            client = client.with_request_timeout(timeout);
        }
        let client = Arc::new(client);

        let discovered = async {
            let init = client.initialize(self.client_info.clone()).await?;
            push_log(
                &logs,
                format!(
                    "Initialized {} {} (protocol {})",
                    init.server_info.name, init.server_info.version, init.protocol_version
                ),
            );
            client.list_tools().await
        }
        .await;

        match discovered {
            Ok(tools) => {
                let tools = tools
                    .into_iter()
                    .map(|t| ToolDescriptor {
                        name: qualify(name, &t.name),
                        description: t.description,
                        input_schema: t.input_schema,
                        server: name.to_string(),
                    })
                    .collect();
                Ok((client, tools))
            }
            Err(e) => {
                let _ = client.close().await;
                Err(Error::Mcp(e))
            }
        }
    }

    /// Close a server's connection. Safe on unknown or already-stopped servers.
    pub async fn disconnect(&self, name: &str) -> bool {
        let client = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else {
                return false;
            };
            entry.tools.clear();
            entry.status = McpServerStatus::Stopped;
            entry.client.take()
        };

        match client {
            Some(client) => {
                if let Err(e) = client.close().await {
                    debug!(server = name, "Error closing MCP transport: {}", e);
                }
                info!(server = name, "MCP server disconnected");
                true
            }
            None => false,
        }
    }

    /// Disconnect and reconnect with the stored config
    pub async fn restart(&self, name: &str) -> Result<usize> {
        let config = self
            .servers
            .read()
            .await
            .get(name)
            .map(|e| e.config.clone())
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        self.connect(name, config).await
    }

    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Route a qualified tool call to its server.
    ///
    /// Every failure comes back as an error result, never as `Err`.
    pub async fn execute_tool(&self, qualified: &str, arguments: Value) -> ToolResult {
        let Some((server, tool)) = split_qualified(qualified) else {
            return ToolResult::error(format!("Invalid tool name '{}': expected server:tool", qualified));
        };

        if self.disabled_tools.read().contains(qualified) {
            return ToolResult::error(format!("Tool '{}' is disabled", qualified));
        }

        let (client, logs) = {
            let servers = self.servers.read().await;
            let Some(entry) = servers.get(server) else {
                return ToolResult::error(format!("MCP server '{}' not found", server));
            };
            match (&entry.client, &entry.status) {
                (Some(client), McpServerStatus::Running) if entry.runtime_enabled => {
                    if !entry.tools.iter().any(|t| t.name == qualified) {
                        return ToolResult::error(format!("Unknown tool '{}'", qualified));
                    }
                    (client.clone(), entry.logs.clone())
                }
                _ => {
                    return ToolResult::error(format!("MCP server '{}' is not connected", server));
                }
            }
        };

        debug!(server, tool, "Calling MCP tool");
        match client.call_tool(tool, arguments).await {
            Ok(result) => ToolResult {
                content: result.texts(),
                is_error: result.is_error,
            },
            Err(e) => {
                push_log(&logs, format!("tools/call {} failed: {}", tool, e));
                if matches!(e, McpError::ConnectionClosed | McpError::Transport(_)) {
                    self.mark_lost(server, &client, &e).await;
                }
                ToolResult::error(format!("Error calling {}: {}", qualified, e))
            }
        }
    }

    /// Flag a server whose connection dropped, unless it was reconnected meanwhile
    async fn mark_lost(&self, server: &str, client: &Arc<McpClient>, error: &McpError) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(server)
            && entry.client.as_ref().is_some_and(|c| Arc::ptr_eq(c, client))
        {
            warn!(server, "MCP server connection lost: {}", error);
            entry.status = McpServerStatus::Error(error.to_string());
            entry.client = None;
            entry.tools.clear();
        }
    }

    /// Runtime on/off switch. Disabling disconnects; enabling connects.
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let config = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
            entry.runtime_enabled = enabled;
            entry.config.clone()
        };

        info!(server = name, enabled, "MCP server toggled");
        if enabled {
            let running = self.status(name).await == Some(McpServerStatus::Running);
            if !running {
                self.connect(name, config).await?;
            }
        } else {
            self.disconnect(name).await;
        }
        Ok(())
    }

    /// Runtime switch hiding a single tool from the catalog
    pub fn set_tool_enabled(&self, qualified: &str, enabled: bool) {
        let mut disabled = self.disabled_tools.write();
        if enabled {
            disabled.remove(qualified);
        } else {
            disabled.insert(qualified.to_string());
        }
    }

    pub fn is_tool_enabled(&self, qualified: &str) -> bool {
        !self.disabled_tools.read().contains(qualified)
    }

    pub async fn status(&self, name: &str) -> Option<McpServerStatus> {
        self.servers.read().await.get(name).map(|e| e.status.clone())
    }

    pub async fn list_servers(&self) -> Vec<McpServerInfo> {
        let servers = self.servers.read().await;
        let mut list: Vec<McpServerInfo> = servers
            .iter()
            .map(|(name, e)| McpServerInfo {
                name: name.clone(),
                transport: e.config.transport_kind().ok(),
                status: e.status.clone(),
                tool_count: e.tools.len(),
                enabled: !e.config.disabled,
                runtime_enabled: e.runtime_enabled,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn server_logs(&self, name: &str) -> Option<Vec<LogEntry>> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|e| e.logs.lock().iter().cloned().collect())
    }

    /// Tools of running, enabled servers minus individually disabled tools
    pub async fn available_tools(&self) -> Vec<ToolDescriptor> {
        let disabled = self.disabled_tools.read().clone();
        let servers = self.servers.read().await;
        let mut tools: Vec<ToolDescriptor> = servers
            .values()
            .filter(|e| e.runtime_enabled && e.status == McpServerStatus::Running)
            .flat_map(|e| e.tools.iter())
            .filter(|t| !disabled.contains(&t.name))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

fn transport_label(config: &McpServerConfig) -> String {
    match config.transport_kind() {
        Ok(kind) => kind.to_string(),
        Err(_) => "unknown transport".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// In-memory MCP server with one `echo` tool and one `broken` tool
    struct FakeServer {
        inbox: VecDeque<Value>,
        fail_handshake: bool,
    }

    #[async_trait]
    impl Transport for FakeServer {
        async fn send(&mut self, message: Value) -> io::Result<()> {
            let Some(id) = message.get("id").cloned() else {
                return Ok(());
            };
            let method = message["method"].as_str().unwrap_or_default();
            let reply = match method {
                "initialize" if self.fail_handshake => json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32603, "message": "boom"}
                }),
                "initialize" => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"protocolVersion": "2024-11-05", "capabilities": {},
                               "serverInfo": {"name": "fake", "version": "0.0.1"}}
                }),
                "tools/list" => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"tools": [
                        {"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}},
                        {"name": "broken", "description": "Always fails"}
                    ]}
                }),
                "tools/call" => {
                    let name = message["params"]["name"].as_str().unwrap_or_default();
                    if name == "echo" {
                        let text = message["params"]["arguments"]["text"].clone();
                        json!({"jsonrpc": "2.0", "id": id,
                               "result": {"content": [{"type": "text", "text": text}]}})
                    } else {
                        json!({"jsonrpc": "2.0", "id": id,
                               "result": {"content": [{"type": "text", "text": "it broke"}], "isError": true}})
                    }
                }
                _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "nope"}}),
            };
            self.inbox.push_back(reply);
            Ok(())
        }

        async fn receive(&mut self) -> io::Result<Option<Value>> {
            Ok(self.inbox.pop_front())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FakeConnector;

    #[async_trait]
    impl TransportConnector for FakeConnector {
        async fn open(
            &self,
            _name: &str,
            config: &McpServerConfig,
            stderr: StderrSink,
        ) -> Result<Box<dyn Transport>> {
            if config.command.as_deref() == Some("missing") {
                return Err(Error::Io(io::Error::new(io::ErrorKind::NotFound, "no such binary")));
            }
            stderr("fake server booting");
            Ok(Box::new(FakeServer {
                inbox: VecDeque::new(),
                fail_handshake: config.command.as_deref() == Some("bad-handshake"),
            }))
        }
    }

    fn manager() -> McpServerManager {
        McpServerManager::with_connector(Arc::new(FakeConnector))
    }

    #[tokio::test]
    async fn test_connect_prefixes_tools() {
        let manager = manager();
        let count = manager.connect("fs", McpServerConfig::new("fake")).await.unwrap();
        assert_eq!(count, 2);

        let names: Vec<String> = manager.available_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["fs:broken", "fs:echo"]);

        let logs = manager.server_logs("fs").await.unwrap();
        assert!(logs.iter().any(|l| l.message == "fake server booting"));
    }

    #[tokio::test]
    async fn test_initialize_isolates_failures() {
        let manager = manager();
        let mut configs = HashMap::new();
        configs.insert("good".to_string(), McpServerConfig::new("fake"));
        configs.insert("gone".to_string(), McpServerConfig::new("missing"));
        configs.insert("rude".to_string(), McpServerConfig::new("bad-handshake"));
        configs.insert("off".to_string(), McpServerConfig::new("fake").with_disabled(true));

        let results = manager.initialize(&configs).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 1);

        assert_eq!(manager.status("good").await, Some(McpServerStatus::Running));
        assert!(matches!(manager.status("gone").await, Some(McpServerStatus::Error(_))));
        assert!(matches!(manager.status("rude").await, Some(McpServerStatus::Error(_))));
        assert_eq!(manager.status("off").await, Some(McpServerStatus::Stopped));
        assert_eq!(manager.available_tools().await.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_tool_routes_and_normalizes() {
        let manager = manager();
        manager.connect("fs", McpServerConfig::new("fake")).await.unwrap();

        let ok = manager.execute_tool("fs:echo", json!({"text": "hi"})).await;
        assert_eq!(ok, ToolResult::text("hi"));

        let failed = manager.execute_tool("fs:broken", json!({})).await;
        assert!(failed.is_error);
        assert_eq!(failed.content, vec!["it broke"]);

        let unknown = manager.execute_tool("fs:nope", json!({})).await;
        assert!(unknown.is_error);

        let no_server = manager.execute_tool("web:fetch", json!({})).await;
        assert!(no_server.is_error);
        assert!(no_server.joined().contains("not found"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager();
        manager.connect("fs", McpServerConfig::new("fake")).await.unwrap();

        assert!(manager.disconnect("fs").await);
        assert!(!manager.disconnect("fs").await);
        assert!(!manager.disconnect("never-added").await);
        assert!(manager.available_tools().await.is_empty());

        let result = manager.execute_tool("fs:echo", json!({"text": "hi"})).await;
        assert!(result.is_error);
        assert!(result.joined().contains("not connected"));

        assert_eq!(manager.restart("fs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_runtime_toggles() {
        let manager = manager();
        manager.connect("fs", McpServerConfig::new("fake")).await.unwrap();

        manager.set_tool_enabled("fs:broken", false);
        let names: Vec<String> = manager.available_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["fs:echo"]);
        assert!(manager.execute_tool("fs:broken", json!({})).await.is_error);
        manager.set_tool_enabled("fs:broken", true);

        manager.set_server_enabled("fs", false).await.unwrap();
        assert!(manager.available_tools().await.is_empty());
        let info = &manager.list_servers().await[0];
        assert!(!info.runtime_enabled);
        assert!(info.enabled);
        assert_eq!(info.status, McpServerStatus::Stopped);

        manager.set_server_enabled("fs", true).await.unwrap();
        assert_eq!(manager.available_tools().await.len(), 2);

        assert!(matches!(
            manager.set_server_enabled("ghost", true).await,
            Err(Error::ServerNotFound(_))
        ));
    }

    #[test]
    fn test_log_ring_is_bounded() {
        let ring: LogRing = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            push_log(&ring, format!("line {}", i));
        }
        let logs = ring.lock();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs.front().unwrap().message, "line 10");
    }
}

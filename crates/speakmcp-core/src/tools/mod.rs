//! Tool model for SpeakMCP agents
//!
//! Every tool the model can call is described by a [`ToolDescriptor`] whose
//! name is qualified as `server:tool`. Tools come from two places:
//! - MCP servers managed by [`McpServerManager`]
//! - built-in tools registered in a [`ToolRegistry`] under a reserved server name
//!
//! [`ToolCatalog`] merges both and routes calls by prefix.

pub mod builtin;
pub mod process_utils;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ToolError;
use crate::mcp_manager::McpServerManager;

/// Boxed future type for object-safe async trait methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Separator between server and tool name
pub const QUALIFIED_SEPARATOR: char = ':';

/// Build a qualified `server:tool` name
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, QUALIFIED_SEPARATOR, tool)
}

/// Split a qualified name into `(server, tool)`
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIED_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Qualified `server:tool` name
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Owning server
    pub server: String,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Normalized tool outcome: ordered text segments plus an error flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text.into()],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![message.into()],
            is_error: true,
        }
    }

    pub fn json(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self::text(text)
    }

    /// All segments joined by newlines
    pub fn joined(&self) -> String {
        self.content.join("\n")
    }
}

impl From<ToolError> for ToolResult {
    fn from(e: ToolError) -> Self {
        ToolResult::error(e.to_string())
    }
}

/// Per-call context handed to tools
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// Core trait for built-in tools
pub trait Tool: Send + Sync {
    /// Unqualified tool name
    fn name(&self) -> &str;

    /// Description of what the tool does
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with given parameters
    fn execute(&self, params: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>>;
}

/// Registry of built-in tools published under one server name
pub struct ToolRegistry {
    server: String,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tools: HashMap::new(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Register a tool
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get a tool by unqualified name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors for every registered tool, sorted by name
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: qualify(&self.server, t.name()),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
                server: self.server.clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Whether `qualified` belongs to this registry
    pub fn owns(&self, qualified: &str) -> bool {
        split_qualified(qualified).is_some_and(|(server, _)| server == self.server)
    }

    pub async fn execute(&self, qualified: &str, params: Value, ctx: ToolContext) -> ToolResult {
        let Some((_, name)) = split_qualified(qualified) else {
            return ToolResult::error(format!("Invalid tool name: {}", qualified));
        };
        match self.get(name) {
            Some(tool) => tool.execute(params, ctx).await.unwrap_or_else(ToolResult::from),
            None => ToolResult::from(ToolError::NotFound(qualified.to_string())),
        }
    }
}

/// The tool-execution callback used by the agent loop
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult;
}

/// Global tool catalog: built-ins plus every connected MCP server
pub struct ToolCatalog {
    builtins: Arc<ToolRegistry>,
    mcp: Arc<McpServerManager>,
}

impl ToolCatalog {
    pub fn new(builtins: Arc<ToolRegistry>, mcp: Arc<McpServerManager>) -> Self {
        Self { builtins, mcp }
    }

    /// All currently available tools: built-ins first, then MCP tools
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = self.builtins.list();
        tools.extend(self.mcp.available_tools().await);
        tools
    }
}

#[async_trait]
impl ToolExecutor for ToolCatalog {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        if self.builtins.owns(&call.name) {
            self.builtins
                .execute(&call.name, call.arguments.clone(), ctx.clone())
                .await
        } else {
            self.mcp.execute_tool(&call.name, call.arguments.clone()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        fn execute(&self, params: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
            Box::pin(async move {
                let text = params["text"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidParams("text is required".into()))?;
                Ok(ToolResult::text(format!("{}:{}", ctx.session_id, text)))
            })
        }
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("github:search"), Some(("github", "search")));
        assert_eq!(split_qualified("a:b:c"), Some(("a", "b:c")));
        assert_eq!(split_qualified("plain"), None);
        assert_eq!(split_qualified(":tool"), None);
    }

    #[test]
    fn test_registry_lists_qualified_names() {
        let mut registry = ToolRegistry::new("builtin");
        registry.register(Arc::new(Echo));

        let tools = registry.list();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "builtin:echo");
        assert_eq!(tools[0].server, "builtin");
        assert!(registry.owns("builtin:echo"));
        assert!(!registry.owns("other:echo"));
    }

    #[tokio::test]
    async fn test_registry_execute_maps_errors() {
        let mut registry = ToolRegistry::new("builtin");
        registry.register(Arc::new(Echo));

        let ok = registry
            .execute("builtin:echo", json!({"text": "hi"}), ToolContext::new("s1"))
            .await;
        assert_eq!(ok, ToolResult::text("s1:hi"));

        let bad = registry
            .execute("builtin:echo", json!({}), ToolContext::default())
            .await;
        assert!(bad.is_error);
        assert!(bad.joined().contains("text is required"));

        let missing = registry
            .execute("builtin:nope", json!({}), ToolContext::default())
            .await;
        assert!(missing.is_error);
    }
}

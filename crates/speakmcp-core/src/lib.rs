//! SpeakMCP Core - agent orchestration runtime
//!
//! This crate provides the runtime behind the SpeakMCP frontends:
//! - The agent loop driving model calls and tool calls to completion
//! - Per-session stop flags, cancellation handles and owned processes
//! - MCP server management over stdio, WebSocket and streamable HTTP
//! - Built-in settings tools, tool approvals and the message queue

pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod mcp_manager;
pub mod profile;
pub mod progress;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod system_prompt;
pub mod tools;

pub use config::{AgentConfig, Config, ConfigManager, McpServerConfig, RetryConfig};
pub use error::{Error, Result, ToolError};
pub use mcp_manager::{LogEntry, McpServerInfo, McpServerManager, McpServerStatus, TransportConnector};
pub use profile::{Profile, ProfileSnapshot, ProfileStore};
pub use progress::{ChannelProgressSink, NullProgressSink, ProgressEvent, ProgressSink};
pub use provider::{LlmClient, LlmResponse};
pub use runtime::{AgentRuntime, QueueReport};
pub use tools::{
    Tool, ToolCall, ToolCatalog, ToolContext, ToolDescriptor, ToolExecutor, ToolRegistry, ToolResult,
};

// Session exports
pub use session::{
    AgentLoop, AgentOutcome, AgentRequest, ApprovalDecision, ConversationEntry, ConversationStore,
    JsonFileStore, MemoryStore, MessageQueueManager, Role, SessionStateManager, ToolApprovalManager,
};

//! Built-in settings tools
//!
//! Published under the reserved server name [`BUILTIN_SERVER`] so the model
//! sees them alongside MCP tools. They operate on the runtime itself: the
//! MCP server list, profiles, settings, a shell, and the emergency stop.

use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::ToolError;
use crate::mcp_manager::McpServerManager;
use crate::profile::ProfileStore;
use crate::session::approval::ToolApprovalManager;
use crate::session::state::SessionStateManager;
use crate::tools::process_utils::shell_command;
use crate::tools::{BoxFuture, Tool, ToolContext, ToolRegistry, ToolResult};

/// Reserved server name for built-in tools
pub const BUILTIN_SERVER: &str = "speakmcp-settings";

/// Shared handles the built-ins operate on
#[derive(Clone)]
pub struct BuiltinContext {
    pub mcp: Arc<McpServerManager>,
    pub profiles: Arc<ProfileStore>,
    pub state: Arc<SessionStateManager>,
    pub approvals: Arc<ToolApprovalManager>,
    pub agent: AgentConfig,
}

/// Registry with every built-in tool
pub fn builtin_registry(ctx: BuiltinContext) -> ToolRegistry {
    let mut registry = ToolRegistry::new(BUILTIN_SERVER);
    registry.register(Arc::new(ListMcpServers { ctx: ctx.clone() }));
    registry.register(Arc::new(ToggleMcpServer { ctx: ctx.clone() }));
    registry.register(Arc::new(ListProfiles { ctx: ctx.clone() }));
    registry.register(Arc::new(SwitchProfile { ctx: ctx.clone() }));
    registry.register(Arc::new(GetSettings { ctx: ctx.clone() }));
    registry.register(Arc::new(ExecuteCommand { ctx: ctx.clone() }));
    registry.register(Arc::new(KillAgent { ctx }));
    registry
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidParams(format!("{} is required", key)))
}

/// Lists configured MCP servers with status and tool counts
pub struct ListMcpServers {
    ctx: BuiltinContext,
}

impl Tool for ListMcpServers {
    fn name(&self) -> &str {
        "list_mcp_servers"
    }

    fn description(&self) -> &str {
        "List all configured MCP servers with their connection status, transport and tool count."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let servers = self.ctx.mcp.list_servers().await;
            let value = serde_json::to_value(&servers)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            Ok(ToolResult::json(&json!({ "servers": value, "count": servers.len() })))
        })
    }
}

/// Enables or disables an MCP server for the running session
pub struct ToggleMcpServer {
    ctx: BuiltinContext,
}

impl Tool for ToggleMcpServer {
    fn name(&self) -> &str {
        "toggle_mcp_server"
    }

    fn description(&self) -> &str {
        "Enable or disable an MCP server at runtime. Omit `enabled` to flip the current state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "server_name": {
                    "type": "string",
                    "description": "Name of the MCP server"
                },
                "enabled": {
                    "type": "boolean",
                    "description": "Target state; toggles when omitted"
                }
            },
            "required": ["server_name"]
        })
    }

    fn execute(&self, params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let name = required_str(&params, "server_name")?;

            let current = self
                .ctx
                .mcp
                .list_servers()
                .await
                .into_iter()
                .find(|s| s.name == name)
                .ok_or_else(|| ToolError::NotFound(format!("MCP server '{}'", name)))?;

            let enabled = params["enabled"].as_bool().unwrap_or(!current.runtime_enabled);
            self.ctx
                .mcp
                .set_server_enabled(name, enabled)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            Ok(ToolResult::json(&json!({
                "server": name,
                "enabled": enabled,
            })))
        })
    }
}

pub struct ListProfiles {
    ctx: BuiltinContext,
}

impl Tool for ListProfiles {
    fn name(&self) -> &str {
        "list_profiles"
    }

    fn description(&self) -> &str {
        "List available profiles and show which one is active."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let current = self.ctx.profiles.current_id();
            let profiles: Vec<Value> = self
                .ctx
                .profiles
                .list()
                .into_iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "name": p.name,
                        "active": p.id == current,
                    })
                })
                .collect();
            Ok(ToolResult::json(&json!({ "profiles": profiles, "current": current })))
        })
    }
}

/// Switches the active profile. Running sessions keep their snapshot.
pub struct SwitchProfile {
    ctx: BuiltinContext,
}

impl Tool for SwitchProfile {
    fn name(&self) -> &str {
        "switch_profile"
    }

    fn description(&self) -> &str {
        "Switch the active profile by id or name. Takes effect for new sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "profile": {
                    "type": "string",
                    "description": "Profile id or name"
                }
            },
            "required": ["profile"]
        })
    }

    fn execute(&self, params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let target = required_str(&params, "profile")?;
            let profile = self
                .ctx
                .profiles
                .switch(target)
                .map_err(|e| ToolError::NotFound(e.to_string()))?;
            Ok(ToolResult::json(&json!({ "id": profile.id, "name": profile.name })))
        })
    }
}

pub struct GetSettings {
    ctx: BuiltinContext,
}

impl Tool for GetSettings {
    fn name(&self) -> &str {
        "get_settings"
    }

    fn description(&self) -> &str {
        "Show the current agent settings, active profile and MCP server summary."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let agent = serde_json::to_value(&self.ctx.agent)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            let servers = self.ctx.mcp.list_servers().await;
            let running = servers
                .iter()
                .filter(|s| s.status == crate::mcp_manager::McpServerStatus::Running)
                .count();

            Ok(ToolResult::json(&json!({
                "agent": agent,
                "activeProfile": self.ctx.profiles.current_id(),
                "mcpServers": { "configured": servers.len(), "running": running },
                "activeSessions": self.ctx.state.active_session_ids().len(),
            })))
        })
    }
}

/// Runs a shell command owned by the calling session
pub struct ExecuteCommand {
    ctx: BuiltinContext,
}

impl Tool for ExecuteCommand {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds, capped at the configured shell timeout"
                }
            },
            "required": ["command"]
        })
    }

    fn execute(&self, params: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let command = required_str(&params, "command")?;
            // The configured timeout is also the ceiling for what the model may ask for
            let limit = self.ctx.agent.shell_timeout_secs.max(1);
            let timeout = params["timeout"].as_u64().unwrap_or(limit).clamp(1, limit);

            let mut cmd = shell_command(command);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let child = cmd.spawn().map_err(ToolError::Io)?;
            let pid = child.id();
            if let Some(pid) = pid {
                self.ctx.state.register_process(&ctx.session_id, pid);
            }

            // Dropping the wait future on timeout kills the child
            let output =
                tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output()).await;

            if let Some(pid) = pid {
                self.ctx.state.unregister_process(&ctx.session_id, pid);
            }

            let output = output
                .map_err(|_| {
                    warn!(command, timeout, "Command timed out");
                    ToolError::ExecutionFailed(format!("Command timed out after {}s", timeout))
                })?
                .map_err(ToolError::Io)?;

            let result = json!({
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "success": output.status.success()
            });

            if output.status.success() {
                Ok(ToolResult::json(&result))
            } else {
                let mut failed = ToolResult::json(&result);
                failed.is_error = true;
                Ok(failed)
            }
        })
    }
}

/// Emergency stop for every running agent
pub struct KillAgent {
    ctx: BuiltinContext,
}

impl Tool for KillAgent {
    fn name(&self) -> &str {
        "kill_agent"
    }

    fn description(&self) -> &str {
        "Emergency stop: halt every running agent session, its tools and child processes."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(async move {
            let report = self.ctx.state.stop_all_sessions();
            let approvals = self.ctx.approvals.cancel_all();
            info!(
                handles = report.handles_cancelled,
                processes = report.processes_terminated.len(),
                approvals,
                "Emergency stop requested by tool"
            );
            Ok(ToolResult::json(&json!({
                "stopped": true,
                "handlesCancelled": report.handles_cancelled,
                "processesTerminated": report.processes_terminated.len(),
                "approvalsCancelled": approvals,
            })))
        })
    }
}

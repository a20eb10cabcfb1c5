//! Configuration management for SpeakMCP
//!
//! Handles loading, saving, and managing application configuration:
//! agent loop thresholds, MCP server definitions and profiles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speakmcp_mcp::TransportKind;

use crate::error::{Error, Result};
use crate::profile::Profile;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Id of the profile new sessions start with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// MCP servers by name
    #[serde(default, alias = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// Agent profiles
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Agent loop configuration
///
/// The thresholds here are product-tuned defaults; all of them can be
/// overridden from the `[agent]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap on loop iterations per run
    pub max_iterations: usize,
    /// Run a batch of tool calls concurrently
    pub parallel_tool_execution: bool,
    /// Consecutive empty model responses before the run fails
    pub max_empty_responses: usize,
    /// Short responses (after tool use) before a nudge is injected
    pub no_progress_nudge_after: usize,
    /// Failures of one tool before it is hidden for the rest of the run
    pub tool_failure_threshold: usize,
    /// Responses shorter than this count as "no progress"
    pub short_response_chars: usize,
    /// Ask before every tool call
    pub require_tool_approval: bool,
    /// Qualified tool names that always need approval
    pub approval_required_tools: Vec<String>,
    /// Timeout for the `execute_command` built-in
    pub shell_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for owned processes
    pub process_kill_grace_secs: u64,
    /// Retry policy for tool calls
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            parallel_tool_execution: true,
            max_empty_responses: 3,
            no_progress_nudge_after: 2,
            tool_failure_threshold: 3,
            short_response_chars: 50,
            require_tool_approval: false,
            approval_required_tools: Vec::new(),
            shell_timeout_secs: 30,
            process_kill_grace_secs: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Whether a call to `tool_name` must wait for approval
    pub fn needs_approval(&self, tool_name: &str) -> bool {
        self.require_tool_approval || self.approval_required_tools.iter().any(|t| t == tool_name)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.process_kill_grace_secs)
    }
}

/// Tool call retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
    /// Where conversations are stored (defaults to the data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversations_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            conversations_dir: None,
        }
    }
}

/// Configuration for one MCP server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    /// Explicit transport; inferred from `command`/`url` when absent
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "transportKind")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers for websocket and HTTP transports
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    /// Per-request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl McpServerConfig {
    /// Server launched as a child process
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Server reached over a URL (websocket or HTTP, by scheme)
    pub fn new_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Resolve which transport to use.
    ///
    /// An explicit `transport` wins. Otherwise a `command` means stdio, a
    /// `ws://`/`wss://` URL means websocket and any other URL means
    /// streamable HTTP.
    pub fn transport_kind(&self) -> Result<TransportKind> {
        if let Some(kind) = self.transport {
            return Ok(kind);
        }
        if self.command.is_some() {
            return Ok(TransportKind::Stdio);
        }
        match &self.url {
            Some(url) => {
                let lower = url.to_ascii_lowercase();
                if lower.starts_with("ws://") || lower.starts_with("wss://") {
                    Ok(TransportKind::Websocket)
                } else {
                    Ok(TransportKind::StreamableHttp)
                }
            }
            None => Err(Error::Config(
                "MCP server needs either a command or a url".to_string(),
            )),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("speakmcp").join("config.toml"))
    }

    /// Load configuration from a file
    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Add or replace an MCP server definition
    pub fn set_mcp_server(&mut self, name: &str, server: McpServerConfig) {
        self.config.mcp_servers.insert(name.to_string(), server);
    }

    /// Remove an MCP server definition
    pub fn remove_mcp_server(&mut self, name: &str) -> Option<McpServerConfig> {
        self.config.mcp_servers.remove(name)
    }

    /// Directory where conversations are kept
    pub fn conversations_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.config.general.conversations_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Config("Could not find data directory".to_string()))?;
        Ok(data_dir.join("speakmcp").join("conversations"))
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            config_path: PathBuf::from("config.toml"),
            config: Config::default(),
        })
    }
}

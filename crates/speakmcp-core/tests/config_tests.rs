//! Configuration loading tests

use speakmcp_core::config::{Config, ConfigManager, McpServerConfig};
use speakmcp_core::profile::{Profile, ProfileStore};
use speakmcp_mcp::TransportKind;
use tempfile::TempDir;

const SAMPLE: &str = r#"
active_profile = "research"

[agent]
max_iterations = 25
parallel_tool_execution = false
approval_required_tools = ["speakmcp-settings:execute_command"]

[agent.retry]
max_attempts = 5

[mcpServers.files]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
env = { DEBUG = "1" }

[mcpServers.remote]
url = "wss://mcp.example.com/socket"
timeoutSecs = 15

[mcpServers.api]
url = "https://mcp.example.com/mcp"
transport = "streamableHttp"
disabled = true
headers = { Authorization = "Bearer abc" }

[[profiles]]
id = "default"
name = "Default"

[[profiles]]
id = "research"
name = "Research"
guidelines = "Cite sources."
"#;

#[test]
fn test_parse_full_config() {
    let config: Config = toml::from_str(SAMPLE).unwrap();

    assert_eq!(config.agent.max_iterations, 25);
    assert!(!config.agent.parallel_tool_execution);
    assert_eq!(config.agent.retry.max_attempts, 5);
    // Untouched fields keep their defaults
    assert_eq!(config.agent.retry.base_delay_ms, 1000);
    assert_eq!(config.agent.tool_failure_threshold, 3);
    assert!(config.agent.needs_approval("speakmcp-settings:execute_command"));

    assert_eq!(config.mcp_servers.len(), 3);
    let files = &config.mcp_servers["files"];
    assert_eq!(files.transport_kind().unwrap(), TransportKind::Stdio);
    assert_eq!(files.args.len(), 3);
    assert_eq!(files.env.get("DEBUG").map(String::as_str), Some("1"));

    let remote = &config.mcp_servers["remote"];
    assert_eq!(remote.transport_kind().unwrap(), TransportKind::Websocket);
    assert_eq!(remote.request_timeout(), Some(std::time::Duration::from_secs(15)));

    let api = &config.mcp_servers["api"];
    assert_eq!(api.transport_kind().unwrap(), TransportKind::StreamableHttp);
    assert!(api.disabled);
    assert_eq!(api.headers.len(), 1);

    let profiles = ProfileStore::from_config(&config);
    assert_eq!(profiles.current_id(), "research");
    assert_eq!(profiles.list().len(), 2);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.agent.max_iterations, 10);
    assert!(config.mcp_servers.is_empty());
    assert_eq!(config.general.log_level, "info");

    let profiles = ProfileStore::from_config(&config);
    assert_eq!(profiles.list().len(), 1);
    assert_eq!(profiles.current_id(), "default");
}

#[test]
fn test_missing_file_yields_default_config() {
    let dir = TempDir::new().unwrap();
    let manager = ConfigManager::with_path(dir.path().join("absent.toml")).unwrap();
    assert!(manager.config().mcp_servers.is_empty());
}

#[test]
fn test_invalid_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[agent\nmax_iterations = ").unwrap();

    let result = ConfigManager::with_path(path);
    assert!(matches!(result, Err(speakmcp_core::Error::Config(_))));
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut manager = ConfigManager::with_path(path.clone()).unwrap();
    manager.config_mut().agent.max_iterations = 4;
    manager.config_mut().active_profile = Some("writer".to_string());
    manager
        .config_mut()
        .profiles
        .push(Profile::new("writer", "Writer").with_guidelines("Be brief."));
    manager.set_mcp_server(
        "echo",
        McpServerConfig::new("echo-server").with_args(vec!["--quiet".to_string()]),
    );
    manager.set_mcp_server("gone", McpServerConfig::new_url("http://localhost:1/mcp"));
    assert!(manager.remove_mcp_server("gone").is_some());
    manager.save().unwrap();

    let reloaded = ConfigManager::with_path(path).unwrap();
    let config = reloaded.config();
    assert_eq!(config.agent.max_iterations, 4);
    assert_eq!(config.active_profile.as_deref(), Some("writer"));
    assert_eq!(config.profiles[0].guidelines, "Be brief.");
    assert_eq!(config.mcp_servers.len(), 1);
    assert_eq!(
        config.mcp_servers["echo"],
        McpServerConfig::new("echo-server").with_args(vec!["--quiet".to_string()])
    );
}

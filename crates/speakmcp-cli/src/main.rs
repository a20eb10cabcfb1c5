//! SpeakMCP CLI - command line front end for the agent runtime
//!
//! Connects the configured MCP servers and exposes the tool catalog,
//! profiles and effective configuration from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use dialoguer::Confirm;

use speakmcp_core::config::{Config, ConfigManager};
use speakmcp_core::mcp_manager::{McpServerManager, McpServerStatus};
use speakmcp_core::profile::ProfileStore;
use speakmcp_core::session::{SessionStateManager, ToolApprovalManager};
use speakmcp_core::tools::builtin::{builtin_registry, BuiltinContext};
use speakmcp_core::tools::{ToolCall, ToolCatalog, ToolContext, ToolExecutor};

#[derive(Parser)]
#[command(name = "speakmcp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect MCP servers, tools and profiles of the SpeakMCP runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured MCP servers and show their status
    Servers {
        /// Also print each server's recent log lines
        #[arg(long)]
        logs: bool,
    },

    /// Show the tool catalog (built-ins and MCP tools)
    Tools,

    /// Call a tool by its qualified name
    Call {
        /// Qualified tool name, e.g. `files:read_file`
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,

        /// Skip the approval prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List profiles, or switch the active one
    Profiles {
        /// Profile id or name to make active
        #[arg(long = "use")]
        use_profile: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

/// Everything a command needs to reach tools
struct Catalog {
    mcp: Arc<McpServerManager>,
    catalog: ToolCatalog,
}

impl Catalog {
    async fn connect(config: &Config) -> Self {
        let mcp = Arc::new(McpServerManager::new());
        for (name, result) in mcp.initialize(&config.mcp_servers).await {
            if let Err(e) = result {
                eprintln!("{} {}: {}", style("!").red(), name, e);
            }
        }

        let builtins = builtin_registry(BuiltinContext {
            mcp: mcp.clone(),
            profiles: Arc::new(ProfileStore::from_config(config)),
            state: Arc::new(SessionStateManager::new(config.agent.kill_grace())),
            approvals: Arc::new(ToolApprovalManager::new()),
            agent: config.agent.clone(),
        });
        let catalog = ToolCatalog::new(Arc::new(builtins), mcp.clone());
        Self { mcp, catalog }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; keep them quiet unless asked
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(if cli.verbose {
            "info,speakmcp_core=debug"
        } else {
            "warn"
        })
        .init();

    let mut config_manager = match cli.config {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new()?,
    };

    match cli.command {
        Commands::Servers { logs } => show_servers(config_manager.config(), logs).await,
        Commands::Tools => show_tools(config_manager.config()).await,
        Commands::Call { tool, arguments, yes } => {
            call_tool(config_manager.config(), &tool, &arguments, yes).await?
        }
        Commands::Profiles { use_profile } => handle_profiles(&mut config_manager, use_profile)?,
        Commands::Config => show_config(&config_manager)?,
    }

    Ok(())
}

fn status_label(status: &McpServerStatus) -> String {
    match status {
        McpServerStatus::Running => style("running").green().to_string(),
        McpServerStatus::Starting => style("starting").yellow().to_string(),
        McpServerStatus::Stopped => style("stopped").dim().to_string(),
        McpServerStatus::Error(message) => style(format!("error: {}", message)).red().to_string(),
    }
}

async fn show_servers(config: &Config, logs: bool) {
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return;
    }

    let catalog = Catalog::connect(config).await;
    println!("{}", style("MCP Servers:").bold());
    println!();

    for server in catalog.mcp.list_servers().await {
        let transport = server
            .transport
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        let enabled = if server.enabled { "" } else { " (disabled)" };
        println!(
            "  {:<20} {:<15} {:>3} tools  {}{}",
            style(&server.name).cyan(),
            transport,
            server.tool_count,
            status_label(&server.status),
            enabled
        );

        if logs && let Some(entries) = catalog.mcp.server_logs(&server.name).await {
            for entry in entries {
                println!(
                    "      {} {}",
                    style(entry.timestamp.format("%H:%M:%S")).dim(),
                    entry.message
                );
            }
        }
    }

    catalog.mcp.shutdown().await;
}

async fn show_tools(config: &Config) {
    let catalog = Catalog::connect(config).await;
    println!("{}", style("Available Tools:").bold());
    println!();

    for tool in catalog.catalog.tools().await {
        let approval = if config.agent.needs_approval(&tool.name) {
            style("approval").yellow().to_string()
        } else {
            String::new()
        };
        println!("  {:<40} {} {}", style(&tool.name).cyan(), tool.description, approval);
    }

    catalog.mcp.shutdown().await;
}

async fn call_tool(config: &Config, tool: &str, arguments: &str, yes: bool) -> anyhow::Result<()> {
    let arguments: serde_json::Value = serde_json::from_str(arguments)
        .map_err(|e| anyhow::anyhow!("Arguments must be a JSON object: {}", e))?;
    if !arguments.is_object() {
        anyhow::bail!("Arguments must be a JSON object");
    }

    if config.agent.needs_approval(tool) && !yes {
        let approved = Confirm::new()
            .with_prompt(format!(
                "Run {} with {}?",
                tool,
                serde_json::to_string(&arguments)?
            ))
            .default(false)
            .interact()?;
        if !approved {
            println!("{}", style("Denied.").red());
            return Ok(());
        }
    }

    let catalog = Catalog::connect(config).await;
    let call = ToolCall::new("cli", tool, arguments);
    let result = catalog.catalog.execute(&call, &ToolContext::new("cli")).await;
    catalog.mcp.shutdown().await;

    if result.is_error {
        eprintln!("{}", style(result.joined()).red());
        std::process::exit(1);
    }
    println!("{}", result.joined());
    Ok(())
}

fn handle_profiles(config_manager: &mut ConfigManager, use_profile: Option<String>) -> anyhow::Result<()> {
    let profiles = ProfileStore::from_config(config_manager.config());

    if let Some(target) = use_profile {
        let profile = profiles.switch(&target)?;
        config_manager.config_mut().active_profile = Some(profile.id.clone());
        config_manager.save()?;
        println!("Active profile: {}", style(&profile.name).green());
        return Ok(());
    }

    let current = profiles.current_id();
    println!("{}", style("Profiles:").bold());
    for profile in profiles.list() {
        let marker = if profile.id == current { "*" } else { " " };
        println!("  {} {:<16} {}", marker, style(&profile.id).cyan(), profile.name);
    }
    Ok(())
}

fn show_config(config_manager: &ConfigManager) -> anyhow::Result<()> {
    let config = config_manager.config();
    println!("{}", style("Configuration:").bold());
    println!();
    println!("  Config file: {}", style(config_manager.config_path().display()).green());
    println!(
        "  Conversations: {}",
        style(config_manager.conversations_dir()?.display()).dim()
    );
    println!("  MCP servers: {}", config.mcp_servers.len());
    println!();
    println!("{}", style("Agent:").bold());
    println!("  max_iterations: {}", config.agent.max_iterations);
    println!("  parallel_tool_execution: {}", config.agent.parallel_tool_execution);
    println!("  tool_failure_threshold: {}", config.agent.tool_failure_threshold);
    println!("  require_tool_approval: {}", config.agent.require_tool_approval);
    println!(
        "  retry: {} attempts, {}ms base, {}ms max",
        config.agent.retry.max_attempts,
        config.agent.retry.base_delay_ms,
        config.agent.retry.max_delay_ms
    );
    Ok(())
}

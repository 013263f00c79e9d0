//! muster: call tools on many MCP servers from one terminal.

mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use muster_config::MusterConfig;
use muster_mcp::{McpHub, StartReport, ToolCapability, ToolFilter, ToolSummary};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "muster", version, about = "Call tools on many MCP servers")]
struct Cli {
    /// Config file (overrides MUSTER_CONFIG and discovered files)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to every configured server and report its status
    Servers,

    /// List the tools discovered across all servers
    Tools {
        /// Only tools from this server
        #[arg(long)]
        server: Option<String>,

        /// Only tools that declare themselves read-only
        #[arg(long)]
        read_only: bool,
    },

    /// Call a tool by qualified name, e.g. `fs.read_file`
    Call {
        name: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Per-attempt timeout (defaults to the server's configured timeout)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Probe every server once
    Health,
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config =
        MusterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    match &config.source {
        Some(path) => tracing::debug!("Using configuration from {}", path.display()),
        None => tracing::debug!("No configuration file found, no servers configured"),
    }

    let hub = McpHub::new(config.mcp);
    let report = hub.start().await;
    let outcome = run(&hub, &report, cli.command).await;
    hub.shutdown().await;
    outcome
}

async fn run(hub: &McpHub, report: &StartReport, command: Command) -> Result<()> {
    match command {
        Command::Servers => {
            let views = output::server_views(
                hub.manager().statuses(),
                &report.connect,
                &hub.registry().servers(),
            );
            output::print_json(&views)
        }
        Command::Tools { server, read_only } => {
            let mut filter = ToolFilter::default();
            if let Some(server) = server {
                filter = filter.server(server);
            }
            if read_only {
                filter = filter.capability(ToolCapability::ReadOnly);
            }
            let tools: Vec<ToolSummary> =
                hub.tools(&filter).iter().map(|t| t.summary()).collect();
            output::print_json(&tools)
        }
        Command::Call {
            name,
            args,
            timeout_ms,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;
            let timeout = timeout_ms.map(Duration::from_millis);
            let content = hub
                .call(&name, arguments, timeout)
                .await
                .with_context(|| format!("Call to '{name}' failed"))?;
            output::print_json(&content)
        }
        Command::Health => {
            let manager = hub.manager();
            let names = manager.server_names();
            let statuses = join_all(names.iter().map(|name| manager.health_check(name))).await;
            let health: BTreeMap<&str, _> = names
                .iter()
                .map(String::as_str)
                .zip(statuses)
                .collect();
            output::print_json(&health)
        }
    }
}

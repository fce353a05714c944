use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarm_domain::config::Config;
use swarm_sessions::SessionSupervisor;

mod server;
mod tools;

use server::StdioServer;

/// MCP server exposing swarm analysis sessions over stdio.
#[derive(Parser)]
#[command(name = "swarm-mcp", version)]
struct Cli {
    /// Optional JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries JSON-RPC frames; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let supervisor = Arc::new(
        SessionSupervisor::new(config.sessions.clone(), config.host.clone())
            .context("initializing session supervisor")?,
    );

    let mut server = StdioServer::new("swarm-mcp", env!("CARGO_PKG_VERSION"));
    tools::register_session_tools(&mut server, supervisor.clone());
    tracing::info!("registered 3 MCP tools: start_analysis_session, send_message, close_session");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    server
        .run(stdin.lock(), stdout.lock())
        .context("server loop failed")?;

    // Clean EOF: shut every session down before exiting 0.
    supervisor.close_all_sessions();
    Ok(())
}

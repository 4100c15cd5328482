//! Session Manager daemon entry point.
//!
//! Loads configuration from the environment, connects to the container
//! runtime, and serves the MCP tool surface over stdio.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_session_mcp::{config::Config, mcp, runtime::DockerAdapter, session::SessionManager};

#[derive(Parser, Debug)]
#[command(name = "sandbox-session-mcp")]
#[command(about = "MCP server fronting a container runtime for sandboxed code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for the MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        max_sessions = config.max_sessions,
        image = %config.image_name,
        runtime_endpoint = %config.runtime_endpoint,
        "Loaded configuration"
    );

    let runtime = Arc::new(DockerAdapter::connect(&config.runtime_endpoint)?);
    let sessions = Arc::new(SessionManager::new(Arc::new(config), runtime));
    sessions.clone().start_reaper();

    if args.stdio {
        mcp::serve_stdio(sessions).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}

//! Google Workspace MCP Server
//!
//! A Model Context Protocol (MCP) server exposing Google Drive, Docs, Sheets,
//! Slides, Forms and Gmail as tools over stdio.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use google_workspace_mcp::config::Config;
use google_workspace_mcp::error::Result;
use google_workspace_mcp::mcp::server::McpServer;
use google_workspace_mcp::workspace::Workspace;

/// Google Workspace MCP Server
#[derive(Parser)]
#[command(name = "google-workspace-mcp")]
#[command(author, version, about = "Google Workspace MCP Server - Drive, Docs, Sheets, Slides, Forms and Gmail tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize access to Google Workspace (run this first)
    Auth {
        /// Ignore stored credentials and run the browser flow again
        #[arg(long)]
        force: bool,
    },
    /// Delete stored credentials
    Revoke,
    /// Run the MCP server on stdio (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries JSON-RPC, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::new()?;

    match cli.command {
        Some(Commands::Auth { force }) => {
            if !config.client_secrets_exist() {
                eprintln!("Error: OAuth client secrets not found.");
                eprintln!(
                    "Download them from Google Cloud Console and save as {}",
                    config.client_secrets_path.display()
                );
                std::process::exit(1);
            }
            let workspace = Workspace::new(&config);
            workspace.credentials.authenticate(force).await?;
            eprintln!("Authentication completed successfully!");
        }
        Some(Commands::Revoke) => {
            let workspace = Workspace::new(&config);
            workspace.credentials.revoke().await?;
            eprintln!("Stored credentials removed.");
        }
        Some(Commands::Serve) | None => run_server(config).await?,
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let workspace = Arc::new(Workspace::new(&config));

    if !workspace.credentials.is_authenticated().await {
        eprintln!("Error: Not authenticated. Please run 'google-workspace-mcp auth' first.");
        std::process::exit(1);
    }

    info!(
        "Starting Google Workspace MCP server (max {} requests per {}s per service)",
        config.rate_limit.max_requests,
        config.rate_limit.time_window.as_secs()
    );

    Arc::new(McpServer::new(workspace)).run_stdio().await
}

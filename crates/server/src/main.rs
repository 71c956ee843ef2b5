//! quickpage-mcp server entry point.
//!
//! Boots the session engine and serves it as an MCP server on stdio.
//! Logging goes to stderr to avoid interfering with the JSON-RPC protocol on stdout.

use std::sync::Arc;

use anyhow::Result;
use quickpage_client::{Engine, FetchClient, FetchConfig};
use quickpage_core::AppConfig;
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod error;
mod handler;
mod runtime;
mod surface;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(db = %config.db_path.display(), "Starting quickpage-mcp server on stdio transport");

    let fetch = FetchClient::new(FetchConfig::from(&config))?;
    let runtime = Arc::new(runtime::ServerRuntime::new(config.account.clone()));
    let engine = Engine::open(config, runtime.clone()).await?;

    let handler = handler::QuickpageServer::new(Arc::new(engine), runtime, Arc::new(fetch));
    let transport = stdio();
    let server = serve_server(handler, transport).await?;

    server.waiting().await?;

    Ok(())
}

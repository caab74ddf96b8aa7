mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use aceproxy_core::{bootstrap::load_config, logging};
use aceproxy_livestream::ProxyService;

use server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "aceproxy")]
#[command(about = "Stream multiplexing proxy for AceStream engines", long_about = None)]
struct Args {
    /// Config file (YAML or TOML)
    #[arg(long, short, env = "ACEPROXY_CONFIG_PATH")]
    config: Option<String>,

    /// Override the HTTP listen port
    #[arg(long, env = "ACEPROXY_HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fatal on invalid bounds)
    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = args.http_port {
        config.server.http_port = port;
        if let Err(errors) = config.validate() {
            return Err(anyhow::anyhow!("Invalid --http-port: {}", errors.join("; ")));
        }
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("aceproxy starting...");
    info!("HTTP address: {}", config.http_address());
    info!("Engine: {}", config.engine.base_url());

    // 3. Build the proxy service
    let service = ProxyService::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create engine client: {e}"))?;

    // 4. Serve until Ctrl+C / SIGTERM
    let server = ProxyServer::new(config, Arc::new(service));
    server.run().await?;

    info!("aceproxy stopped");
    Ok(())
}

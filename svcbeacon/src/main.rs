mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use svcbeacon_core::{bootstrap::load_config, logging};
use svcbeacon_discovery::{ConsulClient, Service};

#[derive(Parser, Debug)]
#[command(name = "svcbeacon")]
#[command(about = "Registers this process with Consul and keeps its TTL check passing", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "SVCBEACON_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging, then resolve so coercion warnings are recorded
    logging::init_logging(&config.effective_logging())?;
    let settings = config
        .resolve(env!("CARGO_PKG_NAME"))
        .context("Invalid configuration")?;
    info!(
        service = %settings.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "svcbeacon starting..."
    );

    // 3. Discovery backend client
    let backend = ConsulClient::new(&settings.discovery.backend)
        .context("Failed to create discovery backend client")?;
    debug!(backend = %backend.base_url(), "Discovery backend configured");

    // 4. Bind, register and start background tasks
    let service = Service::new(settings, Arc::new(backend))
        .start()
        .await
        .context("Service bring-up failed")?;

    // 5. Serve until shutdown
    server::run(service).await
}

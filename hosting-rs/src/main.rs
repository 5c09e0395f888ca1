//! hosting-rs: virtual-hosting reverse proxy server
//!
//! Registers the configured apps, starts both listeners and serves until
//! interrupted.

use hosting_rs::registry::AppOptions;
use hosting_rs::{HostingConfig, HostingServer};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hosting_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hosting-rs v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if let Some(config_path) = std::env::args().nth(1) {
        info!("Loading configuration from {}", config_path);
        HostingConfig::from_file(Path::new(&config_path))?
    } else {
        info!("No config file specified, using development defaults");
        HostingConfig::development()
    };

    let server = HostingServer::new(config.clone())?;

    // The routing table is rebuilt from configuration at every start
    for app in &config.apps {
        info!("  {} -> {}", app.hostname, app.destination);
        server.add(&app.hostname, AppOptions::from(app))?;
    }

    server.listen().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, draining");
    server.close().await;

    Ok(())
}

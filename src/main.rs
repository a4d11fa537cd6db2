use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod assets;
mod config;
mod error;
mod mods;
mod proxy;
mod resolver;
mod rewrite;

use config::Config;
use proxy::ProxyEngine;

#[derive(Parser, Debug)]
#[command(name = "divortio-proxy")]
#[command(about = "A stealth reverse proxy serving upstream sites under a wildcard domain")]
struct Args {
    /// Override the listen address from the environment.
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,

    /// Validate the configuration and exit.
    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    if args.validate_config {
        info!("configuration is valid for root domain {}", config.root_domain);
        return Ok(());
    }

    info!(
        "starting divortio-proxy for *.{} (cache: {}, stealth: {})",
        config.root_domain, config.cache.enabled, config.features.stealth_mode
    );

    let engine = Arc::new(ProxyEngine::new(Arc::new(config)).await?);

    let server_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start().await {
                error!("server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = server_task => {
            error!("server task exited unexpectedly");
        }
    }

    info!("divortio-proxy shutdown complete");
    Ok(())
}

//! gitdeployd - HTTP trigger daemon
//!
//! Serves `/deploy` for provider webhooks and manual triggers, one deployment
//! at a time per configuration.

mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use gitdeploy_core::{DeployConfig, Deployer, CONFIG_ENV};

#[derive(Parser)]
#[command(name = "gitdeployd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Serve the gitdeploy webhook endpoint", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = CONFIG_ENV, default_value = "deploy.toml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, env = "GITDEPLOY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gitdeploy_core::init_tracing(args.json, level);

    let config = DeployConfig::load(&args.config).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config.display()
        )
    })?;
    // Each request reports these again.
    for problem in config.problems() {
        warn!(problem = %problem, "configuration problem");
    }

    let deployer = Arc::new(Deployer::from_config(config).context("Failed to set up deployer")?);
    let app = http::router(deployer);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "gitdeployd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("gitdeployd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

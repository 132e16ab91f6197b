use anyhow::Context;
use clap::Parser;
use tracing::info;

mod assemble;
mod cli;
mod config;

use crate::assemble::assemble;
use crate::cli::Cli;
use crate::config::FileConfig;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("aicentral failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let raw = std::fs::read(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config))?;
    let file: FileConfig =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", cli.config))?;

    // Merge order: config file, then CLI/ENV on top.
    let mut patch = file.server.patch();
    patch.overlay(cli.server_patch());
    let server = patch.into_config()?;
    info!(
        host = %server.host,
        port = server.port,
        public_host = %server.public_host,
        "config loaded"
    );

    let gateway = assemble(file, server)?;

    let app = aicentral_router::gateway_router(
        gateway.pipeline.clone(),
        gateway.server.public_host.clone(),
    );

    let bind = format!("{}:{}", gateway.server.host, gateway.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aicentral=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

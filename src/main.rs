use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use detstream::app::config::AppConfig;
use detstream::app::App;

#[derive(Parser, Debug)]
#[command(version, about = "Streaming object detection over WebSockets")]
struct Args {
    /// YAML configuration file; built-in defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let app = App::start(config).await?;
    tracing::info!(addr = %app.local_addr(), "ready");

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    tracing::info!("shutting down");
    app.stop().await;
    Ok(())
}

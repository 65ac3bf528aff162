//! Painters server: hosts the shared canvas over WebSocket.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file
//! (`--config`), then individual command-line flags.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use painters_sync::{ServerConfig, SyncServer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "painters-server", about = "Shared 1-bit canvas server", version)]
struct Cli {
    /// JSON config file; missing keys fall back to defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    bind: Option<String>,

    /// Canvas snapshot file, loaded at startup and saved periodically
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Canvas width in cells
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    width: Option<u32>,

    /// Canvas height in cells
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    height: Option<u32>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, BoxError> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("Cannot read config {}: {e}", path.display()))?;
                serde_json::from_str::<ServerConfig>(&text)
                    .map_err(|e| format!("Invalid config {}: {e}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(snapshot) = self.snapshot {
            config.snapshot_path = Some(snapshot);
        }
        if let Some(width) = self.width {
            config.canvas_width = width;
        }
        if let Some(height) = self.height {
            config.canvas_height = height;
        }

        if config.canvas_width == 0 || config.canvas_height == 0 {
            return Err("Canvas dimensions must be positive".into());
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    info!(
        "Starting Painters server on {} ({}x{}, snapshot: {})",
        config.bind_addr,
        config.canvas_width,
        config.canvas_height,
        config
            .snapshot_path
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::new(config);
    server.run_until(shutdown_signal()).await?;

    let stats = server.stats().await;
    info!(
        "Server stopped: {} connections, {} pixels applied, {} full syncs, {} snapshots saved",
        stats.total_connections, stats.pixels_applied, stats.full_syncs, stats.snapshots_saved
    );
    Ok(())
}

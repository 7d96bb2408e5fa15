use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod errors;
mod execution;
mod models;
mod realtime;
mod server;

use config::HiveConfig;

#[derive(Parser)]
#[command(name = "codehive")]
#[command(
    version,
    about = "Real-time project collaboration server with sandboxed code execution"
)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collaboration server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Path to codehive.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind on all interfaces with permissive CORS, for local frontend
        /// development
        #[arg(long)]
        dev: bool,
    },
    /// Run the broadcast relay that fans room events out across server
    /// processes
    Relay {
        /// Port to listen on
        #[arg(long, default_value = "8643")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db,
            config,
            dev,
        } => {
            let mut config = HiveConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db) = db {
                config.server.db_path = db;
            }
            if dev {
                config.server.dev_mode = true;
            }
            server::start_server(config).await
        }
        Commands::Relay { port } => {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
            tracing::info!(addr = %listener.local_addr()?, "broadcast relay listening");
            realtime::relay::run_relay(listener).await
        }
    }
}

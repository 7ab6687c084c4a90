//! Pack store server binary
//!
//! Usage:
//!   pack-server --config /etc/packstore.toml
//!   pack-server --root /srv/packstore --bind 0.0.0.0:4110

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use packstore::config::{Config, ServerConfig, StoreConfig};
use packstore::server::{PackListener, PackServer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "pack-server")]
#[command(about = "Content-addressed pack store server", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// Served directory, overrides the configuration file
    #[arg(short, long)]
    root: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let root = args
                .root
                .clone()
                .context("either --config or --root is required")?;
            Config {
                server: ServerConfig::new(root),
                store: StoreConfig::default(),
            }
        }
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(root) = &args.root {
        config.server.root = root.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str())).init();

    log::info!("pack-server v{}", env!("CARGO_PKG_VERSION"));
    log::info!("  Bind address: {}", config.server.bind);
    log::info!("  Store root: {}", config.server.root.display());

    let server = PackServer::from_config(&config.server)
        .with_context(|| format!("failed to open store at {}", config.server.root.display()))?;
    let listener = PackListener::bind(config.server.bind.as_str(), Arc::new(server))
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    listener.run().context("server error")?;
    Ok(())
}

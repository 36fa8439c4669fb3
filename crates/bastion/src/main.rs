//! Bastion: VPN tunnel with automated download scanning
//!
//! Main entry point. Loads configuration, sets up logging, wires the
//! services together and hands control to the operator console.
//!
//! ## Modules
//! - [`config`]: `bastion.toml` loading
//! - [`context`]: composition root owning the supervisor
//! - [`console`]: line-oriented operator commands

mod config;
mod console;
mod context;

use anyhow::{Context, Result};
use clap::Parser;
use config::AppConfig;
use context::AppContext;
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "bastion", version, about = "VPN tunnel with automated download scanning")]
struct Args {
    /// Configuration file (default: ./bastion.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bring up tunnel, scanning, watcher and guardian before the console starts
    #[arg(long)]
    protect: bool,

    /// WireGuard peer (config name or path) used with --protect
    #[arg(long)]
    peer: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    info!("Bastion starting...");
    let ctx = AppContext::build(config)?;

    if args.protect {
        if let Err(e) = ctx.protect(args.peer.as_deref()) {
            ctx.shutdown();
            return Err(e);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let result = console::run(&ctx, stdin.lock(), &mut stdout);

    ctx.shutdown();
    info!("Bastion shutting down");
    result
}

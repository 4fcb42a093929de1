mod auth;
mod config;
mod connection;
mod db;
mod error;
mod github;
mod regeneration;
mod services;
mod web;

#[cfg(test)]
mod tests;

use std::net::SocketAddrV4;
use std::path::PathBuf;

use clap::Parser;
use config::Config;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Links user accounts to GitHub through the GitHub App or legacy OAuth
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file, defaults to $XDG_CONFIG_HOME/ghlink/config.toml
    #[arg(short, long, env = "GHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Address the web service listens on
    #[arg(long)]
    address: Option<SocketAddrV4>,

    /// SQLite database location
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time())
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(address) = args.address {
        config.web.address = address;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    debug!("Using configuration {config:?}");

    services::start_services(config).await
}

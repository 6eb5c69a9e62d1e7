mod config;
mod coordinator;
mod discovery;
mod ethereum;
mod server;
mod store;
mod tracking;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::{Arg, Command};
use config::Config;
use server::TokenForgeServer;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr; stdout carries the stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let matches = Command::new("token-forge")
        .version("0.1.0")
        .about("Tool server for deploying, minting and recovering ERC-20 tokens")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to use (shardeum-unstable, shardeum-testnet, localhost)"),
        )
        .arg(
            Arg::new("rpc-url")
                .short('r')
                .long("rpc-url")
                .value_name("URL")
                .help("RPC endpoint URL"),
        )
        .arg(
            Arg::new("allow-writes")
                .long("allow-writes")
                .help("Allow write operations (deploy and mint)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache-file")
                .long("cache-file")
                .value_name("FILE")
                .help("Where to keep the deployed-token history"),
        )
        .arg(
            Arg::new("tracking-url")
                .long("tracking-url")
                .value_name("URL")
                .help("Base URL of the interactions tracking API"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("generate-config") {
        let sample_config = Config::generate_sample();
        println!("{}", sample_config);
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    // Explicit --config first, then the default location if it exists
    let config_path = match matches.get_one::<String>("config") {
        Some(path) => Some(PathBuf::from(path)),
        None => Config::default_config_path().ok().filter(|path| path.exists()),
    };
    let mut config = Config::load_or_default(config_path).await;

    if let Some(network) = matches.get_one::<String>("network") {
        ethereum::utils::validate_network(network, &config.available_networks())?;
        config.default_network = network.clone();
    }

    if let Some(rpc_url) = matches.get_one::<String>("rpc-url") {
        if let Some(network_config) = config.networks.get_mut(&config.default_network) {
            network_config.rpc_url = rpc_url.clone();
        }
    }

    if matches.get_flag("allow-writes") {
        config.security.allow_write_operations = true;
    }

    if let Some(cache_file) = matches.get_one::<String>("cache-file") {
        config.storage.cache_path = Some(PathBuf::from(cache_file));
    }

    if let Some(tracking_url) = matches.get_one::<String>("tracking-url") {
        config.tracking.base_url = Some(tracking_url.clone());
    }

    info!("Starting Token Forge");
    info!("Network: {}", config.default_network);
    info!(
        "Write operations allowed: {}",
        config.security.allow_write_operations
    );
    info!("Discovery scan mode: {:?}", config.discovery.scan_mode);

    let server = TokenForgeServer::new(config).await?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}

//! sdwan - Overlay Network Control and Data Plane
//!
//! One binary for every role: the control server, edge clients and the relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sdwan::client::{ClientSettings, TunnelClient};
use sdwan::config::SdwanConfig;
use sdwan::crypto::{generate_key, CryptoContext};
use sdwan::error::{Error, Result};
use sdwan::protocol::Protocol;
use sdwan::relay::RelayServer;
use sdwan::server::{ControlServer, ServerSettings};
use sdwan::tun::TunDevice;

/// sdwan - Overlay Network Control and Data Plane
#[derive(Parser)]
#[command(name = "sdwan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sdwan.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to logging.level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control server
    Server,

    /// Run an edge client (requires root)
    Client,

    /// Run the relay server
    Relay {
        /// Address to listen on (defaults to nat.relay_server:nat.relay_port)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "sdwan.toml")]
        output: PathBuf,

        /// Node ID (generated when omitted)
        #[arg(long)]
        node_id: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Generate a random shared key
    Genkey {
        /// Key size in bytes (defaults to security.key_size)
        #[arg(short, long)]
        size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = cli.log_level.clone().unwrap_or_else(|| {
        SdwanConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Server => run_server(cli.config).await,
        Commands::Client => run_client(cli.config).await,
        Commands::Relay { listen } => run_relay(cli.config, listen).await,
        Commands::Init { output, node_id, force } => run_init(output, node_id, force),
        Commands::Validate => run_validate(cli.config),
        Commands::Genkey { size } => run_genkey(cli.config, size),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: &Path) -> Result<SdwanConfig> {
    match SdwanConfig::from_file(config_path) {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run `sdwan init` to generate one");
            Err(e)
        }
    }
}

fn build_protocol(config: &SdwanConfig) -> Result<Protocol> {
    let crypto = CryptoContext::from_config(&config.security)?;
    if crypto.is_enabled() {
        tracing::info!(
            "Encryption enabled ({}, key id {})",
            crypto.algorithm(),
            crypto.key_fingerprint()
        );
    } else {
        tracing::warn!("Encryption disabled; overlay traffic is sent in the clear");
    }
    Ok(Protocol::new(Arc::new(crypto)))
}

/// Call `stop` once Ctrl-C arrives
fn stop_on_ctrl_c<F>(stop: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                stop();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });
}

/// Run the control server
async fn run_server(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting sdwan control server...");

    let config = load_config(&config_path)?;
    let protocol = build_protocol(&config)?;
    let settings = ServerSettings::from_config(&config).await?;

    let server = Arc::new(ControlServer::bind(&config.server_bind_address(), protocol, settings).await?);
    let stopper = Arc::clone(&server);
    stop_on_ctrl_c(move || stopper.stop());

    server.run().await
}

/// Run an edge client
async fn run_client(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting sdwan client...");

    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::Device("creating a TUN device requires root".into()));
    }

    let mut config = load_config(&config_path)?;
    let protocol = build_protocol(&config)?;
    let settings = ClientSettings::from_config(&mut config).await?;
    let tun = create_tun(&config)?;

    let client = Arc::new(TunnelClient::new(settings, protocol, tun).await?);
    tracing::info!("Node id: {}", client.node_id());
    let stopper = Arc::clone(&client);
    stop_on_ctrl_c(move || stopper.stop());

    client.run().await
}

#[cfg(target_os = "linux")]
fn create_tun(config: &SdwanConfig) -> Result<Arc<dyn TunDevice>> {
    let tun = sdwan::tun::LinuxTun::create(
        &config.client.device_name,
        config.client.address,
        config.client.prefix_len,
        config.client.mtu,
    )?;
    Ok(Arc::new(tun))
}

#[cfg(not(target_os = "linux"))]
fn create_tun(_config: &SdwanConfig) -> Result<Arc<dyn TunDevice>> {
    Err(Error::Device("TUN devices are only supported on Linux".into()))
}

/// Run the relay server
async fn run_relay(config_path: PathBuf, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting sdwan relay...");

    let config = load_config(&config_path)?;
    let listen = listen.unwrap_or_else(|| config.relay_address());

    let relay = Arc::new(RelayServer::bind(&listen, config.relay_idle_timeout()).await?);
    let stopper = Arc::clone(&relay);
    stop_on_ctrl_c(move || stopper.stop());

    relay.run().await
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            output
        )));
    }

    let mut config = SdwanConfig::default();
    config.client.node_id = node_id;
    let node_id = config.ensure_node_id();

    let content = format!("# sdwan Configuration\n# Generated configuration file\n\n{}", config.to_toml()?);
    std::fs::write(&output, content)?;

    println!("Configuration written to {:?}", output);
    println!("  Node ID: {}", node_id);
    println!("Edit server/client addresses, then run `sdwan validate`.");
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match SdwanConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server: {}", config.server_bind_address());
            println!("  Client: {} via {}", config.client.address, config.client.server_address);
            println!("  Node ID: {}", config.client.node_id.as_deref().unwrap_or("(generated at start)"));
            println!("  Advertised routes: {}", config.client.advertise.len());
            println!("  Relay: {}", config.relay_address());
            println!("  Peer timeout: {:?}", config.peer_timeout());
            println!(
                "  Encryption: {}",
                if config.security.encryption { config.security.algorithm.as_str() } else { "off" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Generate a shared key
fn run_genkey(config_path: PathBuf, size: Option<usize>) -> Result<()> {
    let size = size.unwrap_or_else(|| {
        SdwanConfig::from_file(&config_path)
            .map(|c| c.security.key_size)
            .unwrap_or(32)
    });
    println!("{}", generate_key(size)?);
    Ok(())
}
